//! Platform-specific logging directory resolution.

use std::path::PathBuf;

/// Returns the platform-appropriate directory for log files.
///
/// | Platform | Directory |
/// |----------|-----------|
/// | Linux | `$XDG_STATE_HOME/livecap/logs` or `~/.local/state/livecap/logs` |
/// | macOS | `~/Library/Logs/livecap` |
/// | Windows | `%LOCALAPPDATA%\livecap\livecap\logs` |
pub fn log_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let base = directories::ProjectDirs::from("", "", "livecap")
            .expect("Failed to determine project directories");
        base.state_dir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| base.data_local_dir().join("state"))
            .join("logs")
    }

    #[cfg(target_os = "macos")]
    {
        // ~/Library/Logs/<app>/ is the standard macOS log location.
        // `directories` doesn't expose this path directly, so we derive it
        // from the data_local_dir (~/Library/Application Support/livecap) by
        // walking up to ~/Library and appending "Logs/livecap".
        let base = directories::ProjectDirs::from("", "", "livecap")
            .expect("Failed to determine project directories");
        let library = base
            .data_local_dir()
            .parent()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| base.data_local_dir().to_path_buf());
        library.join("Logs").join("livecap")
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let base = directories::ProjectDirs::from("", "", "livecap")
            .expect("Failed to determine project directories");
        base.data_local_dir().join("logs")
    }
}

/// Ensures the log directory exists, creating it if necessary.
pub fn ensure_log_dir() -> Result<(), std::io::Error> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(())
}

/// Base file name for the recorder log; the rolling appender adds the
/// date suffix (e.g. `livecap-recorder.log.2026-08-06`).
pub const LOG_FILE_PREFIX: &str = "livecap-recorder.log";
