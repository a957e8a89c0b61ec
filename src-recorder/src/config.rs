//! Configuration management for livecap.
//!
//! Handles loading and saving user configuration to platform-standard
//! config directories:
//! - Linux: `~/.config/livecap/config.json`
//! - macOS: `~/Library/Application Support/livecap/config.json`
//! - Windows: `%APPDATA%\livecap\config.json`

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Output-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputConfig {
    /// Custom output base directory. If None, uses the system Videos folder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

/// Recording-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Segment length in seconds.
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u64,
    /// Directory the capture mechanism downloads raw recordings into.
    /// If None, uses the system Downloads folder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_directory: Option<String>,
    /// Shell command that arms the capture mechanism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    /// Shell command that stops the capture mechanism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_command: Option<String>,
}

fn default_segment_duration_secs() -> u64 {
    1800
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: default_segment_duration_secs(),
            download_directory: None,
            start_command: None,
            stop_command: None,
        }
    }
}

/// Broadcast-end monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Base URL of the watch page; the broadcast id is appended.
    #[serde(default = "default_watch_base_url")]
    pub watch_base_url: String,
    /// Seconds between broadcast-end polls.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_watch_base_url() -> String {
    "https://live.nicovideo.jp/watch/".to_string()
}

fn default_check_interval_secs() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            watch_base_url: default_watch_base_url(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Output settings group.
    #[serde(default)]
    pub output: OutputConfig,
    /// Recording settings group.
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Monitoring settings group.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Get the path to the config file.
fn get_config_path() -> Result<PathBuf, String> {
    let proj_dirs =
        ProjectDirs::from("", "", "livecap").ok_or("Could not determine config directory")?;
    Ok(proj_dirs.config_dir().join("config.json"))
}

/// Load configuration from disk.
/// Returns default config if the file doesn't exist or is invalid.
pub fn load_config() -> AppConfig {
    let config_path = match get_config_path() {
        Ok(path) => path,
        Err(e) => {
            warn!("Failed to get config path: {}", e);
            return AppConfig::default();
        }
    };

    if !config_path.exists() {
        info!("No config file found, using defaults");
        return AppConfig::default();
    }

    match fs::read_to_string(&config_path) {
        Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) => {
                info!("Loaded config from {:?}", config_path);
                config
            }
            Err(e) => {
                warn!("Failed to parse config file: {}. Using defaults.", e);
                AppConfig::default()
            }
        },
        Err(e) => {
            warn!("Failed to read config file: {}. Using defaults.", e);
            AppConfig::default()
        }
    }
}

/// Save configuration to disk, creating the config directory if needed.
pub fn save_config(config: &AppConfig) -> Result<(), String> {
    let config_path = get_config_path()?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(&config_path, json).map_err(|e| format!("Failed to write config file: {}", e))?;

    info!("Saved config to {:?}", config_path);
    Ok(())
}

/// Get the default output base directory (system Videos folder).
fn get_default_output_dir() -> Result<PathBuf, String> {
    let user_dirs = UserDirs::new().ok_or("Could not determine user directories")?;

    let output_dir = user_dirs
        .video_dir()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| {
            let home = user_dirs.home_dir().to_path_buf();
            let videos = home.join("Videos");
            if !videos.exists() && fs::create_dir_all(&videos).is_ok() {
                return videos;
            }
            if videos.exists() {
                videos
            } else {
                home
            }
        });

    Ok(output_dir)
}

/// Get the configured output base directory, falling back to the default.
pub fn get_output_dir(config: &AppConfig) -> Result<PathBuf, String> {
    match &config.output.directory {
        Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        _ => get_default_output_dir(),
    }
}

/// Get the configured raw-download directory, falling back to the system
/// Downloads folder.
pub fn get_download_dir(config: &AppConfig) -> Result<PathBuf, String> {
    match &config.recording.download_directory {
        Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        _ => {
            let user_dirs = UserDirs::new().ok_or("Could not determine user directories")?;
            Ok(user_dirs
                .download_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| user_dirs.home_dir().join("Downloads")))
        }
    }
}

/// Replace characters that are invalid in path components, trim
/// whitespace and trailing dots. Empty results become "unknown".
pub fn sanitize_path_component(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    let out = out.trim().trim_end_matches('.');
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.output.directory.is_none());
        assert_eq!(config.recording.segment_duration_secs, 1800);
        assert!(config.recording.start_command.is_none());
        assert_eq!(config.monitor.check_interval_secs, 30);
        assert_eq!(
            config.monitor.watch_base_url,
            "https://live.nicovideo.jp/watch/"
        );
    }

    #[test]
    fn test_config_serialization() {
        let mut config = AppConfig::default();
        config.output.directory = Some("/custom/path".to_string());
        config.recording.segment_duration_secs = 600;
        config.recording.start_command = Some("record-start.sh".to_string());

        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.output.directory, Some("/custom/path".to_string()));
        assert_eq!(parsed.recording.segment_duration_secs, 600);
        assert_eq!(
            parsed.recording.start_command,
            Some("record-start.sh".to_string())
        );
    }

    #[test]
    fn test_empty_directory_not_serialized() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("directory"));
        assert!(!json.contains("start_command"));
    }

    #[test]
    fn test_config_backward_compatible() {
        // Old config without the monitor section loads with defaults
        let json = r#"{"output": {}, "recording": {"segment_duration_secs": 900}}"#;
        let parsed: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.recording.segment_duration_secs, 900);
        assert_eq!(parsed.monitor.check_interval_secs, 30);
    }

    #[test]
    fn test_get_output_dir_prefers_configured() {
        let mut config = AppConfig::default();
        config.output.directory = Some("/tmp/livecap-out".to_string());
        assert_eq!(
            get_output_dir(&config).unwrap(),
            PathBuf::from("/tmp/livecap-out")
        );
    }

    #[test]
    fn test_get_download_dir_prefers_configured() {
        let mut config = AppConfig::default();
        config.recording.download_directory = Some("/tmp/livecap-dl".to_string());
        assert_eq!(
            get_download_dir(&config).unwrap(),
            PathBuf::from("/tmp/livecap-dl")
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("alice"), "alice");
        assert_eq!(sanitize_path_component("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_path_component("  spaced  "), "spaced");
        assert_eq!(sanitize_path_component("dots..."), "dots");
        assert_eq!(sanitize_path_component(""), "unknown");
        assert_eq!(sanitize_path_component("???"), "___");
    }
}
