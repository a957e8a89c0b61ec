//! Capture start/stop control at the browser-automation boundary.
//!
//! The actual recording is performed by an external mechanism (a recording
//! browser extension and whatever automation drives it). This module only
//! models the boundary: a `CaptureControl` backend that can be told to
//! start and stop, and a thin controller that tracks the recording flag
//! and persists a stop-time marker for downstream correlation.

use crate::error::RecorderError;
use livecap_common::StopMarker;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Boundary to the external capture mechanism.
pub trait CaptureControl: Send + Sync {
    fn start_capture(&self) -> Result<(), RecorderError>;
    fn stop_capture(&self) -> Result<(), RecorderError>;
}

/// Drives the capture mechanism through configured shell commands.
///
/// The watch URL and broadcast id are exported to the commands as
/// `LIVECAP_URL` and `LIVECAP_BROADCAST_ID`. An unset command is a no-op,
/// for setups where the extension is armed manually.
pub struct CommandCapture {
    start_command: Option<String>,
    stop_command: Option<String>,
    env: Vec<(String, String)>,
}

impl CommandCapture {
    pub fn new(
        start_command: Option<String>,
        stop_command: Option<String>,
        watch_url: &str,
        broadcast_id: &str,
    ) -> Self {
        Self {
            start_command,
            stop_command,
            env: vec![
                ("LIVECAP_URL".to_string(), watch_url.to_string()),
                ("LIVECAP_BROADCAST_ID".to_string(), broadcast_id.to_string()),
            ],
        }
    }

    fn run(&self, command: &str, what: &str) -> Result<(), RecorderError> {
        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        debug!("Running capture {} command: {}", what, command);
        match cmd.output() {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(RecorderError::Capture(format!(
                    "{} command exited with {:?}: {}",
                    what,
                    output.status.code(),
                    stderr.lines().last().unwrap_or("")
                )))
            }
            Err(e) => Err(RecorderError::Capture(format!(
                "failed to run {} command: {}",
                what, e
            ))),
        }
    }
}

impl CaptureControl for CommandCapture {
    fn start_capture(&self) -> Result<(), RecorderError> {
        match &self.start_command {
            Some(command) => self.run(command, "start"),
            None => {
                debug!("No capture start command configured");
                Ok(())
            }
        }
    }

    fn stop_capture(&self) -> Result<(), RecorderError> {
        match &self.stop_command {
            Some(command) => self.run(command, "stop"),
            None => {
                debug!("No capture stop command configured");
                Ok(())
            }
        }
    }
}

/// Thin state holder over the capture boundary.
pub struct RecordingController {
    backend: Box<dyn CaptureControl>,
    data_dir: PathBuf,
    recording: AtomicBool,
}

impl RecordingController {
    pub fn new(backend: Box<dyn CaptureControl>, data_dir: PathBuf) -> Self {
        Self {
            backend,
            data_dir,
            recording: AtomicBool::new(false),
        }
    }

    pub fn start_recording(&self) -> Result<(), RecorderError> {
        info!("Starting capture");
        self.backend.start_capture()?;
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the capture. A backend failure is logged, not propagated: the
    /// recording flag is cleared either way so the segment lifecycle can
    /// proceed with whatever was captured.
    pub fn stop_recording(&self) {
        info!("Stopping capture");
        if let Err(e) = self.backend.stop_capture() {
            error!("Capture stop failed: {}", e);
        }
        let stop_time = chrono::Utc::now().timestamp();
        if let Err(e) = self.save_stop_marker(stop_time) {
            warn!("Failed to write stop marker: {}", e);
        }
        self.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn save_stop_marker(&self, stop_time: i64) -> Result<(), String> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| format!("failed to create data directory: {}", e))?;
        let marker = StopMarker { stop_time };
        let path = self.data_dir.join(format!("stop_info_{}.json", stop_time));
        let json = serde_json::to_string(&marker)
            .map_err(|e| format!("failed to serialize stop marker: {}", e))?;
        std::fs::write(&path, json).map_err(|e| format!("failed to write {:?}: {}", path, e))?;
        debug!("Stop marker written: {:?}", path);
        Ok(())
    }
}
