//! Recording session wiring and lifecycle.
//!
//! One `RecordingSession` owns everything for one broadcast: the capture
//! controller, the segment manager, the broadcast monitor, and the video
//! processor. Construction performs all fatal setup (directories, HTTP
//! client); teardown is explicit via `finalize`/`cleanup`.

use crate::config::{self, AppConfig};
use crate::error::RecorderError;
use crate::monitor::BroadcastMonitor;
use crate::recording::{CommandCapture, RecordingController};
use crate::segment::{SegmentManager, SegmentProcessor};
use crate::status::StatusProbe;
use crate::video::VideoProcessor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Broadcast descriptor passed on the command line:
/// `<broadcast_id>_<title>_<broadcaster_name>_<broadcaster_id>`.
#[derive(Debug, Clone)]
pub struct BroadcastTag {
    pub broadcast_id: String,
    pub title: String,
    pub broadcaster_name: String,
    pub broadcaster_id: String,
}

impl BroadcastTag {
    pub fn parse(tag: &str) -> Result<Self, RecorderError> {
        let parts: Vec<&str> = tag.split('_').collect();
        if parts.len() < 4 {
            return Err(RecorderError::InvalidTag(format!(
                "expected <id>_<title>_<name>_<account>, got {:?}",
                tag
            )));
        }
        Ok(Self {
            broadcast_id: parts[0].to_string(),
            title: parts[1].to_string(),
            broadcaster_name: parts[2].to_string(),
            broadcaster_id: parts[3].to_string(),
        })
    }
}

/// Context object owning all collaborators for one broadcast recording.
pub struct RecordingSession {
    tag: BroadcastTag,
    monitor: BroadcastMonitor,
    segments: SegmentManager,
    video: Arc<VideoProcessor>,
}

impl RecordingSession {
    /// Wire up a session. Directory creation and HTTP client construction
    /// are the only hard failures in the system; everything after startup
    /// degrades to logged skips.
    pub fn new(
        app_config: &AppConfig,
        tag: BroadcastTag,
        watch_url: &str,
    ) -> Result<Self, RecorderError> {
        let output_base = config::get_output_dir(app_config).map_err(RecorderError::Setup)?;
        let output_dir = output_base.join(format!(
            "{}_{}",
            tag.broadcaster_id,
            config::sanitize_path_component(&tag.broadcaster_name)
        ));
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            RecorderError::Setup(format!(
                "failed to create output directory {:?}: {}",
                output_dir, e
            ))
        })?;
        info!("Output directory: {:?}", output_dir);

        let download_dir = config::get_download_dir(app_config).map_err(RecorderError::Setup)?;
        info!("Download directory: {:?}", download_dir);

        let video = Arc::new(VideoProcessor::new(
            output_dir.join("tmp"),
            output_dir.clone(),
            download_dir,
        ));
        video.setup_tmp_directory().map_err(RecorderError::Setup)?;

        let backend = CommandCapture::new(
            app_config.recording.start_command.clone(),
            app_config.recording.stop_command.clone(),
            watch_url,
            &tag.broadcast_id,
        );
        let recorder = Arc::new(RecordingController::new(
            Box::new(backend),
            output_dir.join("data"),
        ));

        let probe = StatusProbe::new(&app_config.monitor, &tag.broadcast_id)?;
        let monitor = BroadcastMonitor::new(
            tag.broadcast_id.clone(),
            Duration::from_secs(app_config.monitor.check_interval_secs),
            Box::new(probe),
        );

        let segments = SegmentManager::new(
            recorder,
            Arc::clone(&video) as Arc<dyn SegmentProcessor>,
            Duration::from_secs(app_config.recording.segment_duration_secs),
        );

        Ok(Self {
            tag,
            monitor,
            segments,
            video,
        })
    }

    pub fn tag(&self) -> &BroadcastTag {
        &self.tag
    }

    /// Begin segment 0 and start watching for the broadcast end.
    pub fn start(&self) -> Result<i64, RecorderError> {
        let start_time = self
            .segments
            .start_segment_recording(&self.tag.broadcast_id, &self.tag.title)?;
        self.monitor.start_monitoring();
        Ok(start_time)
    }

    pub fn broadcast_ended(&self) -> bool {
        self.monitor.is_broadcast_ended()
    }

    pub fn segment_active(&self) -> bool {
        self.segments.is_segment_active()
    }

    /// Stop everything, drain background conversions, and assemble the
    /// final video. Returns whether a merged video was produced.
    pub fn finalize(&self) -> bool {
        self.monitor.stop_monitoring();
        self.segments.stop_all_segments();

        let snapshot = self.segments.get_segments_info();
        info!(
            "Recording stopped: {} segments, {} gaps",
            snapshot.segments.len(),
            snapshot.gaps.len()
        );
        if snapshot.segments.is_empty() {
            warn!("Nothing was recorded, skipping merge");
            return false;
        }

        self.video
            .merge_all_segments(&self.tag.broadcast_id, &snapshot.segments, &snapshot.gaps)
    }

    pub fn cleanup(&self) {
        self.video.cleanup_tmp_directory();
    }
}
