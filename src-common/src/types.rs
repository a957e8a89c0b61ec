//! Shared types for the segmented recording lifecycle.

use serde::{Deserialize, Serialize};

/// Externally observed state of a broadcast.
///
/// Recomputed on every monitor poll; only `Ended` is actionable, every
/// other value means "keep waiting".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastStatus {
    /// Broadcast is currently live
    OnAir,
    /// Broadcast has finished
    Ended,
    /// Broadcast is scheduled but not yet started
    Reserved,
    /// Timeshift (archive) playback
    Timeshift,
    /// Status could not be determined
    Unknown,
    /// No status source responded for this broadcast
    NotFound,
}

impl BroadcastStatus {
    /// Parse the wire representation used by the status API.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ON_AIR" => Some(Self::OnAir),
            "ENDED" => Some(Self::Ended),
            "RESERVED" => Some(Self::Reserved),
            "TIMESHIFT" => Some(Self::Timeshift),
            _ => None,
        }
    }

    /// Wire representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnAir => "ON_AIR",
            Self::Ended => "ENDED",
            Self::Reserved => "RESERVED",
            Self::Timeshift => "TIMESHIFT",
            Self::Unknown => "UNKNOWN",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

/// Lifecycle phase of the segmented recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingPhase {
    /// Not started yet
    Idle,
    /// A segment is currently being recorded
    Active,
    /// Recording has been stopped, no further rotations
    Stopped,
}

/// One fixed-duration recording window.
///
/// `end_time` and `file` stay unset while the segment is being recorded
/// and are stamped exactly once when rotation or the final stop occurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Sequential id, starting at 0
    pub segment_id: u32,
    /// Unix seconds when recording of this segment started
    pub start_time: i64,
    /// Unix seconds when recording of this segment stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Output file name (`segment_{id:03}.mp4`), set at finalization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Correlation key shared by all segments of one broadcast
    pub broadcast_id: String,
}

impl Segment {
    /// Create the active segment for the given id and start time.
    pub fn new(segment_id: u32, start_time: i64, broadcast_id: String) -> Self {
        Self {
            segment_id,
            start_time,
            end_time: None,
            file: None,
            broadcast_id,
        }
    }

    /// Deterministic output file name for a segment id.
    pub fn file_name(segment_id: u32) -> String {
        format!("segment_{:03}.mp4", segment_id)
    }

    /// Whether the segment has been finalized (end stamped, file named).
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some() && self.file.is_some()
    }
}

/// Read-only snapshot of the segment manager, for the driver and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentsSnapshot {
    pub segments: Vec<Segment>,
    /// Dead seconds between consecutive segments; always one shorter
    /// than `segments`
    pub gaps: Vec<i64>,
    pub current_segment: u32,
    pub segment_active: bool,
    /// Conversion jobs still running in the background
    pub processing_jobs: usize,
}

/// Sidecar record persisted next to the final merged video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentsInfo {
    pub broadcast_id: String,
    pub total_segments: usize,
    pub segments: Vec<Segment>,
    pub gaps: Vec<i64>,
    pub final_video: String,
    /// Unix seconds when the merge completed
    pub created_at: i64,
}

/// Marker written every time recording is explicitly stopped, for
/// downstream correlation with the downloaded raw files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopMarker {
    /// Unix seconds of the stop
    pub stop_time: i64,
}
