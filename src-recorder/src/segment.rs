//! Segmented recording lifecycle.
//!
//! `SegmentManager` owns the segment timeline: it arms a single-shot
//! rotation timer, stops/restarts the capture on every rotation, and hands
//! each completed segment to a background worker so transcoding never
//! blocks the next rotation. Segment and gap lists are guarded by one
//! mutex; rotation, stop, and snapshot reads all serialize on it.

use crate::error::RecorderError;
use crate::recording::RecordingController;
use crate::tasks::{DelayedTask, WorkerPool};
use livecap_common::{RecordingPhase, Segment, SegmentsSnapshot};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long to wait for each in-flight conversion when stopping.
const DRAIN_TIMEOUT_PER_JOB: Duration = Duration::from_secs(60);

/// Converts one completed segment. Implemented by the video processor;
/// the seam exists so the lifecycle can be exercised without FFmpeg.
pub trait SegmentProcessor: Send + Sync {
    /// Locate, convert, and store one completed segment. Failures are
    /// logged by the implementation; the return value feeds telemetry.
    fn process_segment(&self, segment: &Segment, broadcast_title: &str) -> bool;
}

struct SegmentState {
    phase: RecordingPhase,
    segments: Vec<Segment>,
    gaps: Vec<i64>,
    current_segment: u32,
    broadcast_title: String,
    timer: Option<DelayedTask>,
}

struct SegmentInner {
    recorder: Arc<RecordingController>,
    processor: Arc<dyn SegmentProcessor>,
    segment_duration: Duration,
    pool: WorkerPool,
    state: Mutex<SegmentState>,
}

/// Owns the repeating segmentation timeline for one broadcast.
pub struct SegmentManager {
    inner: Arc<SegmentInner>,
}

impl SegmentManager {
    pub fn new(
        recorder: Arc<RecordingController>,
        processor: Arc<dyn SegmentProcessor>,
        segment_duration: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SegmentInner {
                recorder,
                processor,
                segment_duration,
                pool: WorkerPool::new("segment-processing"),
                state: Mutex::new(SegmentState {
                    phase: RecordingPhase::Idle,
                    segments: Vec::new(),
                    gaps: Vec::new(),
                    current_segment: 0,
                    broadcast_title: String::new(),
                    timer: None,
                }),
            }),
        }
    }

    /// Start segment 0 and arm the rotation timer. Must be called exactly
    /// once per broadcast.
    pub fn start_segment_recording(
        &self,
        broadcast_id: &str,
        broadcast_title: &str,
    ) -> Result<i64, RecorderError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.phase != RecordingPhase::Idle {
            return Err(RecorderError::AlreadyActive);
        }

        self.inner.recorder.start_recording()?;
        let start_time = chrono::Utc::now().timestamp();

        state.broadcast_title = broadcast_title.to_string();
        let current_segment = state.current_segment;
        state.segments.push(Segment::new(
            current_segment,
            start_time,
            broadcast_id.to_string(),
        ));
        state.phase = RecordingPhase::Active;
        schedule_rotation(&self.inner, &mut state);

        info!(
            "Segment {} recording started at {}",
            state.current_segment, start_time
        );
        Ok(start_time)
    }

    /// Cancel the timer, finalize the active segment, stop the capture,
    /// and block until every background conversion job has completed or
    /// individually timed out.
    pub fn stop_all_segments(&self) {
        info!("Stopping all segment recording");
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }

            if state.phase == RecordingPhase::Active && self.inner.recorder.is_recording() {
                let end_time = chrono::Utc::now().timestamp();
                let completed = finalize_current(&mut state, end_time);
                self.inner.recorder.stop_recording();
                if let Some(segment) = completed {
                    spawn_processing(&self.inner, segment, state.broadcast_title.clone());
                }
            }
            state.phase = RecordingPhase::Stopped;
        }

        self.inner.pool.drain(DRAIN_TIMEOUT_PER_JOB);
        info!("All segment recording stopped");
    }

    /// Snapshot of the timeline for the driver and telemetry.
    pub fn get_segments_info(&self) -> SegmentsSnapshot {
        let state = self.inner.state.lock().unwrap();
        SegmentsSnapshot {
            segments: state.segments.clone(),
            gaps: state.gaps.clone(),
            current_segment: state.current_segment,
            segment_active: state.phase == RecordingPhase::Active,
            processing_jobs: self.inner.pool.active_count(),
        }
    }

    pub fn is_segment_active(&self) -> bool {
        self.inner.state.lock().unwrap().phase == RecordingPhase::Active
    }
}

/// Stamp the active segment's end time and file name; returns a copy for
/// background processing.
fn finalize_current(state: &mut SegmentState, end_time: i64) -> Option<Segment> {
    let idx = state.current_segment as usize;
    let segment = state.segments.get_mut(idx)?;
    segment.end_time = Some(end_time);
    segment.file = Some(Segment::file_name(segment.segment_id));
    info!("Segment {} finalized at {}", segment.segment_id, end_time);
    Some(segment.clone())
}

fn spawn_processing(inner: &Arc<SegmentInner>, segment: Segment, broadcast_title: String) {
    let processor = Arc::clone(&inner.processor);
    let label = format!("segment-{:03}", segment.segment_id);
    inner.pool.spawn(label, move || {
        let id = segment.segment_id;
        debug!("Background processing started for segment {}", id);
        if processor.process_segment(&segment, &broadcast_title) {
            info!("Background processing finished for segment {}", id);
        } else {
            error!("Background processing failed for segment {}", id);
        }
    });
}

fn schedule_rotation(inner: &Arc<SegmentInner>, state: &mut SegmentState) {
    if let Some(timer) = state.timer.take() {
        timer.cancel();
    }
    let for_timer = Arc::clone(inner);
    state.timer = Some(DelayedTask::schedule(inner.segment_duration, move || {
        rotate(&for_timer)
    }));
    debug!(
        "Next segment rotation scheduled in {:?}",
        inner.segment_duration
    );
}

/// Rotation: finalize the current segment, dispatch it for background
/// conversion, restart the capture, and open the next segment. Runs on
/// the timer thread; never lets a failure escape it.
fn rotate(inner: &Arc<SegmentInner>) {
    let mut state = inner.state.lock().unwrap();
    if state.phase != RecordingPhase::Active {
        warn!("Rotation fired while recording is inactive, skipping");
        return;
    }

    let end_time = chrono::Utc::now().timestamp();
    let completed = finalize_current(&mut state, end_time);
    inner.recorder.stop_recording();
    if let Some(segment) = completed {
        spawn_processing(inner, segment, state.broadcast_title.clone());
    }

    match inner.recorder.start_recording() {
        Ok(()) => {
            let start_time = chrono::Utc::now().timestamp();
            let gap_seconds = start_time - end_time;
            state.gaps.push(gap_seconds);
            state.current_segment += 1;
            let broadcast_id = state
                .segments
                .first()
                .map(|s| s.broadcast_id.clone())
                .unwrap_or_default();
            let next = state.current_segment;
            state
                .segments
                .push(Segment::new(next, start_time, broadcast_id));
            info!(
                "Segment {} started at {} (gap: {}s)",
                next, start_time, gap_seconds
            );
            schedule_rotation(inner, &mut state);
        }
        Err(e) => {
            error!(
                "Failed to restart capture after rotation, stopping segmentation: {}",
                e
            );
            state.phase = RecordingPhase::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::CaptureControl;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    struct NoopCapture;

    impl CaptureControl for NoopCapture {
        fn start_capture(&self) -> Result<(), RecorderError> {
            Ok(())
        }
        fn stop_capture(&self) -> Result<(), RecorderError> {
            Ok(())
        }
    }

    /// Fails every capture start after the first one.
    struct FailingRestartCapture {
        started_once: AtomicBool,
    }

    impl CaptureControl for FailingRestartCapture {
        fn start_capture(&self) -> Result<(), RecorderError> {
            if self.started_once.swap(true, Ordering::SeqCst) {
                Err(RecorderError::Capture("browser gone".to_string()))
            } else {
                Ok(())
            }
        }
        fn stop_capture(&self) -> Result<(), RecorderError> {
            Ok(())
        }
    }

    struct RecordingProbe {
        processed: Mutex<Vec<u32>>,
        delay: Duration,
    }

    impl RecordingProbe {
        fn new(delay: Duration) -> Self {
            Self {
                processed: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    impl SegmentProcessor for RecordingProbe {
        fn process_segment(&self, segment: &Segment, _broadcast_title: &str) -> bool {
            thread::sleep(self.delay);
            self.processed.lock().unwrap().push(segment.segment_id);
            true
        }
    }

    fn manager_with(
        capture: impl CaptureControl + 'static,
        probe: Arc<RecordingProbe>,
        duration: Duration,
    ) -> (SegmentManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingController::new(
            Box::new(capture),
            dir.path().to_path_buf(),
        ));
        let manager = SegmentManager::new(recorder, probe, duration);
        (manager, dir)
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let probe = Arc::new(RecordingProbe::new(Duration::ZERO));
        let (manager, _dir) = manager_with(NoopCapture, probe, Duration::from_secs(60));
        manager.start_segment_recording("lv1", "title").unwrap();
        assert!(matches!(
            manager.start_segment_recording("lv1", "title"),
            Err(RecorderError::AlreadyActive)
        ));
        manager.stop_all_segments();
    }

    #[test]
    fn test_single_segment_stop_without_rotation() {
        let probe = Arc::new(RecordingProbe::new(Duration::ZERO));
        let (manager, _dir) =
            manager_with(NoopCapture, Arc::clone(&probe), Duration::from_secs(60));
        let start = manager.start_segment_recording("lv1", "title").unwrap();
        assert!(manager.is_segment_active());

        manager.stop_all_segments();
        assert!(!manager.is_segment_active());

        let snapshot = manager.get_segments_info();
        assert_eq!(snapshot.segments.len(), 1);
        assert!(snapshot.gaps.is_empty());
        assert_eq!(snapshot.processing_jobs, 0);

        let segment = &snapshot.segments[0];
        assert_eq!(segment.segment_id, 0);
        assert_eq!(segment.start_time, start);
        assert!(segment.end_time.unwrap() >= segment.start_time);
        assert_eq!(segment.file.as_deref(), Some("segment_000.mp4"));
        assert_eq!(probe.processed.lock().unwrap().as_slice(), &[0]);
    }

    #[test]
    fn test_rotation_preserves_invariants() {
        let probe = Arc::new(RecordingProbe::new(Duration::ZERO));
        let (manager, _dir) =
            manager_with(NoopCapture, Arc::clone(&probe), Duration::from_millis(200));
        manager.start_segment_recording("lv1", "title").unwrap();

        // Let at least two rotations fire
        thread::sleep(Duration::from_millis(550));
        manager.stop_all_segments();

        let snapshot = manager.get_segments_info();
        assert!(
            snapshot.segments.len() >= 2,
            "expected rotations, got {} segments",
            snapshot.segments.len()
        );
        assert_eq!(snapshot.gaps.len(), snapshot.segments.len() - 1);

        for segment in &snapshot.segments {
            assert!(segment.is_finalized());
            assert!(segment.end_time.unwrap() >= segment.start_time);
            assert_eq!(segment.broadcast_id, "lv1");
        }
        for pair in snapshot.segments.windows(2) {
            assert_eq!(pair[1].segment_id, pair[0].segment_id + 1);
            assert!(pair[1].start_time >= pair[0].end_time.unwrap());
        }

        // Every finalized segment was handed to the processor
        let mut processed = probe.processed.lock().unwrap().clone();
        processed.sort_unstable();
        let expected: Vec<u32> = (0..snapshot.segments.len() as u32).collect();
        assert_eq!(processed, expected);
    }

    #[test]
    fn test_stop_drains_processing_jobs() {
        let probe = Arc::new(RecordingProbe::new(Duration::from_millis(300)));
        let (manager, _dir) =
            manager_with(NoopCapture, Arc::clone(&probe), Duration::from_millis(200));
        manager.start_segment_recording("lv1", "title").unwrap();
        thread::sleep(Duration::from_millis(250));
        manager.stop_all_segments();

        // stop_all_segments must not return before the slow jobs finish
        let snapshot = manager.get_segments_info();
        assert_eq!(snapshot.processing_jobs, 0);
        assert_eq!(
            probe.processed.lock().unwrap().len(),
            snapshot.segments.len()
        );
    }

    #[test]
    fn test_rotation_after_stop_is_noop() {
        let probe = Arc::new(RecordingProbe::new(Duration::ZERO));
        let (manager, _dir) =
            manager_with(NoopCapture, Arc::clone(&probe), Duration::from_secs(60));
        manager.start_segment_recording("lv1", "title").unwrap();
        manager.stop_all_segments();

        let before = manager.get_segments_info();
        rotate(&manager.inner);
        let after = manager.get_segments_info();
        assert_eq!(before.segments.len(), after.segments.len());
        assert_eq!(before.gaps.len(), after.gaps.len());
    }

    #[test]
    fn test_failed_restart_stops_segmentation() {
        let probe = Arc::new(RecordingProbe::new(Duration::ZERO));
        let capture = FailingRestartCapture {
            started_once: AtomicBool::new(false),
        };
        let (manager, _dir) = manager_with(capture, Arc::clone(&probe), Duration::from_millis(100));
        manager.start_segment_recording("lv1", "title").unwrap();

        thread::sleep(Duration::from_millis(400));
        // The rotation's restart failed; the manager must have gone inactive
        assert!(!manager.is_segment_active());

        let snapshot = manager.get_segments_info();
        assert_eq!(snapshot.segments.len(), 1);
        assert!(snapshot.gaps.is_empty());
        assert!(snapshot.segments[0].is_finalized());

        manager.stop_all_segments();
        assert_eq!(probe.processed.lock().unwrap().as_slice(), &[0]);
    }
}
