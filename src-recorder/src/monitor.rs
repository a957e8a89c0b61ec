//! Broadcast-end monitoring.
//!
//! A background thread polls the status source at a fixed interval and
//! latches a thread-safe "ended" signal. Any error from the source is
//! treated as the broadcast having ended: recording terminates rather
//! than running forever against an unreachable status endpoint. The
//! error is logged first so operators can tell a real end from a
//! network failure.

use crate::status::StatusSource;
use livecap_common::BroadcastStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const SLEEP_TICK: Duration = Duration::from_millis(500);

struct MonitorShared {
    broadcast_id: String,
    check_interval: Duration,
    source: Box<dyn StatusSource>,
    running: AtomicBool,
    ended: Mutex<bool>,
    ended_cv: Condvar,
}

impl MonitorShared {
    fn signal_ended(&self) {
        *self.ended.lock().unwrap() = true;
        self.ended_cv.notify_all();
    }

    /// Interval sleep in small ticks so a stop request is noticed promptly.
    fn sleep_interval(&self) {
        let mut remaining = self.check_interval;
        while self.running.load(Ordering::SeqCst) && remaining > Duration::ZERO {
            let tick = remaining.min(SLEEP_TICK);
            thread::sleep(tick);
            remaining = remaining.saturating_sub(tick);
        }
    }
}

struct MonitorWorker {
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Watches a broadcast for its end on a background thread.
pub struct BroadcastMonitor {
    shared: Arc<MonitorShared>,
    worker: Mutex<Option<MonitorWorker>>,
}

impl BroadcastMonitor {
    pub fn new(
        broadcast_id: String,
        check_interval: Duration,
        source: Box<dyn StatusSource>,
    ) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                broadcast_id,
                check_interval,
                source,
                running: AtomicBool::new(false),
                ended: Mutex::new(false),
                ended_cv: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the polling loop. Idempotent: a second call while the loop
    /// is active is a logged no-op.
    pub fn start_monitoring(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            info!("Broadcast monitor already running");
            return;
        }
        *self.shared.ended.lock().unwrap() = false;

        let shared = Arc::clone(&self.shared);
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            monitor_loop(&shared);
            let _ = done_tx.send(());
        });
        *self.worker.lock().unwrap() = Some(MonitorWorker { done_rx, handle });

        info!(
            "Broadcast end monitoring started: {} (interval: {:?})",
            self.shared.broadcast_id, self.shared.check_interval
        );
    }

    /// Signal the loop to exit and wait for it, bounded by a join timeout.
    /// A loop stuck in a slow network request is left detached.
    pub fn stop_monitoring(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            match worker.done_rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Monitor thread did not stop within {:?}, leaving it detached",
                        JOIN_TIMEOUT
                    );
                }
            }
        }
        info!("Broadcast end monitoring stopped");
    }

    /// Non-blocking read of the ended signal.
    pub fn is_broadcast_ended(&self) -> bool {
        *self.shared.ended.lock().unwrap()
    }

    /// Block until the broadcast ends, or until the timeout elapses.
    /// Returns whether the broadcast had ended when the wait finished.
    #[allow(dead_code)] // Blocking alternative to the driver's poll loop
    pub fn wait_for_broadcast_end(&self, timeout: Option<Duration>) -> bool {
        let guard = self.shared.ended.lock().unwrap();
        match timeout {
            Some(timeout) => {
                let (guard, _) = self
                    .shared
                    .ended_cv
                    .wait_timeout_while(guard, timeout, |ended| !*ended)
                    .unwrap();
                *guard
            }
            None => {
                let guard = self
                    .shared
                    .ended_cv
                    .wait_while(guard, |ended| !*ended)
                    .unwrap();
                *guard
            }
        }
    }
}

fn monitor_loop(shared: &MonitorShared) {
    while shared.running.load(Ordering::SeqCst) {
        let ended = match shared.source.check() {
            Ok(status) => {
                debug!(
                    "Broadcast {} status: {}",
                    shared.broadcast_id,
                    status.as_str()
                );
                status == BroadcastStatus::Ended
            }
            Err(e) => {
                error!(
                    "Status check failed for {}, assuming the broadcast has ended: {}",
                    shared.broadcast_id, e
                );
                true
            }
        };

        if ended {
            info!("Broadcast end detected: {}", shared.broadcast_id);
            shared.signal_ended();
            break;
        }
        shared.sleep_interval();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecorderError;
    use std::sync::atomic::AtomicUsize;

    struct FnSource<F>(F);

    impl<F> StatusSource for FnSource<F>
    where
        F: Fn() -> Result<BroadcastStatus, RecorderError> + Send + Sync,
    {
        fn check(&self) -> Result<BroadcastStatus, RecorderError> {
            (self.0)()
        }
    }

    fn counting_source(
        counter: Arc<AtomicUsize>,
        result: fn() -> Result<BroadcastStatus, RecorderError>,
    ) -> Box<dyn StatusSource> {
        Box::new(FnSource(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            result()
        }))
    }

    #[test]
    fn test_detects_end() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = BroadcastMonitor::new(
            "lv1".to_string(),
            Duration::from_millis(50),
            counting_source(Arc::clone(&counter), || Ok(BroadcastStatus::Ended)),
        );
        assert!(!monitor.is_broadcast_ended());
        monitor.start_monitoring();
        assert!(monitor.wait_for_broadcast_end(Some(Duration::from_secs(5))));
        assert!(monitor.is_broadcast_ended());
        monitor.stop_monitoring();
    }

    #[test]
    fn test_non_ended_statuses_keep_waiting() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = BroadcastMonitor::new(
            "lv1".to_string(),
            Duration::from_millis(20),
            counting_source(Arc::clone(&counter), || Ok(BroadcastStatus::OnAir)),
        );
        monitor.start_monitoring();
        assert!(!monitor.wait_for_broadcast_end(Some(Duration::from_millis(200))));
        assert!(!monitor.is_broadcast_ended());
        assert!(counter.load(Ordering::SeqCst) >= 2);
        monitor.stop_monitoring();
    }

    #[test]
    fn test_network_error_is_fail_safe() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = BroadcastMonitor::new(
            "lv1".to_string(),
            Duration::from_millis(50),
            counting_source(Arc::clone(&counter), || {
                Err(RecorderError::Network("connection refused".to_string()))
            }),
        );
        monitor.start_monitoring();
        // Ended within one poll interval of the failure
        assert!(monitor.wait_for_broadcast_end(Some(Duration::from_secs(5))));
        monitor.stop_monitoring();
    }

    #[test]
    fn test_start_monitoring_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = BroadcastMonitor::new(
            "lv1".to_string(),
            Duration::from_millis(100),
            counting_source(Arc::clone(&counter), || Ok(BroadcastStatus::OnAir)),
        );
        monitor.start_monitoring();
        monitor.start_monitoring();
        thread::sleep(Duration::from_millis(550));
        monitor.stop_monitoring();

        // A single poll loop checks roughly every 100ms; a duplicate loop
        // would double the count.
        let polls = counter.load(Ordering::SeqCst);
        assert!(polls >= 2, "expected some polls, got {}", polls);
        assert!(polls <= 8, "expected one poll loop, got {} polls", polls);
    }

    #[test]
    fn test_stop_monitoring_joins_promptly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = BroadcastMonitor::new(
            "lv1".to_string(),
            Duration::from_secs(30),
            counting_source(Arc::clone(&counter), || Ok(BroadcastStatus::OnAir)),
        );
        monitor.start_monitoring();
        thread::sleep(Duration::from_millis(50));
        let started = std::time::Instant::now();
        monitor.stop_monitoring();
        // The interval sleep ticks every 500ms, so stop is far below the
        // 30s poll interval.
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
