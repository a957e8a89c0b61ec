//! Delayed tasks and the background processing pool.
//!
//! `DelayedTask` is the single-shot rotation timer: it runs a closure once
//! after a delay unless cancelled first. `WorkerPool` tracks detached
//! worker threads (one per completed segment) and offers a bounded drain
//! so shutdown can wait for in-flight conversions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Single-shot timer thread. The closure runs after `delay` unless
/// `cancel` is called (or the task is dropped) before the delay elapses.
pub struct DelayedTask {
    cancel_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    pub fn schedule<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = mpsc::channel();
        let handle = thread::spawn(move || match cancel_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => f(),
            // Cancelled, or the owning handle was dropped before firing
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        });
        Self {
            cancel_tx,
            handle: Some(handle),
        }
    }

    /// Cancel the task if it has not fired yet. The timer thread exits
    /// promptly; an already-running closure is not interrupted.
    pub fn cancel(mut self) {
        let _ = self.cancel_tx.send(());
        // Detach; the thread observes the cancel signal and exits.
        self.handle.take();
    }
}

struct WorkerJob {
    label: String,
    finished: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Tracks background worker threads so the caller can count live jobs and
/// wait for all of them with a per-job timeout. Workers that outlive the
/// timeout are left running detached, like daemon threads.
pub struct WorkerPool {
    name: &'static str,
    jobs: Mutex<Vec<WorkerJob>>,
}

impl WorkerPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a worker thread and track it for a later drain.
    pub fn spawn<F>(&self, label: String, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            f();
            flag.store(true, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
        debug!("{} job spawned: {}", self.name, label);
        self.jobs.lock().unwrap().push(WorkerJob {
            label,
            finished,
            done_rx,
            handle,
        });
    }

    /// Number of tracked jobs that have not finished yet.
    pub fn active_count(&self) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|job| !job.finished.load(Ordering::SeqCst))
            .count()
    }

    /// Wait for every tracked job, giving each at most `per_job_timeout`.
    /// Jobs that time out are logged and left running; they no longer
    /// count toward `active_count`.
    pub fn drain(&self, per_job_timeout: Duration) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
        let total = jobs.len();
        for (i, job) in jobs.into_iter().enumerate() {
            info!(
                "Waiting for {} job {}/{} ({})",
                self.name,
                i + 1,
                total,
                job.label
            );
            let done = job.finished.load(Ordering::SeqCst)
                || job.done_rx.recv_timeout(per_job_timeout).is_ok();
            if done {
                if job.handle.join().is_err() {
                    warn!("{} job {} panicked", self.name, job.label);
                }
            } else {
                warn!(
                    "{} job {} did not finish within {:?}, leaving it running",
                    self.name, job.label, per_job_timeout
                );
            }
        }
    }
}
