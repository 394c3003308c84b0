// src/scale/scheduler.rs
//
// Periodic poll requests to the scale.
//
// One tokio task per open session sends the configured request frame every
// interval. A tick that finds the previous request still being written is
// skipped rather than queued, so a slow link never accumulates a backlog.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Result of handing one request to the device link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Previous request still in flight; this tick is dropped
    Busy,
    /// Link is gone; the scheduler stops
    Closed,
}

/// Where poll requests go. Must not block.
pub trait RequestSink: Send + Sync {
    fn try_submit(&self, frame: &[u8]) -> SubmitOutcome;
}

/// Notified when a tick is skipped
pub trait PollObserver: Send + Sync {
    fn poll_skipped(&self) {}
}

/// Decrements the live count when the scheduler task ends, however it ends
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PollScheduler {
    stop_tx: Arc<watch::Sender<bool>>,
    handle: JoinHandle<()>,
}

impl PollScheduler {
    /// Start polling. The first request goes out immediately.
    pub fn start(
        interval: Duration,
        request: Vec<u8>,
        sink: Arc<dyn RequestSink>,
        observer: Arc<dyn PollObserver>,
        live: Arc<AtomicUsize>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(live);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match sink.try_submit(&request) {
                            SubmitOutcome::Queued => {}
                            SubmitOutcome::Busy => observer.poll_skipped(),
                            SubmitOutcome::Closed => break,
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Arc::new(stop_tx),
            handle,
        }
    }

    /// Handle that stops this scheduler from another task
    pub fn stopper(&self) -> Arc<watch::Sender<bool>> {
        self.stop_tx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop and wait for the task to exit. No request is sent after this returns.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tlog!("[Poll] Scheduler task panicked: {:?}", e);
            }
        }
    }
}
