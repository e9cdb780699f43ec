use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::dispatcher::{DrainResult, OutboxDispatcher};
use crate::store::Store;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Counters accumulated by a [`DispatcherWorker`] over its lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: u64,
    pub completed: u64,
    pub released: u64,
    pub failed: u64,
    pub errors: u64,
}

impl WorkerStats {
    fn absorb(&mut self, result: DrainResult) {
        self.completed += result.completed as u64;
        self.released += result.released as u64;
        self.failed += result.failed as u64;
    }
}

/// Background task that polls an [`OutboxDispatcher`] until stopped.
///
/// A full batch is followed immediately by another poll; an empty or partial
/// one waits `poll_interval`. Claim failures back off exponentially up to
/// 30 seconds and never end the loop.
pub struct DispatcherWorker {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl DispatcherWorker {
    pub fn spawn<S: Store>(dispatcher: OutboxDispatcher<S>, poll_interval: Duration) -> Self {
        let (shutdown, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut stats = WorkerStats::default();
            let mut error_backoff = poll_interval;
            info!(?poll_interval, "outbox dispatcher started");

            loop {
                stats.polls += 1;
                let delay = match dispatcher.run_once().await {
                    Ok(result) => {
                        stats.absorb(result);
                        error_backoff = poll_interval;
                        if result.claimed >= dispatcher.config().batch_size && result.claimed > 0 {
                            Duration::ZERO
                        } else {
                            poll_interval
                        }
                    }
                    Err(err) => {
                        stats.errors += 1;
                        error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                        warn!(error = %err, backoff = ?error_backoff, "outbox claim failed");
                        error_backoff
                    }
                };

                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            info!(
                polls = stats.polls,
                completed = stats.completed,
                failed = stats.failed,
                "outbox dispatcher stopped"
            );
            stats
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signals the loop to stop and waits for the batch in flight to finish.
    pub async fn stop(mut self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => WorkerStats::default(),
        }
    }
}

impl Drop for DispatcherWorker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
