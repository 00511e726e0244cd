//! Bounded worker pool draining the task queue.

use super::{DownloadPayload, JobQueue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handler invoked for every claimed task. Implementations must tolerate
/// replayed payloads.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: DownloadPayload) -> anyhow::Result<()>;
}

/// Pulls tasks from the queue and runs them on a bounded number of
/// concurrent workers. Tasks are acked once the handler returns, success
/// or failure: the job row records failures, and an operator retry is the
/// only re-run mechanism. Unacked claims (crashed process) are reclaimed
/// after the stale threshold.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn TaskHandler>,
    max_concurrent: usize,
    poll_interval: Duration,
    stale_claim_threshold: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn TaskHandler>,
        max_concurrent: usize,
        poll_interval: Duration,
        stale_claim_threshold: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            max_concurrent: max_concurrent.max(1),
            poll_interval,
            stale_claim_threshold,
        }
    }

    /// Main processing loop - call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Worker pool starting (max_concurrent={}, poll_interval={}s)",
            self.max_concurrent,
            self.poll_interval.as_secs()
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("Worker pool shutting down");
                    break;
                }
            }

            match self.queue.reclaim_stale(self.stale_claim_threshold.as_secs() as i64) {
                Ok(count) if count > 0 => {
                    warn!("Reclaimed {} stale queue tasks", count);
                }
                Ok(_) => {}
                Err(e) => error!("Failed to reclaim stale tasks: {e:#}"),
            }

            self.drain_available(&semaphore);
        }

        // Wait for in-flight tasks to finish before returning.
        let _ = semaphore.acquire_many(self.max_concurrent as u32).await;
        info!("Worker pool stopped");
    }

    /// Claim and spawn tasks until the queue is empty or all permits are
    /// taken.
    fn drain_available(&self, semaphore: &Arc<Semaphore>) {
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };

            match self.queue.claim_next() {
                Ok(Some(task)) => {
                    debug!(job_id = %task.payload.job_id, "claimed queue task");
                    let handler = self.handler.clone();
                    let queue = self.queue.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let job_id = task.payload.job_id.clone();
                        if let Err(e) = handler.handle(task.payload).await {
                            warn!(job_id = %job_id, "task handler failed: {e:#}");
                        }
                        if let Err(e) = queue.ack(task.id) {
                            error!(job_id = %job_id, "failed to ack task: {e:#}");
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to claim next task: {e:#}");
                    break;
                }
            }
        }
    }
}
