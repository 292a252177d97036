//! Background reaper for stuck calls.
//!
//! A worker that dies mid-call leaves its job in `processing` forever. The
//! reaper scans on a fixed cadence and force-completes any processing job
//! whose attempt started longer ago than the stuck threshold, writing a
//! synthetic missed result so the campaign side still gets an answer.

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::call;
use crate::config::ReaperConfig;
use crate::job::JobStatus;
use crate::queue::Queue;
use crate::store::{JobStore, StoreError};

pub(crate) struct Reaper<S> {
    queue: Queue<S>,
    config: ReaperConfig,
}

impl<S> Reaper<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub(crate) fn new(queue: Queue<S>, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut delay = self.config.interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        delay = match self.sweep().await {
                            Ok(_) => self.config.interval,
                            Err(error) => {
                                tracing::error!("Stuck-call sweep failed: {error}");
                                self.config.error_sleep
                            }
                        };
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the stuck-call reaper");
                        break;
                    }
                }
            }
        })
    }

    /// One pass over the records, returning how many jobs were reaped.
    async fn sweep(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut reaped = 0;
        for job in self.queue.store().all_jobs().await? {
            if job.status != JobStatus::Processing {
                continue;
            }
            let started = job.started_at.unwrap_or(job.created_at);
            let stuck_for = now - started;
            if stuck_for < self.config.stuck_after {
                continue;
            }
            tracing::warn!(
                job_id = %job.id,
                stuck_seconds = stuck_for.num_seconds(),
                "Forcing a stuck call to a missed result",
            );
            let result = call::stuck_result(&job, stuck_for);
            let _ = self
                .queue
                .complete(&job.id, result)
                .await
                .inspect_err(|err| {
                    tracing::error!(?err, job_id = %job.id, "Failed to reap stuck call: {err}")
                });
            reaped += 1;
        }
        Ok(reaped)
    }
}
