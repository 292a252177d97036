//! The worker pool half of the engine.
//!
//! Each worker loops: rate gate, claim the highest-priority job, drive it
//! through the tracker, then route the outcome. Successful and exhausted
//! results are delivered downstream; failures that still have attempts left
//! go back through the retry scheduler and are not reported yet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::call::{self, ResultContext};
use crate::config::QueueConfig;
use crate::job::CallJob;
use crate::queue::{Queue, RetryDecision};
use crate::report::ResultReporter;
use crate::store::JobStore;
use crate::tracker::Tracker;

pub(crate) struct Worker<S> {
    id: usize,
    queue: Queue<S>,
    tracker: Tracker<S>,
    reporter: Arc<dyn ResultReporter>,
    config: QueueConfig,
}

impl<S> Worker<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: usize,
        queue: Queue<S>,
        tracker: Tracker<S>,
        reporter: Arc<dyn ResultReporter>,
        config: QueueConfig,
    ) -> Self {
        Self {
            id,
            queue,
            tracker,
            reporter,
            config,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.tick() => {}
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!(worker = self.id, "Shutting down the call worker");
                        break;
                    }
                }
            }
        })
    }

    async fn tick(&self) {
        self.throttle().await;
        match self.queue.claim_next().await {
            Ok(Some(job)) => self.process(job).await,
            Ok(None) => tokio::time::sleep(self.config.idle_sleep).await,
            Err(error) => {
                tracing::error!(worker = self.id, "Worker loop error: {error}");
                tokio::time::sleep(self.config.error_sleep).await;
            }
        }
    }

    /// Shared per-second dequeue gate. Over the cap means sleeping to the
    /// next second boundary and proceeding; the job itself never fails.
    async fn throttle(&self) {
        match self.queue.rate_limit_count().await {
            Ok(count) if count > self.config.rate_limit_per_second => {
                tracing::debug!(
                    worker = self.id,
                    count,
                    "Rate limit reached, waiting for the next window",
                );
                tokio::time::sleep(until_next_second(Utc::now())).await;
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(worker = self.id, "Failed to read the rate counter: {error}");
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, worker = self.id))]
    async fn process(&self, job: CallJob) {
        tracing::info!(
            phone = %job.phone_number,
            attempt = job.retry_count,
            "Executing call",
        );
        match self.tracker.execute(&job).await {
            Ok(result) => {
                if result.get("status").and_then(Value::as_str) == Some("failed") {
                    let error = result
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("call failed")
                        .to_owned();
                    self.fail(job, &error, result).await;
                } else {
                    let _ = self
                        .queue
                        .complete(&job.id, result.clone())
                        .await
                        .inspect_err(|err| {
                            tracing::error!(?err, "Failed to persist the call result: {err}")
                        });
                    self.deliver(&result).await;
                }
            }
            Err(error) => {
                tracing::error!("Call execution failed: {error}");
                let message = error.to_string();
                // The tracker may have recorded a provider reference before
                // failing; prefer the stored record over the claimed copy.
                let snapshot = self
                    .queue
                    .job_snapshot(&job.id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| job.clone());
                let ctx = ResultContext {
                    job: &snapshot,
                    provider_ref: snapshot.provider_ref.as_deref().unwrap_or(""),
                    method: "system",
                    environment: snapshot.environment.as_deref().unwrap_or("unknown"),
                };
                let result = call::failure_result(&ctx, "system_failure", Some(&message));
                self.fail(job, &message, result).await;
            }
        }
    }

    /// Routes a failed attempt. Only an exhausted job is reported; a
    /// rescheduled one will report when it finally resolves.
    async fn fail(&self, job: CallJob, error: &str, result: Value) {
        match self.queue.retry_or_fail(job, error, result.clone()).await {
            Ok(RetryDecision::Scheduled { .. }) => {}
            Ok(RetryDecision::Exhausted) => self.deliver(&result).await,
            Err(err) => {
                tracing::error!(?err, "Failed to route the failed call: {err}");
            }
        }
    }

    /// Reporting is best effort; a delivery failure never fails the job.
    async fn deliver(&self, result: &Value) {
        let _ = self
            .reporter
            .report(result)
            .await
            .inspect_err(|err| tracing::warn!("Failed to deliver the call result: {err}"));
    }
}

/// Gap between `now` and the next rate-limit window.
fn until_next_second(now: DateTime<Utc>) -> Duration {
    Duration::from_millis(1_000u64.saturating_sub(u64::from(now.timestamp_subsec_millis())))
}
