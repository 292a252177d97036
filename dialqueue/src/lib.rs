//! A queue engine for outbound phone calls.
//!
//! Jobs are submitted with [`DialQueue::submit`], claimed by a pool of
//! workers, placed through a [`provider::CallProvider`], tracked to
//! completion, and the final result delivered via a
//! [`report::ResultReporter`]. Failed calls are retried on a doubling
//! backoff, stuck calls are swept to a missed result, and a recovery
//! monitor requeues work interrupted by a crash.
//!
//! The engine is storage-agnostic: anything implementing
//! [`store::JobStore`] can back it. [`store::memory::InMemoryStore`]
//! ships in this crate; a Redis-backed store lives in the
//! `dialqueue-redis` crate.

use std::sync::Arc;

pub mod agent;
pub mod backoff;
pub mod breaker;
pub mod call;
pub mod config;
pub mod job;
pub mod prelude;
pub mod provider;
pub mod queue;
pub mod recovery;
pub mod report;
pub mod store;

mod reaper;
mod tracker;
mod worker;

use agent::AgentClient;
use config::{QueueConfig, ReaperConfig, RecoveryConfig, TrackingConfig};
use job::{CallJob, JobId, JobStatus};
use provider::CallProvider;
use queue::{CampaignJobSummary, Enqueued, Queue, QueueStatus};
use reaper::Reaper;
use recovery::{RecoveryRunner, Resilience};
use report::ResultReporter;
use serde::Serialize;
use serde_json::Value;
use store::{JobStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracker::Tracker;
use worker::Worker;

/// The call queue engine.
///
/// Owns the worker pool and every background loop. Construct it with
/// [`DialQueue::new`], start it with [`DialQueue::spawn`], and stop it
/// with [`DialQueue::graceful_shutdown`]. All queue operations are
/// available before `spawn`; jobs submitted early are simply picked up
/// once the workers start.
pub struct DialQueue<S>
where
    S: JobStore,
{
    store: S,
    provider: Arc<dyn CallProvider>,
    agent: Arc<dyn AgentClient>,
    reporter: Arc<dyn ResultReporter>,
    queue: Queue<S>,
    resilience: Arc<Resilience>,
    queue_config: QueueConfig,
    tracking_config: TrackingConfig,
    reaper_config: ReaperConfig,
    recovery_config: RecoveryConfig,
    running: bool,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<S> DialQueue<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        provider: Arc<dyn CallProvider>,
        agent: Arc<dyn AgentClient>,
        reporter: Arc<dyn ResultReporter>,
    ) -> Self {
        let queue_config = QueueConfig::default();
        let queue = Queue::new(store.clone(), queue_config.clone());
        let resilience = Resilience::new();
        Self::watch_store(&resilience, &store);
        Self {
            store,
            provider,
            agent,
            reporter,
            queue,
            resilience: Arc::new(resilience),
            queue_config,
            tracking_config: TrackingConfig::local(),
            reaper_config: ReaperConfig::default(),
            recovery_config: RecoveryConfig::default(),
            running: false,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = Queue::new(self.store.clone(), config.clone());
        self.queue_config = config;
        self
    }

    pub fn with_tracking_config(mut self, config: TrackingConfig) -> Self {
        self.tracking_config = config;
        self
    }

    pub fn with_reaper_config(mut self, config: ReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    pub fn with_recovery_config(mut self, config: RecoveryConfig) -> Self {
        self.recovery_config = config;
        self
    }

    /// Replaces the stock resilience registry. The engine's own store
    /// health check is re-registered on the replacement.
    pub fn with_resilience(mut self, resilience: Resilience) -> Self {
        Self::watch_store(&resilience, &self.store);
        self.resilience = Arc::new(resilience);
        self
    }

    fn watch_store(resilience: &Resilience, store: &S) {
        let store = store.clone();
        resilience.register_health_check("store", move || {
            let store = store.clone();
            async move { store.ping().await.is_ok() }
        });
    }

    /// Starts the worker pool, the scheduler sweep, the metrics
    /// refresher, the stuck-call reaper, and the recovery monitor.
    /// Calling `spawn` on an already running engine does nothing.
    pub fn spawn(&mut self) {
        if self.running {
            return;
        }
        let tracker = Tracker::new(
            self.store.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.agent),
            self.tracking_config.clone(),
        );
        for id in 0..self.queue_config.workers {
            let worker = Worker::new(
                id,
                self.queue.clone(),
                tracker.clone(),
                Arc::clone(&self.reporter),
                self.queue_config.clone(),
            );
            self.handles.push(worker.spawn(self.shutdown.child_token()));
        }
        self.handles.push(
            Reaper::new(self.queue.clone(), self.reaper_config.clone())
                .spawn(self.shutdown.child_token()),
        );
        self.handles.push(
            RecoveryRunner::new(
                self.store.clone(),
                Arc::clone(&self.resilience),
                self.recovery_config.clone(),
            )
            .spawn(self.shutdown.child_token()),
        );
        self.handles.push(self.spawn_scheduler_sweep());
        self.handles.push(self.spawn_metrics_refresher());
        self.running = true;
        tracing::info!(
            workers = self.queue_config.workers,
            "Call queue engine started"
        );
    }

    fn spawn_scheduler_sweep(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.queue_config.sweep_interval;
        let cancellation_token = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let _ = queue.promote_due_scheduled().await.inspect_err(|err| {
                            tracing::error!("Scheduled-call sweep failed: {err}");
                        });
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the scheduler sweep");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_metrics_refresher(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.queue_config.metrics_interval;
        let cancellation_token = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let _ = queue.refresh_metrics().await.inspect_err(|err| {
                            tracing::debug!("Failed to refresh queue metrics: {err}");
                        });
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the metrics refresher");
                        break;
                    }
                }
            }
        })
    }

    /// Cancels every background task and waits for all of them to
    /// finish. In-flight calls are abandoned at their next await point;
    /// the recovery monitor requeues them on the next start.
    pub async fn graceful_shutdown(mut self) -> Result<(), DialQueueError> {
        tracing::debug!("Shutting down the call queue engine");
        self.shutdown.cancel();
        self.running = false;
        futures::future::join_all(self.handles.drain(..))
            .await
            .into_iter()
            .map(|result| result.map_err(|_| DialQueueError::GracefulShutdownFailed))
            .collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    /// Enqueues a call, or reports the existing record for a duplicate
    /// id.
    pub async fn submit(&self, job: CallJob) -> Result<Enqueued, DialQueueError> {
        Ok(self.queue.submit(job).await?)
    }

    /// Enqueues a batch, reporting a per-job outcome. One bad job does
    /// not fail the rest.
    pub async fn submit_many(
        &self,
        jobs: Vec<CallJob>,
    ) -> Vec<(JobId, Result<Enqueued, StoreError>)> {
        self.queue.submit_many(jobs).await
    }

    /// Cancels a queued or scheduled call. Jobs already claimed by a
    /// worker cannot be cancelled.
    pub async fn cancel(&self, id: &JobId) -> Result<(), DialQueueError> {
        if self.queue.cancel(id).await? {
            Ok(())
        } else {
            Err(DialQueueError::NotCancellable(id.clone()))
        }
    }

    pub async fn job_snapshot(&self, id: &JobId) -> Result<Option<CallJob>, DialQueueError> {
        Ok(self.queue.job_snapshot(id).await?)
    }

    pub async fn campaign_jobs(
        &self,
        campaign_id: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<CampaignJobSummary>, DialQueueError> {
        Ok(self.queue.campaign_jobs(campaign_id, status).await?)
    }

    /// Records a completion payload pushed by the provider's callback,
    /// ahead of the tracker's own polling.
    pub async fn record_callback_result(
        &self,
        id: &JobId,
        payload: Value,
    ) -> Result<(), DialQueueError> {
        Ok(self.queue.record_callback_result(id, payload).await?)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, DialQueueError> {
        Ok(QueueStatus {
            running: self.running,
            ..self.queue.queue_status().await?
        })
    }

    /// Liveness summary: store reachability plus queue depths.
    pub async fn health(&self) -> ServiceHealth {
        let healthy = self.store.ping().await.is_ok();
        let status = self.queue.queue_status().await.ok();
        ServiceHealth {
            healthy,
            running: self.running,
            queue_size: status
                .as_ref()
                .map(|status| status.queue_size)
                .unwrap_or_default(),
            scheduled_size: status
                .as_ref()
                .map(|status| status.scheduled_size)
                .unwrap_or_default(),
        }
    }

    pub fn resilience(&self) -> &Arc<Resilience> {
        &self.resilience
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> Drop for DialQueue<S>
where
    S: JobStore,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Liveness summary served by [`DialQueue::health`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub running: bool,
    pub queue_size: u64,
    pub scheduled_size: u64,
}

#[derive(Debug, Error)]
pub enum DialQueueError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Job {0} is not queued or scheduled")]
    NotCancellable(JobId),
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::agent::test::ScriptedAgent;
    use crate::breaker::CircuitState;
    use crate::job::Priority;
    use crate::provider::test::ScriptedProvider;
    use crate::provider::ProviderCallStatus;
    use crate::report::test::RecordingReporter;
    use crate::store::memory::InMemoryStore;

    fn job(id: &str) -> CallJob {
        CallJob::new(JobId::new(id).unwrap(), "+15550001111").for_campaign("campaign-1")
    }

    fn view(status: &str, duration: i64) -> ProviderCallStatus {
        ProviderCallStatus {
            status: status.to_owned(),
            duration,
            ..Default::default()
        }
    }

    fn engine() -> DialQueue<InMemoryStore> {
        DialQueue::new(
            InMemoryStore::new(),
            Arc::new(ScriptedProvider::default()),
            Arc::new(ScriptedAgent::default()),
            Arc::new(RecordingReporter::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_engine_processes_a_submitted_call_end_to_end() {
        let provider = ScriptedProvider::default();
        let reporter = RecordingReporter::default();
        let mut engine = DialQueue::new(
            InMemoryStore::new(),
            Arc::new(provider.clone()),
            Arc::new(ScriptedAgent::default()),
            Arc::new(reporter.clone()),
        )
        .with_queue_config(QueueConfig {
            workers: 1,
            ..QueueConfig::default()
        });
        provider.expect_place_returning(Ok(Some("prov-abc".to_owned())));
        provider.expect_status_returning(Ok(view("ringing", 0)));
        provider.expect_status_returning(Ok(view("completed", 42)));
        provider.expect_status_returning(Ok(view("completed", 42)));

        let id = JobId::new("call-42").unwrap();
        engine
            .submit(job("call-42").with_priority(Priority::High))
            .await
            .unwrap();
        engine.spawn();

        // Delivery is the last step of a tick, so once the reporter has
        // the result the whole pipeline has run.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !reporter.delivered().is_empty() {
                break;
            }
        }
        assert_eq!(reporter.delivered().len(), 1, "call never resolved");
        assert_eq!(reporter.delivered()[0]["call_id"], "call-42");
        assert_eq!(reporter.delivered()[0]["duration"], 42);

        let stored = engine.job_snapshot(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.provider_ref.as_deref(), Some("prov-abc"));
        assert!(engine.queue_status().await.unwrap().running);

        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn spawning_twice_does_not_double_the_pool() {
        let mut engine = engine();
        engine.spawn();
        let spawned = engine.handles.len();
        engine.spawn();
        assert_eq!(engine.handles.len(), spawned);
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_rejects_jobs_that_are_not_waiting() {
        let engine = engine();
        engine.submit(job("call-1")).await.unwrap();

        engine.cancel(&JobId::new("call-1").unwrap()).await.unwrap();
        let stored = engine
            .job_snapshot(&JobId::new("call-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);

        let missing = engine.cancel(&JobId::new("call-ghost").unwrap()).await;
        assert_matches!(missing, Err(DialQueueError::NotCancellable(_)));
    }

    #[tokio::test]
    async fn submit_many_reports_per_job_outcomes() {
        let engine = engine();
        engine.submit(job("call-dup")).await.unwrap();

        let results = engine
            .submit_many(vec![job("call-dup"), job("call-new")])
            .await;

        assert_eq!(results.len(), 2);
        assert_matches!(results[0].1, Ok(Enqueued::Duplicate { .. }));
        assert_matches!(results[1].1, Ok(Enqueued::Accepted { .. }));
    }

    #[tokio::test]
    async fn health_reports_store_reachability_and_queue_depths() {
        let engine = engine();
        engine.submit(job("call-1")).await.unwrap();
        engine
            .submit(job("call-2").schedule_at(Utc::now() + TimeDelta::hours(1)))
            .await
            .unwrap();

        let health = engine.health().await;
        assert!(health.healthy);
        assert!(!health.running);
        assert_eq!(health.queue_size, 1);
        assert_eq!(health.scheduled_size, 1);
        assert!(!engine.queue_status().await.unwrap().running);
    }

    #[tokio::test]
    async fn a_fresh_engine_watches_its_own_store() {
        let engine = engine();
        let status = engine.resilience().system_status();
        assert_eq!(status.health_checks, 1);
        assert_eq!(status.breakers["provider"].state, CircuitState::Closed);
        assert!(engine.resilience().unhealthy_services().await.is_empty());
    }
}
