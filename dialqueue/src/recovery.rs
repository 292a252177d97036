//! Dependency resilience and crash recovery.
//!
//! [`Resilience`] is the registry tying the per-dependency circuit breakers
//! together with health checks and recovery strategies registered by the
//! embedder. [`RecoveryRunner`] is the background monitor: it runs the
//! health checks, triggers recovery for unhealthy services, requeues jobs
//! interrupted by a crashed worker, and deletes records past the cleanup
//! horizon.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, GuardError};
use crate::config::RecoveryConfig;
use crate::job::{JobPatch, JobStatus};
use crate::store::{JobStore, QueueIndex, StoreError};

type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
type RecoveryStrategy = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Named circuit breakers plus the health-check and recovery registries.
///
/// Breakers are fixed at construction; checks and strategies can be
/// registered at any time through a shared reference.
pub struct Resilience {
    breakers: HashMap<String, CircuitBreaker>,
    health_checks: Mutex<HashMap<String, HealthCheck>>,
    recovery_strategies: Mutex<HashMap<String, RecoveryStrategy>>,
}

impl Default for Resilience {
    fn default() -> Self {
        Self::new()
    }
}

impl Resilience {
    /// Stock registry with a breaker per engine dependency. The provider and
    /// store trip fast and probe early; the report backend is given the
    /// least slack because everything it serves can be retried later.
    pub fn new() -> Self {
        Self::empty()
            .with_breaker("provider", BreakerConfig::new(3, Duration::from_secs(30), 3))
            .with_breaker("agent", BreakerConfig::new(5, Duration::from_secs(60), 3))
            .with_breaker("store", BreakerConfig::new(3, Duration::from_secs(30), 3))
            .with_breaker("backend", BreakerConfig::new(2, Duration::from_secs(120), 3))
    }

    /// A registry with no breakers at all.
    pub fn empty() -> Self {
        Self {
            breakers: HashMap::new(),
            health_checks: Mutex::new(HashMap::new()),
            recovery_strategies: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_breaker(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        self.breakers
            .insert(name.clone(), CircuitBreaker::new(name, config));
        self
    }

    pub fn breaker(&self, name: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(name)
    }

    /// Runs `op` under the named breaker. An unregistered name runs the
    /// operation unprotected rather than failing it.
    pub async fn guard<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, GuardError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.breakers.get(name) {
            Some(breaker) => breaker.guard(op).await,
            None => op().await.map_err(GuardError::Service),
        }
    }

    /// Registers (or replaces) the health check for a service.
    pub fn register_health_check<F, Fut>(&self, name: impl Into<String>, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let check: HealthCheck = Arc::new(move || Box::pin(check()));
        self.lock(&self.health_checks).insert(name.into(), check);
    }

    /// Registers (or replaces) the recovery strategy for a service.
    pub fn register_recovery<F, Fut>(&self, name: impl Into<String>, strategy: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let strategy: RecoveryStrategy = Arc::new(move || Box::pin(strategy()));
        self.lock(&self.recovery_strategies)
            .insert(name.into(), strategy);
    }

    /// Names whose registered health check currently fails.
    pub async fn unhealthy_services(&self) -> Vec<String> {
        let checks: Vec<(String, HealthCheck)> = self
            .lock(&self.health_checks)
            .iter()
            .map(|(name, check)| (name.clone(), Arc::clone(check)))
            .collect();
        let mut unhealthy = Vec::new();
        for (name, check) in checks {
            if !check().await {
                tracing::warn!(service = %name, "Health check failed");
                unhealthy.push(name);
            }
        }
        unhealthy
    }

    /// Runs the registered recovery strategy for each named service.
    pub async fn attempt_recovery(&self, services: &[String]) {
        for name in services {
            let strategy = self.lock(&self.recovery_strategies).get(name).cloned();
            match strategy {
                Some(strategy) => {
                    tracing::info!(service = %name, "Attempting service recovery");
                    strategy().await;
                }
                None => {
                    tracing::debug!(service = %name, "No recovery strategy registered");
                }
            }
        }
    }

    /// Point-in-time view of every breaker and the registry sizes.
    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            breakers: self
                .breakers
                .iter()
                .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
                .collect(),
            health_checks: self.lock(&self.health_checks).len(),
            recovery_strategies: self.lock(&self.recovery_strategies).len(),
            timestamp: Utc::now(),
        }
    }

    // Registry locks are only held for map access, never across an await.
    fn lock<'a, T>(&self, registry: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot served by [`Resilience::system_status`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub breakers: BTreeMap<String, BreakerSnapshot>,
    pub health_checks: usize,
    pub recovery_strategies: usize,
    pub timestamp: DateTime<Utc>,
}

pub(crate) struct RecoveryRunner<S> {
    store: S,
    resilience: Arc<Resilience>,
    config: RecoveryConfig,
}

impl<S> RecoveryRunner<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub(crate) fn new(store: S, resilience: Arc<Resilience>, config: RecoveryConfig) -> Self {
        Self {
            store,
            resilience,
            config,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut delay = self.config.interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        delay = match self.pass().await {
                            Ok(()) => self.config.interval,
                            Err(error) => {
                                tracing::error!("Recovery pass failed: {error}");
                                self.config.error_sleep
                            }
                        };
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the recovery monitor");
                        break;
                    }
                }
            }
        })
    }

    /// One monitoring pass: service health, then interrupted jobs, then
    /// stale-record cleanup.
    async fn pass(&self) -> Result<(), StoreError> {
        let unhealthy = self.resilience.unhealthy_services().await;
        if !unhealthy.is_empty() {
            self.resilience.attempt_recovery(&unhealthy).await;
        }
        let recovered = self.recover_interrupted().await?;
        let removed = self.cleanup_stale().await?;
        if recovered > 0 || removed > 0 {
            tracing::info!(recovered, removed, "Recovery pass finished");
        }
        Ok(())
    }

    /// Requeues processing jobs untouched past the stale threshold; the
    /// worker that owned them is assumed gone. The attempt count goes up but
    /// retries are not capped here, an interrupted job is always considered
    /// salvageable.
    async fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut recovered = 0;
        for job in self.store.all_jobs().await? {
            if job.status != JobStatus::Processing
                || now - job.updated_at < self.config.stale_after
            {
                continue;
            }
            tracing::warn!(
                job_id = %job.id,
                stale_seconds = (now - job.updated_at).num_seconds(),
                "Requeueing a call interrupted mid-processing",
            );
            self.store
                .update(
                    &job.id,
                    JobPatch::status(JobStatus::Queued)
                        .with_retry_count(job.retry_count + 1)
                        .with_error("Recovered after a processing interruption"),
                )
                .await?;
            self.store
                .index_add(QueueIndex::Priority, &job.id, job.priority.queue_score(now))
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Deletes records older than the cleanup horizon, index entries
    /// included.
    async fn cleanup_stale(&self) -> Result<usize, StoreError> {
        let horizon = Utc::now() - self.config.cleanup_after;
        let mut removed = 0;
        for job in self.store.all_jobs().await? {
            if job.created_at >= horizon {
                continue;
            }
            self.store
                .index_remove(QueueIndex::Priority, &job.id)
                .await?;
            self.store
                .index_remove(QueueIndex::Scheduled, &job.id)
                .await?;
            self.store.remove(&job.id).await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "Removed stale call records");
        }
        Ok(removed)
    }
}
