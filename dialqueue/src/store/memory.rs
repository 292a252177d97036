//! An in-memory implementation of the [`JobStore`] trait.
//!
//! This store is useful for testing purposes and simple examples, it is not
//! designed for production use.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{CallJob, JobId, JobPatch};
use crate::store::{JobStore, QueueIndex, QueueMetrics, StoreError};

/// How long a rate-limit counter slot outlives its epoch second.
const RATE_COUNTER_LINGER_SECONDS: i64 = 2;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, StoredJob>>>,
    indexes: Arc<RwLock<HashMap<QueueIndex, Vec<IndexEntry>>>>,
    rate_counters: Arc<RwLock<HashMap<i64, u64>>>,
    metrics: Arc<RwLock<Option<QueueMetrics>>>,
}

struct StoredJob {
    job: CallJob,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredJob {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct IndexEntry {
    score: f64,
    id: JobId,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Drops the record if its expiry has passed, mirroring how a store with
    /// native key expiry would behave on the next access.
    fn evict_if_expired(jobs: &mut HashMap<JobId, StoredJob>, id: &JobId, now: DateTime<Utc>) {
        if jobs.get(id).is_some_and(|stored| stored.is_expired(now)) {
            jobs.remove(id);
        }
    }
}

/// Highest score wins; equal scores resolve to the lexicographically
/// greatest id.
fn pop_order(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    a.score
        .partial_cmp(&b.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.as_str().cmp(b.id.as_str()))
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn put(&self, job: &CallJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        // An overwrite keeps any pending expiry on the record.
        let expires_at = jobs.get(&job.id).and_then(|stored| stored.expires_at);
        jobs.insert(
            job.id.clone(),
            StoredJob {
                job: job.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<CallJob>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Self::evict_if_expired(&mut jobs, id, Utc::now());
        Ok(jobs.get(id).map(|stored| stored.job.clone()))
    }

    async fn update(&self, id: &JobId, patch: JobPatch) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Self::evict_if_expired(&mut jobs, id, Utc::now());
        match jobs.get_mut(id) {
            None => Err(StoreError::JobNotFound(id.clone())),
            Some(stored) => {
                stored.job.apply_patch(patch);
                Ok(())
            }
        }
    }

    async fn remove(&self, id: &JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        jobs.remove(id);
        Ok(())
    }

    async fn expire_after(&self, id: &JobId, ttl: TimeDelta) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let now = Utc::now();
        Self::evict_if_expired(&mut jobs, id, now);
        match jobs.get_mut(id) {
            None => Err(StoreError::JobNotFound(id.clone())),
            Some(stored) => {
                stored.expires_at = Some(now + ttl);
                Ok(())
            }
        }
    }

    async fn index_add(
        &self,
        index: QueueIndex,
        id: &JobId,
        score: f64,
    ) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write().map_err(|_| StoreError::BadState)?;
        let entries = indexes.entry(index).or_default();
        entries.retain(|entry| entry.id != *id);
        entries.push(IndexEntry {
            score,
            id: id.clone(),
        });
        Ok(())
    }

    async fn index_pop_max(&self, index: QueueIndex) -> Result<Option<JobId>, StoreError> {
        let mut indexes = self.indexes.write().map_err(|_| StoreError::BadState)?;
        let entries = match indexes.get_mut(&index) {
            None => return Ok(None),
            Some(entries) => entries,
        };
        let position = entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| pop_order(a, b))
            .map(|(position, _)| position);
        Ok(position.map(|position| entries.swap_remove(position).id))
    }

    async fn index_range_by_score(
        &self,
        index: QueueIndex,
        max: f64,
    ) -> Result<Vec<JobId>, StoreError> {
        let indexes = self.indexes.read().map_err(|_| StoreError::BadState)?;
        let mut due: Vec<_> = indexes
            .get(&index)
            .into_iter()
            .flatten()
            .filter(|entry| entry.score <= max)
            .map(|entry| (entry.score, entry.id.clone()))
            .collect();
        due.sort_by(|(score_a, id_a), (score_b, id_b)| {
            score_a
                .partial_cmp(score_b)
                .unwrap_or(Ordering::Equal)
                .then_with(|| id_a.as_str().cmp(id_b.as_str()))
        });
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn index_remove(&self, index: QueueIndex, id: &JobId) -> Result<bool, StoreError> {
        let mut indexes = self.indexes.write().map_err(|_| StoreError::BadState)?;
        let entries = match indexes.get_mut(&index) {
            None => return Ok(false),
            Some(entries) => entries,
        };
        match entries.iter().position(|entry| entry.id == *id) {
            None => Ok(false),
            Some(position) => {
                entries.swap_remove(position);
                Ok(true)
            }
        }
    }

    async fn index_len(&self, index: QueueIndex) -> Result<u64, StoreError> {
        let indexes = self.indexes.read().map_err(|_| StoreError::BadState)?;
        Ok(indexes
            .get(&index)
            .map(|entries| entries.len() as u64)
            .unwrap_or_default())
    }

    async fn all_jobs(&self) -> Result<Vec<CallJob>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let now = Utc::now();
        jobs.retain(|_, stored| !stored.is_expired(now));
        Ok(jobs.values().map(|stored| stored.job.clone()).collect())
    }

    async fn rate_limit_incr(&self, second: i64) -> Result<u64, StoreError> {
        let mut counters = self.rate_counters.write().map_err(|_| StoreError::BadState)?;
        counters.retain(|slot, _| *slot + RATE_COUNTER_LINGER_SECONDS >= second);
        let count = counters.entry(second).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn write_metrics(&self, metrics: &QueueMetrics) -> Result<(), StoreError> {
        let mut slot = self.metrics.write().map_err(|_| StoreError::BadState)?;
        *slot = Some(metrics.clone());
        Ok(())
    }

    async fn read_metrics(&self) -> Result<Option<QueueMetrics>, StoreError> {
        let slot = self.metrics.read().map_err(|_| StoreError::BadState)?;
        Ok(slot.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(())
    }
}
