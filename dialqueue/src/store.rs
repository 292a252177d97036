//! The job store contract.
//!
//! Everything the queue engine needs from durable storage is expressed
//! through [`JobStore`]: one record per job keyed by its identifier, two
//! ordered indexes over job identifiers, a metrics record, and a per-second
//! rate-limit counter. Operations are atomic only at the single-key /
//! single-index-entry granularity; invariants spanning the job record and an
//! index entry are maintained by callers writing the record first, then the
//! index, and treating index membership as the authoritative "still pending"
//! signal.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{CallJob, JobId, JobPatch};

pub mod memory;
pub mod testing;

/// Storage operations required by the queue engine.
///
/// Implementations must guarantee that [`JobStore::index_pop_max`] is an
/// exclusive pop: no two concurrent callers may ever receive the same entry.
#[async_trait]
pub trait JobStore: Clone {
    /// Writes the full job record, replacing any existing record.
    async fn put(&self, job: &CallJob) -> Result<(), StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<CallJob>, StoreError>;

    /// Applies a partial update to an existing record via
    /// [`CallJob::apply_patch`].
    async fn update(&self, id: &JobId, patch: JobPatch) -> Result<(), StoreError>;

    /// Removes the job record. Removing an absent record is not an error.
    async fn remove(&self, id: &JobId) -> Result<(), StoreError>;

    /// Schedules the record for expiry `ttl` from now.
    async fn expire_after(&self, id: &JobId, ttl: TimeDelta) -> Result<(), StoreError>;

    /// Adds or re-scores an entry; an id appears at most once per index.
    async fn index_add(&self, index: QueueIndex, id: &JobId, score: f64)
        -> Result<(), StoreError>;

    /// Atomically removes and returns the highest-scored entry.
    async fn index_pop_max(&self, index: QueueIndex) -> Result<Option<JobId>, StoreError>;

    /// All entries with score at most `max`, in ascending score order.
    async fn index_range_by_score(
        &self,
        index: QueueIndex,
        max: f64,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Removes an entry, reporting whether it was present.
    async fn index_remove(&self, index: QueueIndex, id: &JobId) -> Result<bool, StoreError>;

    async fn index_len(&self, index: QueueIndex) -> Result<u64, StoreError>;

    /// Full scan of all live job records, used by the background sweeps.
    async fn all_jobs(&self) -> Result<Vec<CallJob>, StoreError>;

    /// Increments the shared rate-limit counter for the given epoch second
    /// and returns the new count. Counters expire after a couple of seconds.
    async fn rate_limit_incr(&self, second: i64) -> Result<u64, StoreError>;

    async fn write_metrics(&self, metrics: &QueueMetrics) -> Result<(), StoreError>;

    async fn read_metrics(&self) -> Result<Option<QueueMetrics>, StoreError>;

    /// Cheap connectivity check for health reporting.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// The two ordered indexes over job identifiers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum QueueIndex {
    /// Jobs eligible for a worker to claim now, ordered by the composite
    /// priority score.
    Priority,
    /// Jobs awaiting a future execution time, ordered by that time.
    Scheduled,
}

impl QueueIndex {
    /// Wire name of the index in persisted layouts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "call_queue",
            Self::Scheduled => "scheduled_calls",
        }
    }
}

/// Aggregate queue-size metrics, refreshed on enqueue and by the metrics
/// loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_size: u64,
    pub scheduled_size: u64,
    pub updated_at: DateTime<Utc>,
}

impl QueueMetrics {
    pub fn new(queue_size: u64, scheduled_size: u64) -> Self {
        Self {
            queue_size,
            scheduled_size,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Error encoding or decoding job data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("No job found with id {0}")]
    JobNotFound(JobId),
    #[error("Store connection error: {0}")]
    Connection(String),
    #[error("System in bad state")]
    BadState,
}

impl StoreError {
    /// Wraps a backend-specific transport error. Store implementations in
    /// other crates cannot add `From` impls here, so they construct the
    /// connection variant through this instead.
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }
}
