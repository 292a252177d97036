//! A Redis-backed [`JobStore`] for the dialqueue engine.
//!
//! Job records live in one hash per job under `{namespace}:call_job:{id}`.
//! The `data` field holds the canonical JSON record; the remaining fields
//! are advisory copies of a few columns for inspection over `redis-cli` and
//! are never read back. The two queue indexes are sorted sets, the rate
//! limiter is an `INCR`ed per-second counter with a short TTL, and the
//! metrics record is a small hash.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dialqueue::job::{CallJob, JobId, JobPatch};
use dialqueue::store::{JobStore, QueueIndex, QueueMetrics, StoreError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ToRedisArgs};

/// [`JobStore`] implementation over a Redis connection.
///
/// Cloning is cheap: the underlying [`ConnectionManager`] multiplexes one
/// connection and reconnects on its own.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    namespace: NameSpace,
}

impl RedisJobStore {
    /// Connects under the default `dialqueue` key namespace.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        Self::connect_with_namespace(redis_url, "dialqueue").await
    }

    /// Connects with an explicit key namespace. Stores with different
    /// namespaces on the same server are fully isolated from each other.
    pub async fn connect_with_namespace(
        redis_url: &str,
        namespace: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(StoreError::connection)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(StoreError::connection)?;
        let namespace = NameSpace(namespace.into());
        tracing::debug!(namespace = %namespace.0, "Connected to the Redis job store");
        Ok(Self { conn, namespace })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn put(&self, job: &CallJob) -> Result<(), StoreError> {
        let fields = job_fields(job)?;
        let _: () = self
            .conn
            .clone()
            .hset_multiple(self.namespace.job(&job.id), &fields)
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<CallJob>, StoreError> {
        let data: Option<String> = self
            .conn
            .clone()
            .hget(self.namespace.job(id), "data")
            .await
            .map_err(StoreError::connection)?;
        data.map(|data| serde_json::from_str(&data))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn update(&self, id: &JobId, patch: JobPatch) -> Result<(), StoreError> {
        // A claimed job has a single writer (its worker), so this
        // read-modify-write is not guarded with WATCH.
        let mut job = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
        job.apply_patch(patch);
        self.put(&job).await
    }

    async fn remove(&self, id: &JobId) -> Result<(), StoreError> {
        let _: i64 = self
            .conn
            .clone()
            .del(self.namespace.job(id))
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    async fn expire_after(&self, id: &JobId, ttl: TimeDelta) -> Result<(), StoreError> {
        // PEXPIRE deletes the key outright for a non-positive TTL, which is
        // exactly the contract for `TimeDelta::zero()`.
        let applied: bool = redis::cmd("PEXPIRE")
            .arg(self.namespace.job(id))
            .arg(ttl.num_milliseconds())
            .query_async(&mut self.conn.clone())
            .await
            .map_err(StoreError::connection)?;
        if applied {
            Ok(())
        } else {
            Err(StoreError::JobNotFound(id.clone()))
        }
    }

    async fn index_add(
        &self,
        index: QueueIndex,
        id: &JobId,
        score: f64,
    ) -> Result<(), StoreError> {
        let _: i64 = self
            .conn
            .clone()
            .zadd(self.namespace.index(index), id.as_str(), score)
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    async fn index_pop_max(&self, index: QueueIndex) -> Result<Option<JobId>, StoreError> {
        let mut popped: Vec<(String, f64)> = self
            .conn
            .clone()
            .zpopmax(self.namespace.index(index), 1)
            .await
            .map_err(StoreError::connection)?;
        popped.pop().map(|(member, _)| member_id(member)).transpose()
    }

    async fn index_range_by_score(
        &self,
        index: QueueIndex,
        max: f64,
    ) -> Result<Vec<JobId>, StoreError> {
        let members: Vec<String> = self
            .conn
            .clone()
            .zrangebyscore(self.namespace.index(index), "-inf", max)
            .await
            .map_err(StoreError::connection)?;
        members.into_iter().map(member_id).collect()
    }

    async fn index_remove(&self, index: QueueIndex, id: &JobId) -> Result<bool, StoreError> {
        let removed: bool = self
            .conn
            .clone()
            .zrem(self.namespace.index(index), id.as_str())
            .await
            .map_err(StoreError::connection)?;
        Ok(removed)
    }

    async fn index_len(&self, index: QueueIndex) -> Result<u64, StoreError> {
        self.conn
            .clone()
            .zcard(self.namespace.index(index))
            .await
            .map_err(StoreError::connection)
    }

    async fn all_jobs(&self) -> Result<Vec<CallJob>, StoreError> {
        let mut scan_conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> = scan_conn
                .scan_match(self.namespace.job_pattern())
                .await
                .map_err(StoreError::connection)?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            let data: Option<String> = self
                .conn
                .clone()
                .hget(&key, "data")
                .await
                .map_err(StoreError::connection)?;
            // A record may expire between the scan and the read.
            if let Some(data) = data {
                jobs.push(serde_json::from_str(&data)?);
            }
        }
        Ok(jobs)
    }

    async fn rate_limit_incr(&self, second: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.namespace.rate(second);
        let count: u64 = conn.incr(&key, 1).await.map_err(StoreError::connection)?;
        let _: bool = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(2)
            .query_async(&mut conn)
            .await
            .map_err(StoreError::connection)?;
        Ok(count)
    }

    async fn write_metrics(&self, metrics: &QueueMetrics) -> Result<(), StoreError> {
        let _: () = self
            .conn
            .clone()
            .hset_multiple(self.namespace.metrics(), &metrics_fields(metrics))
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }

    async fn read_metrics(&self) -> Result<Option<QueueMetrics>, StoreError> {
        let raw: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(self.namespace.metrics())
            .await
            .map_err(StoreError::connection)?;
        if raw.is_empty() {
            return Ok(None);
        }
        parse_metrics(&raw).map(Some)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(StoreError::connection)?;
        Ok(())
    }
}

/// Key namespace shared by every record this store writes.
#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn job<'a>(&'a self, id: &'a JobId) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyKind::Job(id),
        }
    }

    fn job_pattern(&self) -> String {
        format!("{}:call_job:*", self.0)
    }

    fn index(&self, index: QueueIndex) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyKind::Index(index),
        }
    }

    fn rate(&self, second: i64) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyKind::Rate(second),
        }
    }

    fn metrics(&self) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyKind::Metrics,
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyKind<'a>,
}

enum KeyKind<'a> {
    Job(&'a JobId),
    Index(QueueIndex),
    Rate(i64),
    Metrics,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match &self.kind {
            KeyKind::Job(id) => write!(f, ":call_job:{id}"),
            KeyKind::Index(index) => write!(f, ":{}", index.as_str()),
            KeyKind::Rate(second) => write!(f, ":rate_limit:{second}"),
            KeyKind::Metrics => write!(f, ":queue_metrics"),
        }
    }
}

impl ToRedisArgs for NameSpacedKey<'_> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

/// Hash fields written for a job record. Every field is written on every
/// put so the advisory columns can never go stale.
fn job_fields(job: &CallJob) -> Result<Vec<(&'static str, String)>, StoreError> {
    Ok(vec![
        ("data", serde_json::to_string(job)?),
        ("status", job.status.as_str().to_owned()),
        ("priority", job.priority.tier().to_string()),
        ("phone_number", job.phone_number.clone()),
        ("campaign_id", job.campaign_id.clone()),
        ("created_at", job.created_at.to_rfc3339()),
        ("provider_ref", job.provider_ref.clone().unwrap_or_default()),
        ("environment", job.environment.clone().unwrap_or_default()),
    ])
}

fn metrics_fields(metrics: &QueueMetrics) -> [(&'static str, String); 3] {
    [
        ("queue_size", metrics.queue_size.to_string()),
        ("scheduled_size", metrics.scheduled_size.to_string()),
        ("updated_at", metrics.updated_at.to_rfc3339()),
    ]
}

fn parse_metrics(raw: &HashMap<String, String>) -> Result<QueueMetrics, StoreError> {
    let queue_size = raw
        .get("queue_size")
        .and_then(|size| size.parse().ok())
        .ok_or(StoreError::BadState)?;
    let scheduled_size = raw
        .get("scheduled_size")
        .and_then(|size| size.parse().ok())
        .ok_or(StoreError::BadState)?;
    let updated_at = raw
        .get("updated_at")
        .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
        .map(|at| at.with_timezone(&Utc))
        .ok_or(StoreError::BadState)?;
    Ok(QueueMetrics {
        queue_size,
        scheduled_size,
        updated_at,
    })
}

fn member_id(member: String) -> Result<JobId, StoreError> {
    JobId::new(member).map_err(|_| StoreError::BadState)
}
