//! Queue operations over a [`JobStore`].
//!
//! Duplicate-safe enqueue, scheduled-job promotion, claiming, cancellation,
//! retry routing, and the status/metrics read side. Every job is one record
//! plus at most one index entry; the record is written first, and index
//! membership is the authoritative "claimable" signal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::backoff::Strategy;
use crate::config::QueueConfig;
use crate::job::{CallJob, JobId, JobPatch, JobStatus, Priority};
use crate::store::{JobStore, QueueIndex, QueueMetrics, StoreError};

/// How a job is entering the queue.
///
/// Retry re-entries rewrite their own record, so the duplicate guard must
/// not turn them away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submission {
    Fresh,
    Retry,
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// The job was recorded and indexed.
    Accepted { id: JobId, scheduled: bool },
    /// An active record with this id already exists; nothing was written.
    Duplicate { id: JobId },
}

impl Enqueued {
    pub fn id(&self) -> &JobId {
        match self {
            Self::Accepted { id, .. } | Self::Duplicate { id } => id,
        }
    }
}

/// Outcome of routing a failed call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt was scheduled.
    Scheduled { attempt: u32, at: DateTime<Utc> },
    /// Retries are exhausted; the job is now terminally failed.
    Exhausted,
}

/// Summary row served by campaign listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignJobSummary {
    pub call_id: JobId,
    pub phone_number: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl From<CallJob> for CampaignJobSummary {
    fn from(job: CallJob) -> Self {
        Self {
            call_id: job.id,
            phone_number: job.phone_number,
            status: job.status,
            created_at: job.created_at,
            completed_at: job.completed_at,
            retry_count: job.retry_count,
        }
    }
}

/// Queue depths plus the last persisted metrics record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queue_size: u64,
    pub scheduled_size: u64,
    /// Whether the worker pool is currently running.
    pub running: bool,
    pub metrics: Option<QueueMetrics>,
}

#[derive(Clone)]
pub(crate) struct Queue<S> {
    store: S,
    config: QueueConfig,
}

impl<S> Queue<S>
where
    S: JobStore,
{
    pub(crate) fn new(store: S, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) async fn submit(&self, job: CallJob) -> Result<Enqueued, StoreError> {
        self.enqueue(job, Submission::Fresh).await
    }

    /// Per-item submission; one failure does not abort the rest.
    pub(crate) async fn submit_many(
        &self,
        jobs: Vec<CallJob>,
    ) -> Vec<(JobId, Result<Enqueued, StoreError>)> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = job.id.clone();
            let result = self.enqueue(job, Submission::Fresh).await;
            results.push((id, result));
        }
        results
    }

    pub(crate) async fn enqueue(
        &self,
        mut job: CallJob,
        submission: Submission,
    ) -> Result<Enqueued, StoreError> {
        if submission == Submission::Fresh {
            if let Some(existing) = self.store.get(&job.id).await? {
                if !existing.status.is_terminal() {
                    tracing::info!(
                        job_id = %job.id,
                        status = %existing.status,
                        "Duplicate submission, keeping the existing job",
                    );
                    return Ok(Enqueued::Duplicate { id: job.id });
                }
            }
        }

        let now = Utc::now();
        job.updated_at = now;
        let scheduled_at = job.scheduled_at.filter(|at| *at > now);

        // Record first, then index.
        self.store.put(&job).await?;
        let id = job.id.clone();
        match scheduled_at {
            Some(at) => {
                self.store
                    .index_add(QueueIndex::Scheduled, &id, at.timestamp() as f64)
                    .await?;
            }
            None => {
                self.store
                    .index_add(QueueIndex::Priority, &id, job.priority.queue_score(now))
                    .await?;
            }
        }
        let _ = self.refresh_metrics().await.inspect_err(|err| {
            tracing::debug!(?err, "Failed to refresh queue metrics");
        });

        tracing::debug!(
            job_id = %id,
            priority = job.priority.tier(),
            scheduled = scheduled_at.is_some(),
            "Enqueued call",
        );
        Ok(Enqueued::Accepted {
            id,
            scheduled: scheduled_at.is_some(),
        })
    }

    /// Moves every due scheduled job to the immediate queue at normal
    /// priority with fresh recency, returning how many were promoted.
    pub(crate) async fn promote_due_scheduled(&self) -> Result<usize, StoreError> {
        let due = self
            .store
            .index_range_by_score(QueueIndex::Scheduled, Utc::now().timestamp() as f64)
            .await?;
        let mut promoted = 0;
        for id in due {
            // A concurrent sweep may have taken the entry already.
            if !self.store.index_remove(QueueIndex::Scheduled, &id).await? {
                continue;
            }
            self.store
                .index_add(
                    QueueIndex::Priority,
                    &id,
                    Priority::Normal.queue_score(Utc::now()),
                )
                .await?;
            promoted += 1;
        }
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted scheduled jobs to the immediate queue");
        }
        Ok(promoted)
    }

    /// Promotes due scheduled jobs, then claims the highest-priority job and
    /// marks it processing. `None` means the queue is empty.
    pub(crate) async fn claim_next(&self) -> Result<Option<CallJob>, StoreError> {
        self.promote_due_scheduled().await?;
        loop {
            let Some(id) = self.store.index_pop_max(QueueIndex::Priority).await? else {
                return Ok(None);
            };
            match self.store.get(&id).await? {
                None => {
                    // The entry outlived its record (expired or cleaned up).
                    tracing::warn!(job_id = %id, "Claimed queue entry with no job record");
                    continue;
                }
                Some(mut job) => {
                    let started = Utc::now();
                    self.store
                        .update(
                            &id,
                            JobPatch::status(JobStatus::Processing).with_started_at(started),
                        )
                        .await?;
                    job.status = JobStatus::Processing;
                    job.started_at = Some(started);
                    return Ok(Some(job));
                }
            }
        }
    }

    /// Removes a still-pending job from the queue. `false` means the job was
    /// not in either index: already claimed, finished, or never submitted.
    pub(crate) async fn cancel(&self, id: &JobId) -> Result<bool, StoreError> {
        let in_priority = self.store.index_remove(QueueIndex::Priority, id).await?;
        let in_scheduled = self.store.index_remove(QueueIndex::Scheduled, id).await?;
        if !(in_priority || in_scheduled) {
            return Ok(false);
        }
        let patch = JobPatch::status(JobStatus::Cancelled).with_completed_at(Utc::now());
        match self.store.update(id, patch).await {
            // The index entry was stale; removing it was the whole job.
            Err(StoreError::JobNotFound(_)) => {}
            Err(err) => return Err(err),
            Ok(()) => {}
        }
        let _ = self.refresh_metrics().await.inspect_err(|err| {
            tracing::debug!(?err, "Failed to refresh queue metrics");
        });
        tracing::info!(job_id = %id, "Cancelled call");
        Ok(true)
    }

    /// Finishes a job with its result bag and starts the retention clock.
    pub(crate) async fn complete(&self, id: &JobId, result: Value) -> Result<(), StoreError> {
        self.store
            .update(
                id,
                JobPatch::status(JobStatus::Completed)
                    .with_completed_at(Utc::now())
                    .with_result(result),
            )
            .await?;
        self.store.expire_after(id, self.config.retention).await
    }

    /// Routes a failed attempt: schedules another try with doubling delay
    /// while attempts remain, otherwise marks the job terminally failed with
    /// the failure result.
    pub(crate) async fn retry_or_fail(
        &self,
        mut job: CallJob,
        error: &str,
        result: Value,
    ) -> Result<RetryDecision, StoreError> {
        job.retry_count += 1;
        if job.retry_count < job.max_retries {
            let attempt = job.retry_count;
            let at = Utc::now() + self.config.retry.backoff(attempt);
            tracing::warn!(
                job_id = %job.id,
                attempt,
                "Call failed and will be retried at {at}: {error}",
            );
            job.status = JobStatus::RetryPending;
            job.scheduled_at = Some(at);
            job.error = Some(error.to_owned());
            self.enqueue(job, Submission::Retry).await?;
            Ok(RetryDecision::Scheduled { attempt, at })
        } else {
            tracing::error!(
                job_id = %job.id,
                attempts = job.retry_count,
                "Call failed permanently: {error}",
            );
            self.store
                .update(
                    &job.id,
                    JobPatch::status(JobStatus::Failed)
                        .with_error(error)
                        .with_completed_at(Utc::now())
                        .with_retry_count(job.retry_count)
                        .with_result(result),
                )
                .await?;
            self.store.expire_after(&job.id, self.config.retention).await?;
            Ok(RetryDecision::Exhausted)
        }
    }

    /// Applies a pushed completion callback: the result is stored as-is and
    /// the job goes terminal, failed when the reported outcome says so.
    pub(crate) async fn record_callback_result(
        &self,
        id: &JobId,
        payload: Value,
    ) -> Result<(), StoreError> {
        let outcome = payload
            .get("call_outcome")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let status = if matches!(outcome, "missed" | "failed" | "error") {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        tracing::info!(job_id = %id, outcome, "Recording pushed call result");
        self.store
            .update(
                id,
                JobPatch::status(status)
                    .with_completed_at(Utc::now())
                    .with_result(payload),
            )
            .await?;
        self.store.expire_after(id, self.config.retention).await
    }

    pub(crate) async fn job_snapshot(&self, id: &JobId) -> Result<Option<CallJob>, StoreError> {
        self.store.get(id).await
    }

    /// Scan-based listing of a campaign's jobs, newest first.
    pub(crate) async fn campaign_jobs(
        &self,
        campaign_id: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<CampaignJobSummary>, StoreError> {
        let mut summaries: Vec<_> = self
            .store
            .all_jobs()
            .await?
            .into_iter()
            .filter(|job| job.campaign_id == campaign_id)
            .filter(|job| status.map_or(true, |status| job.status == status))
            .map(CampaignJobSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    pub(crate) async fn queue_status(&self) -> Result<QueueStatus, StoreError> {
        Ok(QueueStatus {
            queue_size: self.store.index_len(QueueIndex::Priority).await?,
            scheduled_size: self.store.index_len(QueueIndex::Scheduled).await?,
            running: false,
            metrics: self.store.read_metrics().await?,
        })
    }

    pub(crate) async fn refresh_metrics(&self) -> Result<QueueMetrics, StoreError> {
        let metrics = QueueMetrics::new(
            self.store.index_len(QueueIndex::Priority).await?,
            self.store.index_len(QueueIndex::Scheduled).await?,
        );
        self.store.write_metrics(&metrics).await?;
        Ok(metrics)
    }

    /// Increments and returns this second's shared dequeue counter.
    pub(crate) async fn rate_limit_count(&self) -> Result<u64, StoreError> {
        self.store.rate_limit_incr(Utc::now().timestamp()).await
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::store::memory::InMemoryStore;

    fn queue() -> Queue<InMemoryStore> {
        Queue::new(InMemoryStore::new(), QueueConfig::default())
    }

    fn job(id: &str) -> CallJob {
        CallJob::new(JobId::new(id).unwrap(), "+15550001111").for_campaign("campaign-1")
    }

    #[tokio::test]
    async fn submit_indexes_immediate_jobs() {
        let queue = queue();

        let outcome = queue.submit(job("call-1")).await.unwrap();

        assert_matches!(outcome, Enqueued::Accepted { scheduled: false, .. });
        let stored = queue.job_snapshot(outcome.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        let status = queue.queue_status().await.unwrap();
        assert_eq!(status.queue_size, 1);
        assert_eq!(status.scheduled_size, 0);
        let metrics = status.metrics.unwrap();
        assert_eq!(metrics.queue_size, 1);
    }

    #[tokio::test]
    async fn duplicate_submission_keeps_the_existing_job() {
        let queue = queue();
        queue.submit(job("call-1")).await.unwrap();

        let second = CallJob::new(JobId::new("call-1").unwrap(), "+15559998888");
        let outcome = queue.submit(second).await.unwrap();

        assert_matches!(outcome, Enqueued::Duplicate { .. });
        let stored = queue.job_snapshot(outcome.id()).await.unwrap().unwrap();
        assert_eq!(stored.phone_number, "+15550001111");
        assert_eq!(queue.queue_status().await.unwrap().queue_size, 1);
    }

    #[tokio::test]
    async fn terminal_records_can_be_resubmitted() {
        let queue = queue();
        let outcome = queue.submit(job("call-1")).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue
            .complete(outcome.id(), json!({"call_outcome": "completed"}))
            .await
            .unwrap();

        let resubmitted = queue.submit(job("call-1")).await.unwrap();

        assert_matches!(resubmitted, Enqueued::Accepted { .. });
        let stored = queue.job_snapshot(resubmitted.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn future_schedules_land_in_the_scheduled_index() {
        let queue = queue();

        let outcome = queue
            .submit(job("call-1").schedule_at(Utc::now() + TimeDelta::minutes(10)))
            .await
            .unwrap();

        assert_matches!(outcome, Enqueued::Accepted { scheduled: true, .. });
        let status = queue.queue_status().await.unwrap();
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.scheduled_size, 1);
    }

    #[tokio::test]
    async fn past_schedules_are_immediately_claimable() {
        let queue = queue();

        let outcome = queue
            .submit(job("call-1").schedule_at(Utc::now() - TimeDelta::minutes(10)))
            .await
            .unwrap();

        assert_matches!(outcome, Enqueued::Accepted { scheduled: false, .. });
        assert_eq!(queue.queue_status().await.unwrap().queue_size, 1);
    }

    #[tokio::test]
    async fn due_scheduled_jobs_are_promoted_at_normal_priority() {
        let queue = queue();
        let due = queue
            .submit(job("call-due").schedule_at(Utc::now() + TimeDelta::minutes(5)))
            .await
            .unwrap();
        let later = queue
            .submit(job("call-later").schedule_at(Utc::now() + TimeDelta::hours(2)))
            .await
            .unwrap();
        // Backdate the first entry so the sweep sees it as due.
        let past = (Utc::now() - TimeDelta::seconds(30)).timestamp() as f64;
        queue
            .store()
            .index_add(QueueIndex::Scheduled, due.id(), past)
            .await
            .unwrap();

        let promoted = queue.promote_due_scheduled().await.unwrap();

        assert_eq!(promoted, 1);
        let status = queue.queue_status().await.unwrap();
        assert_eq!(status.queue_size, 1);
        assert_eq!(status.scheduled_size, 1);
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(&claimed.id, due.id());
        assert_eq!(queue.job_snapshot(later.id()).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn claim_returns_jobs_in_priority_order_and_marks_processing() {
        let queue = queue();
        queue
            .submit(job("call-normal").with_priority(Priority::Normal))
            .await
            .unwrap();
        queue
            .submit(job("call-urgent").with_priority(Priority::Urgent))
            .await
            .unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(first.id.as_str(), "call-urgent");
        assert_eq!(first.status, JobStatus::Processing);
        assert!(first.started_at.is_some());

        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(second.id.as_str(), "call-normal");

        assert_matches!(queue.claim_next().await, Ok(None));
    }

    #[tokio::test]
    async fn claim_skips_entries_without_records() {
        let queue = queue();
        queue.submit(job("call-real")).await.unwrap();
        // An orphaned entry that outranks the real job.
        let orphan = JobId::new("call-orphan").unwrap();
        queue
            .store()
            .index_add(
                QueueIndex::Priority,
                &orphan,
                Priority::Urgent.queue_score(Utc::now()),
            )
            .await
            .unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();

        assert_eq!(claimed.id.as_str(), "call-real");
        assert_matches!(queue.claim_next().await, Ok(None));
    }

    #[tokio::test]
    async fn cancel_removes_pending_jobs() {
        let queue = queue();
        let pending = queue.submit(job("call-1")).await.unwrap();
        let scheduled = queue
            .submit(job("call-2").schedule_at(Utc::now() + TimeDelta::hours(1)))
            .await
            .unwrap();

        assert!(queue.cancel(pending.id()).await.unwrap());
        assert!(queue.cancel(scheduled.id()).await.unwrap());

        let status = queue.queue_status().await.unwrap();
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.scheduled_size, 0);
        let stored = queue.job_snapshot(pending.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.completed_at.is_some());

        // Already cancelled and never-submitted jobs are not cancellable.
        assert!(!queue.cancel(pending.id()).await.unwrap());
        assert!(!queue.cancel(&JobId::new("call-ghost").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_cancellable() {
        let queue = queue();
        let outcome = queue.submit(job("call-1")).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        assert!(!queue.cancel(outcome.id()).await.unwrap());
        let stored = queue.job_snapshot(outcome.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn retry_schedules_the_next_attempt_with_doubling_delay() {
        let queue = queue();
        queue.submit(job("call-1")).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        let before = Utc::now();
        let decision = queue
            .retry_or_fail(claimed, "provider unreachable", json!({"status": "failed"}))
            .await
            .unwrap();

        let at = assert_matches!(
            decision,
            RetryDecision::Scheduled { attempt: 1, at } => at
        );
        assert!(at >= before + TimeDelta::minutes(2));
        assert!(at <= Utc::now() + TimeDelta::minutes(2));

        let stored = queue
            .job_snapshot(&JobId::new("call-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::RetryPending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error.as_deref(), Some("provider unreachable"));
        assert_eq!(stored.scheduled_at, Some(at));
        let status = queue.queue_status().await.unwrap();
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.scheduled_size, 1);
    }

    #[tokio::test]
    async fn retries_exhaust_into_terminal_failure() {
        let queue = queue();
        queue.submit(job("call-1").with_max_retries(1)).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        let decision = queue
            .retry_or_fail(claimed, "still unreachable", json!({"call_outcome": "failed"}))
            .await
            .unwrap();

        assert_eq!(decision, RetryDecision::Exhausted);
        let stored = queue
            .job_snapshot(&JobId::new("call-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.result, Some(json!({"call_outcome": "failed"})));
        assert_eq!(queue.queue_status().await.unwrap().scheduled_size, 0);
    }

    #[tokio::test]
    async fn callback_results_map_bad_outcomes_to_failed() {
        let queue = queue();
        let good = queue.submit(job("call-good")).await.unwrap();
        let bad = queue.submit(job("call-bad")).await.unwrap();

        queue
            .record_callback_result(good.id(), json!({"call_outcome": "completed", "duration": 42}))
            .await
            .unwrap();
        queue
            .record_callback_result(bad.id(), json!({"call_outcome": "missed"}))
            .await
            .unwrap();

        let good = queue.job_snapshot(good.id()).await.unwrap().unwrap();
        assert_eq!(good.status, JobStatus::Completed);
        assert!(good.completed_at.is_some());
        assert_eq!(good.result, Some(json!({"call_outcome": "completed", "duration": 42})));
        let bad = queue.job_snapshot(bad.id()).await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn campaign_listing_filters_by_campaign_and_status() {
        let queue = queue();
        queue.submit(job("call-1")).await.unwrap();
        queue.submit(job("call-2")).await.unwrap();
        queue
            .submit(
                CallJob::new(JobId::new("call-other").unwrap(), "+15553334444")
                    .for_campaign("campaign-2"),
            )
            .await
            .unwrap();
        queue.claim_next().await.unwrap();

        let all = queue.campaign_jobs("campaign-1", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let processing = queue
            .campaign_jobs("campaign-1", Some(JobStatus::Processing))
            .await
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].retry_count, 0);

        let other = queue.campaign_jobs("campaign-2", None).await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].call_id.as_str(), "call-other");
    }
}
