//! Testing utilities for implementers of the [`JobStore`] trait.
//!
//! Store implementations in other crates can instantiate the full
//! conformance suite with the [`test_suite`] macro rather than re-deriving
//! the contract from the trait documentation.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use crate::job::{CallJob, JobId, JobPatch, JobStatus, Priority};
use crate::store::{JobStore, QueueIndex, QueueMetrics, StoreError};

/// Instantiates the [`JobStore`] conformance test suite against a concrete
/// store.
///
/// For a store with a synchronous constructor:
///
/// ```
/// use dialqueue::store::memory::InMemoryStore;
/// use dialqueue::store::testing::test_suite;
///
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// The constructor expression is evaluated inside each test body, so stores
/// that connect asynchronously can await it, and custom test attributes can
/// be supplied via the long form. Stores needing external infrastructure
/// typically add `ignore` so the suite only runs when opted in:
///
/// ```ignore
/// test_suite!(
///     attrs: [tokio::test, ignore = "requires a running Redis server"],
///     args: (),
///     backend: RedisJobStore::connect("redis://localhost:6379").await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attrs: [tokio::test], args: (), backend: $store);
    };
    (attrs: [$($attr:meta),+], args: $args:tt, backend: $store:expr) => {
        $(#[$attr])+
        async fn put_and_get_round_trips_a_job $args {
            let store = $store;
            $crate::store::testing::put_and_get_round_trips_a_job(store).await;
        }

        $(#[$attr])+
        async fn get_returns_none_for_missing_job $args {
            let store = $store;
            $crate::store::testing::get_returns_none_for_missing_job(store).await;
        }

        $(#[$attr])+
        async fn update_patches_only_the_given_fields $args {
            let store = $store;
            $crate::store::testing::update_patches_only_the_given_fields(store).await;
        }

        $(#[$attr])+
        async fn update_returns_job_not_found_for_missing_job $args {
            let store = $store;
            $crate::store::testing::update_returns_job_not_found_for_missing_job(store).await;
        }

        $(#[$attr])+
        async fn remove_deletes_the_record $args {
            let store = $store;
            $crate::store::testing::remove_deletes_the_record(store).await;
        }

        $(#[$attr])+
        async fn expire_after_drops_the_record_once_elapsed $args {
            let store = $store;
            $crate::store::testing::expire_after_drops_the_record_once_elapsed(store).await;
        }

        $(#[$attr])+
        async fn expire_after_returns_job_not_found_for_missing_job $args {
            let store = $store;
            $crate::store::testing::expire_after_returns_job_not_found_for_missing_job(store)
                .await;
        }

        $(#[$attr])+
        async fn pop_returns_jobs_in_priority_order $args {
            let store = $store;
            $crate::store::testing::pop_returns_jobs_in_priority_order(store).await;
        }

        $(#[$attr])+
        async fn pop_on_empty_index_returns_none $args {
            let store = $store;
            $crate::store::testing::pop_on_empty_index_returns_none(store).await;
        }

        $(#[$attr])+
        async fn pop_breaks_score_ties_by_greatest_id $args {
            let store = $store;
            $crate::store::testing::pop_breaks_score_ties_by_greatest_id(store).await;
        }

        $(#[$attr])+
        async fn index_add_rescores_an_existing_entry $args {
            let store = $store;
            $crate::store::testing::index_add_rescores_an_existing_entry(store).await;
        }

        $(#[$attr])+
        async fn range_by_score_returns_due_entries_in_order $args {
            let store = $store;
            $crate::store::testing::range_by_score_returns_due_entries_in_order(store).await;
        }

        $(#[$attr])+
        async fn index_remove_reports_prior_membership $args {
            let store = $store;
            $crate::store::testing::index_remove_reports_prior_membership(store).await;
        }

        $(#[$attr])+
        async fn index_len_counts_entries $args {
            let store = $store;
            $crate::store::testing::index_len_counts_entries(store).await;
        }

        $(#[$attr])+
        async fn indexes_do_not_share_entries $args {
            let store = $store;
            $crate::store::testing::indexes_do_not_share_entries(store).await;
        }

        $(#[$attr])+
        async fn rate_limit_counts_within_a_second $args {
            let store = $store;
            $crate::store::testing::rate_limit_counts_within_a_second(store).await;
        }

        $(#[$attr])+
        async fn metrics_round_trip $args {
            let store = $store;
            $crate::store::testing::metrics_round_trip(store).await;
        }

        $(#[$attr])+
        async fn all_jobs_returns_every_stored_record $args {
            let store = $store;
            $crate::store::testing::all_jobs_returns_every_stored_record(store).await;
        }

        $(#[$attr])+
        async fn ping_succeeds $args {
            let store = $store;
            $crate::store::testing::ping_succeeds(store).await;
        }
    };
}
pub use test_suite;

/// Convenience accessors shared by the conformance tests.
#[doc(hidden)]
#[async_trait]
pub trait StoreTesting: JobStore + Sync {
    async fn insert(&self, job: &CallJob) {
        self.put(job).await.expect("failed to store job");
    }

    async fn job(&self, id: &JobId) -> CallJob {
        self.get(id)
            .await
            .expect("failed to read job")
            .expect("no job stored under this id")
    }
}

impl<T> StoreTesting for T where T: JobStore + Sync {}

fn sample_job(id: &str) -> CallJob {
    CallJob::new(
        JobId::new(id).expect("test ids are non-empty"),
        "+15555550100",
    )
    .for_campaign("campaign-test")
}

#[doc(hidden)]
pub async fn put_and_get_round_trips_a_job(store: impl StoreTesting) {
    let job = sample_job("call-1")
        .with_priority(Priority::High)
        .schedule_at(Utc::now() + TimeDelta::minutes(5));
    store.insert(&job).await;

    assert_eq!(store.job(&job.id).await, job);
}

#[doc(hidden)]
pub async fn get_returns_none_for_missing_job(store: impl StoreTesting) {
    let id = JobId::new("call-ghost").unwrap();

    assert!(matches!(store.get(&id).await, Ok(None)));
}

#[doc(hidden)]
pub async fn update_patches_only_the_given_fields(store: impl StoreTesting) {
    let job = sample_job("call-2");
    store.insert(&job).await;

    let started = Utc::now();
    store
        .update(
            &job.id,
            JobPatch::status(JobStatus::Processing).with_started_at(started),
        )
        .await
        .expect("failed to update job");

    let updated = store.job(&job.id).await;
    assert_eq!(updated.status, JobStatus::Processing);
    assert_eq!(updated.started_at, Some(started));
    assert_eq!(updated.phone_number, job.phone_number);
    assert_eq!(updated.completed_at, None);
    assert!(updated.updated_at >= job.updated_at);
}

#[doc(hidden)]
pub async fn update_returns_job_not_found_for_missing_job(store: impl StoreTesting) {
    let id = JobId::new("call-ghost").unwrap();

    let result = store.update(&id, JobPatch::status(JobStatus::Cancelled)).await;

    assert!(matches!(result, Err(StoreError::JobNotFound(missing)) if missing == id));
}

#[doc(hidden)]
pub async fn remove_deletes_the_record(store: impl StoreTesting) {
    let job = sample_job("call-3");
    store.insert(&job).await;

    store.remove(&job.id).await.expect("failed to remove job");

    assert!(matches!(store.get(&job.id).await, Ok(None)));
    // Removing an absent record is not an error.
    store
        .remove(&job.id)
        .await
        .expect("repeat remove should succeed");
}

#[doc(hidden)]
pub async fn expire_after_drops_the_record_once_elapsed(store: impl StoreTesting) {
    let job = sample_job("call-4");
    store.insert(&job).await;

    store
        .expire_after(&job.id, TimeDelta::zero())
        .await
        .expect("failed to set expiry");

    assert!(matches!(store.get(&job.id).await, Ok(None)));
    assert!(matches!(
        store.update(&job.id, JobPatch::status(JobStatus::Completed)).await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn expire_after_returns_job_not_found_for_missing_job(store: impl StoreTesting) {
    let id = JobId::new("call-ghost").unwrap();

    let result = store.expire_after(&id, TimeDelta::hours(24)).await;

    assert!(matches!(result, Err(StoreError::JobNotFound(missing)) if missing == id));
}

#[doc(hidden)]
pub async fn pop_returns_jobs_in_priority_order(store: impl StoreTesting) {
    let at = Utc::now();
    for (id, priority) in [
        ("call-low", Priority::Low),
        ("call-urgent", Priority::Urgent),
        ("call-normal", Priority::Normal),
        ("call-high", Priority::High),
    ] {
        let id = JobId::new(id).unwrap();
        store
            .index_add(QueueIndex::Priority, &id, priority.queue_score(at))
            .await
            .expect("failed to add index entry");
    }

    let mut popped = Vec::new();
    while let Some(id) = store
        .index_pop_max(QueueIndex::Priority)
        .await
        .expect("failed to pop")
    {
        popped.push(id.as_str().to_owned());
    }

    assert_eq!(popped, ["call-urgent", "call-high", "call-normal", "call-low"]);
}

#[doc(hidden)]
pub async fn pop_on_empty_index_returns_none(store: impl StoreTesting) {
    assert!(matches!(
        store.index_pop_max(QueueIndex::Priority).await,
        Ok(None)
    ));
}

#[doc(hidden)]
pub async fn pop_breaks_score_ties_by_greatest_id(store: impl StoreTesting) {
    for id in ["call-a", "call-b", "call-c"] {
        let id = JobId::new(id).unwrap();
        store
            .index_add(QueueIndex::Priority, &id, 2_000_000.0)
            .await
            .expect("failed to add index entry");
    }

    let first = store
        .index_pop_max(QueueIndex::Priority)
        .await
        .expect("failed to pop")
        .expect("index should not be empty");

    assert_eq!(first.as_str(), "call-c");
}

#[doc(hidden)]
pub async fn index_add_rescores_an_existing_entry(store: impl StoreTesting) {
    let id = JobId::new("call-5").unwrap();
    store
        .index_add(QueueIndex::Priority, &id, 10.0)
        .await
        .expect("failed to add index entry");
    store
        .index_add(QueueIndex::Priority, &id, 3_000_000.0)
        .await
        .expect("failed to re-score index entry");

    assert_eq!(store.index_len(QueueIndex::Priority).await.unwrap(), 1);
    assert_eq!(
        store.index_pop_max(QueueIndex::Priority).await.unwrap(),
        Some(id)
    );
    assert_eq!(store.index_pop_max(QueueIndex::Priority).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn range_by_score_returns_due_entries_in_order(store: impl StoreTesting) {
    for (id, score) in [
        ("call-later", 200.0),
        ("call-early", 100.0),
        ("call-future", 900.0),
    ] {
        let id = JobId::new(id).unwrap();
        store
            .index_add(QueueIndex::Scheduled, &id, score)
            .await
            .expect("failed to add index entry");
    }

    let due = store
        .index_range_by_score(QueueIndex::Scheduled, 250.0)
        .await
        .expect("failed to range over index");
    let due: Vec<_> = due.iter().map(JobId::as_str).collect();

    assert_eq!(due, ["call-early", "call-later"]);
}

#[doc(hidden)]
pub async fn index_remove_reports_prior_membership(store: impl StoreTesting) {
    let id = JobId::new("call-6").unwrap();
    store
        .index_add(QueueIndex::Scheduled, &id, 100.0)
        .await
        .expect("failed to add index entry");

    assert!(store.index_remove(QueueIndex::Scheduled, &id).await.unwrap());
    assert!(!store.index_remove(QueueIndex::Scheduled, &id).await.unwrap());
    assert_eq!(store.index_len(QueueIndex::Scheduled).await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn index_len_counts_entries(store: impl StoreTesting) {
    assert_eq!(store.index_len(QueueIndex::Priority).await.unwrap(), 0);

    for (id, score) in [("call-x", 1.0), ("call-y", 2.0), ("call-z", 3.0)] {
        let id = JobId::new(id).unwrap();
        store
            .index_add(QueueIndex::Priority, &id, score)
            .await
            .expect("failed to add index entry");
    }

    assert_eq!(store.index_len(QueueIndex::Priority).await.unwrap(), 3);
    store
        .index_pop_max(QueueIndex::Priority)
        .await
        .expect("failed to pop");
    assert_eq!(store.index_len(QueueIndex::Priority).await.unwrap(), 2);
}

#[doc(hidden)]
pub async fn indexes_do_not_share_entries(store: impl StoreTesting) {
    let id = JobId::new("call-7").unwrap();
    store
        .index_add(QueueIndex::Priority, &id, 100.0)
        .await
        .expect("failed to add index entry");

    assert!(!store.index_remove(QueueIndex::Scheduled, &id).await.unwrap());
    assert_eq!(store.index_len(QueueIndex::Scheduled).await.unwrap(), 0);
    assert_eq!(
        store.index_pop_max(QueueIndex::Priority).await.unwrap(),
        Some(id)
    );
}

#[doc(hidden)]
pub async fn rate_limit_counts_within_a_second(store: impl StoreTesting) {
    let second = Utc::now().timestamp();

    assert_eq!(store.rate_limit_incr(second).await.unwrap(), 1);
    assert_eq!(store.rate_limit_incr(second).await.unwrap(), 2);
    assert_eq!(store.rate_limit_incr(second).await.unwrap(), 3);
    assert_eq!(store.rate_limit_incr(second + 1).await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn metrics_round_trip(store: impl StoreTesting) {
    assert_eq!(store.read_metrics().await.unwrap(), None);

    let metrics = QueueMetrics::new(7, 3);
    store
        .write_metrics(&metrics)
        .await
        .expect("failed to write metrics");

    assert_eq!(store.read_metrics().await.unwrap(), Some(metrics));
}

#[doc(hidden)]
pub async fn all_jobs_returns_every_stored_record(store: impl StoreTesting) {
    let first = sample_job("call-8");
    let second = sample_job("call-9").with_priority(Priority::Urgent);
    store.insert(&first).await;
    store.insert(&second).await;

    let mut jobs = store.all_jobs().await.expect("failed to scan jobs");
    jobs.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

    assert_eq!(jobs, vec![first, second]);
}

#[doc(hidden)]
pub async fn ping_succeeds(store: impl StoreTesting) {
    store.ping().await.expect("store should be reachable");
}
