//! The call job model.
//!
//! A [`CallJob`] represents a single outbound call attempt. Its identifier is
//! supplied by the caller and is the sole primary key across the job store,
//! both queue indexes, and all status lookups.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The caller-supplied identifier of a job.
///
/// Must be non-empty: the system never fabricates a job identifier (the only
/// synthesized identifier anywhere is the provider call reference fallback).
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidJobId> {
        let id = id.into();
        if id.trim().is_empty() {
            Err(InvalidJobId)
        } else {
            Ok(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = InvalidJobId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for JobId {
    type Error = InvalidJobId;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for JobId {
    type Err = InvalidJobId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, thiserror::Error)]
#[error("job identifiers must be non-empty and caller-supplied")]
pub struct InvalidJobId;

/// Priority tier of a job, the dominant dequeue sort key.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn tier(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Urgent => 4,
        }
    }

    pub fn from_tier(tier: u8) -> Option<Self> {
        match tier {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Urgent),
            _ => None,
        }
    }

    /// Composite score for the immediate-priority index: the tier dominates,
    /// the enqueue timestamp breaks ties within a tier.
    pub fn queue_score(self, at: DateTime<Utc>) -> f64 {
        (self.tier() as i64 * 1_000_000 + at.timestamp()) as f64
    }
}

impl Serialize for Priority {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.tier())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tier = u8::deserialize(deserializer)?;
        Self::from_tier(tier)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown priority tier {tier}")))
    }
}

/// Lifecycle status of a job.
///
/// `Queued → Processing → {Completed, RetryPending → Queued, Failed,
/// Cancelled}`. `Completed`, `Failed`, and `Cancelled` are terminal. A job in
/// `Processing` can additionally be force-completed with a synthetic missed
/// outcome by the stuck-job reaper, or re-queued by the crash-recovery sweep.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    #[serde(rename = "retry")]
    RetryPending,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses block duplicate detection: a job whose record is in
    /// one of these states may be re-submitted under the same identifier.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RetryPending => "retry",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::RetryPending),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Eq, PartialEq, Clone, thiserror::Error)]
#[error("unknown job status {0:?}")]
pub struct UnknownStatus(pub String);

/// A single outbound call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallJob {
    pub id: JobId,
    pub phone_number: String,
    #[serde(default)]
    pub campaign_id: String,
    /// Opaque pass-through configuration, including the nested `variables`
    /// handed to the execution side.
    #[serde(default)]
    pub call_config: Map<String, Value>,
    pub priority: Priority,
    pub status: JobStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    /// Call reference returned by the placement provider, recorded once the
    /// call has been placed.
    #[serde(default)]
    pub provider_ref: Option<String>,
    /// Deployment environment tag recorded by the execution path.
    #[serde(default)]
    pub environment: Option<String>,
}

impl CallJob {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(id: JobId, phone_number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            phone_number: phone_number.into(),
            campaign_id: String::new(),
            call_config: Map::new(),
            priority: Priority::Normal,
            status: JobStatus::Queued,
            scheduled_at: None,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            provider_ref: None,
            environment: None,
        }
    }

    pub fn for_campaign(self, campaign_id: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            ..self
        }
    }

    pub fn with_config(self, call_config: Map<String, Value>) -> Self {
        Self {
            call_config,
            ..self
        }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// The nested `variables` bag from the call configuration.
    pub fn variables(&self) -> Map<String, Value> {
        self.call_config
            .get("variables")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Applies a partial update, bumping `updated_at`.
    ///
    /// Every store implementation routes `update` through this so that
    /// partial-write semantics are identical across stores.
    pub fn apply_patch(&mut self, patch: JobPatch) {
        let JobPatch {
            status,
            error,
            started_at,
            completed_at,
            scheduled_at,
            retry_count,
            result,
            provider_ref,
            environment,
        } = patch;
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(error) = error {
            self.error = Some(error);
        }
        if let Some(started_at) = started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(scheduled_at) = scheduled_at {
            self.scheduled_at = Some(scheduled_at);
        }
        if let Some(retry_count) = retry_count {
            self.retry_count = retry_count;
        }
        if let Some(result) = result {
            self.result = Some(result);
        }
        if let Some(provider_ref) = provider_ref {
            self.provider_ref = Some(provider_ref);
        }
        if let Some(environment) = environment {
            self.environment = Some(environment);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a job record; unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub result: Option<Value>,
    pub provider_ref: Option<String>,
    pub environment: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self
        }
    }

    pub fn with_started_at(self, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            ..self
        }
    }

    pub fn with_completed_at(self, completed_at: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(completed_at),
            ..self
        }
    }

    pub fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    pub fn with_retry_count(self, retry_count: u32) -> Self {
        Self {
            retry_count: Some(retry_count),
            ..self
        }
    }

    pub fn with_result(self, result: Value) -> Self {
        Self {
            result: Some(result),
            ..self
        }
    }

    pub fn with_provider_ref(self, provider_ref: impl Into<String>) -> Self {
        Self {
            provider_ref: Some(provider_ref.into()),
            ..self
        }
    }

    pub fn with_environment(self, environment: impl Into<String>) -> Self {
        Self {
            environment: Some(environment.into()),
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    #[test]
    fn job_ids_must_be_non_empty() {
        assert_matches!(JobId::new("call-42"), Ok(_));
        assert_matches!(JobId::new(""), Err(InvalidJobId));
        assert_matches!(JobId::new("   "), Err(InvalidJobId));
    }

    #[test]
    fn priority_dominates_queue_score_within_a_second() {
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap();
        let scores: Vec<f64> = [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Urgent,
        ]
        .into_iter()
        .map(|priority| priority.queue_score(at))
        .collect();
        for pair in scores.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn later_arrival_scores_higher_within_a_tier() {
        let first = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap();
        let second = first + chrono::TimeDelta::seconds(1);
        assert!(Priority::Normal.queue_score(first) < Priority::Normal.queue_score(second));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::RetryPending.is_terminal());
    }

    #[test]
    fn status_round_trips_through_wire_values() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::RetryPending,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert_eq!("retry".parse::<JobStatus>(), Ok(JobStatus::RetryPending));
        assert_matches!("sleeping".parse::<JobStatus>(), Err(UnknownStatus(_)));
    }

    #[test]
    fn job_serializes_with_numeric_priority_and_wire_status() {
        let job = CallJob::new(JobId::new("call-7").unwrap(), "+15551234567")
            .for_campaign("campaign-1")
            .with_priority(Priority::Urgent);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["priority"], serde_json::json!(4));
        assert_eq!(value["status"], serde_json::json!("queued"));
        let parsed: CallJob = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut job = CallJob::new(JobId::new("call-9").unwrap(), "+15550001111");
        let created = job.created_at;
        job.apply_patch(
            JobPatch::status(JobStatus::Processing).with_started_at(created),
        );
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(created));
        assert_eq!(job.completed_at, None);
        assert_eq!(job.error, None);
        assert!(job.updated_at >= created);

        job.apply_patch(JobPatch::default().with_error("provider unreachable"));
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.error.as_deref(), Some("provider unreachable"));
    }

    #[test]
    fn variables_are_extracted_from_the_config_bag() {
        let mut config = Map::new();
        config.insert(
            "variables".to_owned(),
            serde_json::json!({"name": "Ada", "amount": 42}),
        );
        config.insert("flow_name".to_owned(), serde_json::json!("collections"));
        let job =
            CallJob::new(JobId::new("call-11").unwrap(), "+15550002222").with_config(config);
        assert_eq!(job.variables().get("name"), Some(&serde_json::json!("Ada")));
        assert!(CallJob::new(JobId::new("call-12").unwrap(), "+15550003333")
            .variables()
            .is_empty());
    }
}
