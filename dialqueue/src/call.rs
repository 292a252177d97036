//! Pure call-resolution semantics.
//!
//! Everything here is a pure function over the provider/agent views of a
//! call: bucketing of provider statuses, final outcome classification, and
//! assembly of the result bags that are persisted on the job record and
//! delivered downstream.

use chrono::{TimeDelta, Utc};
use serde_json::{json, Value};

use crate::agent::AgentCallStatus;
use crate::job::CallJob;
use crate::provider::ProviderCallStatus;

/// Shortest provider-reported duration treated as a real conversation.
pub const MIN_CONNECTED_SECONDS: i64 = 10;

/// A call that went terminal during startup verification with at least this
/// much duration is treated as a normal completion rather than a quick fail.
pub const QUICK_TERMINAL_SECONDS: i64 = 5;

/// Coarse classification of a provider status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
    /// Not conclusive yet (`queued`, `initiated`, `not_found`, `unknown`,
    /// anything unrecognised); keep polling.
    Transitional,
    /// The call is live (`ringing`, `in-progress`, `answered`).
    Active,
    /// The provider considers the call over
    /// (`completed`, `failed`, `busy`, `no-answer`).
    Terminal,
}

impl StatusBucket {
    pub fn of(status: &str) -> Self {
        match status {
            "ringing" | "in-progress" | "answered" => Self::Active,
            "completed" | "failed" | "busy" | "no-answer" => Self::Terminal,
            _ => Self::Transitional,
        }
    }
}

/// Statuses in which a call has not yet been answered. A call sitting in one
/// of these beyond the stuck threshold is resolved as missed.
pub fn is_pre_answer(status: &str) -> bool {
    matches!(status, "queued" | "initiated" | "ringing")
}

/// Final outcome of a call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Completed,
    Missed,
    Busy,
    Failed,
    Unknown,
}

impl CallOutcome {
    /// Classifies the provider's terminal view of a call.
    ///
    /// A `completed` status only counts as a real conversation when the call
    /// lasted at least [`MIN_CONNECTED_SECONDS`]; shorter completions are
    /// reinterpreted through the hangup cause.
    pub fn classify(provider: &ProviderCallStatus) -> Self {
        let hangup = provider
            .hangup_cause
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        match provider.status.as_str() {
            "completed" if provider.duration >= MIN_CONNECTED_SECONDS => Self::Completed,
            "completed" if hangup.contains("no_answer") || hangup.contains("no-answer") => {
                Self::Missed
            }
            "completed" if hangup.contains("busy") => Self::Busy,
            "completed" => Self::Missed,
            "failed" => Self::Failed,
            "busy" => Self::Busy,
            "no-answer" | "no_answer" => Self::Missed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Missed => "missed",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the job-level retry scheduler should get another go.
    pub fn needs_retry(self) -> bool {
        matches!(self, Self::Missed | Self::Failed | Self::Busy)
    }
}

/// Job-side context shared by the result builders.
#[derive(Debug, Clone, Copy)]
pub struct ResultContext<'a> {
    pub job: &'a CallJob,
    pub provider_ref: &'a str,
    /// How the result was obtained (`status_poll`, `callback`, `timeout`, `system`).
    pub method: &'a str,
    pub environment: &'a str,
}

/// Assembles the result bag for a resolved call, merging the provider's
/// authoritative status with the agent's enrichment data.
pub fn completion_result(
    ctx: &ResultContext<'_>,
    provider: &ProviderCallStatus,
    agent: Option<&AgentCallStatus>,
) -> Value {
    let outcome = CallOutcome::classify(provider);
    let duration = provider.duration.max(0);
    let transcript = agent
        .map(AgentCallStatus::transcript)
        .unwrap_or_else(|| json!([]));
    let recording_file = agent.and_then(AgentCallStatus::recording_file);
    let public_recording_url = agent
        .and_then(AgentCallStatus::public_recording_url)
        .or(recording_file);
    let recording_status = if public_recording_url.is_some() {
        "available"
    } else {
        "not_available"
    };
    json!({
        "call_id": ctx.job.id,
        "provider_ref": ctx.provider_ref,
        "status": if outcome == CallOutcome::Failed { "failed" } else { "completed" },
        "call_outcome": outcome.as_str(),
        "duration": duration,
        "duration_seconds": duration,
        "transcript": transcript,
        "recording_file": recording_file,
        "public_recording_url": public_recording_url,
        "recording_status": recording_status,
        "provider_status": provider.status,
        "hangup_cause": provider.hangup_cause,
        "answer_time": provider.answer_time,
        "end_time": provider.end_time.clone().unwrap_or_else(|| Utc::now().to_rfc3339()),
        "method": ctx.method,
        "environment": ctx.environment,
        "next_action": if outcome.needs_retry() { "retry" } else { "none" },
    })
}

/// Assembles the result bag for an attempt that failed outright (placement,
/// startup, or tracking failure).
pub fn failure_result(
    ctx: &ResultContext<'_>,
    failure_kind: &str,
    error: Option<&str>,
) -> Value {
    json!({
        "call_id": ctx.job.id,
        "provider_ref": ctx.provider_ref,
        "status": "failed",
        "call_outcome": failure_kind,
        "duration": 0,
        "duration_seconds": 0,
        "transcript": [],
        "recording_file": null,
        "public_recording_url": null,
        "recording_status": "failed",
        "error": error,
        "end_time": Utc::now().to_rfc3339(),
        "method": ctx.method,
        "environment": ctx.environment,
        "next_action": if failure_kind == "timeout" { "none" } else { "retry" },
    })
}

/// Synthetic missed result for a call that never left a pre-answer status.
pub fn no_answer_result(
    ctx: &ResultContext<'_>,
    waited: TimeDelta,
    agent: Option<&AgentCallStatus>,
) -> Value {
    let transcript = agent
        .map(AgentCallStatus::transcript)
        .unwrap_or_else(|| json!([]));
    json!({
        "call_id": ctx.job.id,
        "provider_ref": ctx.provider_ref,
        "status": "completed",
        "call_outcome": "missed",
        "duration": 0,
        "duration_seconds": 0,
        "transcript": transcript,
        "recording_file": null,
        "public_recording_url": null,
        "recording_status": "not_available",
        "hangup_cause": "no_answer_timeout",
        "end_time": Utc::now().to_rfc3339(),
        "method": ctx.method,
        "environment": ctx.environment,
        "auto_detected": true,
        "detection_reason": format!("No answer after {}s", waited.num_seconds()),
        "next_action": "retry",
    })
}

/// Synthetic missed result written by the background reaper for a job left
/// in `processing` past the stuck threshold.
pub fn stuck_result(job: &CallJob, stuck_for: TimeDelta) -> Value {
    json!({
        "call_id": job.id,
        "provider_ref": job.provider_ref,
        "status": "completed",
        "call_outcome": "missed",
        "duration": 0,
        "duration_seconds": 0,
        "transcript": [],
        "recording_file": null,
        "public_recording_url": null,
        "recording_status": "not_started",
        "hangup_cause": "stuck_call_timeout",
        "end_time": Utc::now().to_rfc3339(),
        "environment": job.environment,
        "auto_detected": true,
        "background_detection": true,
        "detection_reason": format!("Stuck in processing for {}s", stuck_for.num_seconds()),
        "next_action": "retry",
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::JobId;
    use serde_json::Map;

    fn provider_view(status: &str, duration: i64, hangup_cause: Option<&str>) -> ProviderCallStatus {
        ProviderCallStatus {
            status: status.to_owned(),
            duration,
            hangup_cause: hangup_cause.map(str::to_owned),
            answer_time: None,
            end_time: None,
        }
    }

    fn sample_job() -> CallJob {
        CallJob::new(JobId::new("call-1").unwrap(), "+15550001111").for_campaign("campaign-1")
    }

    #[test]
    fn status_buckets() {
        for status in ["queued", "initiated", "not_found", "unknown", "warming-up"] {
            assert_eq!(StatusBucket::of(status), StatusBucket::Transitional);
        }
        for status in ["ringing", "in-progress", "answered"] {
            assert_eq!(StatusBucket::of(status), StatusBucket::Active);
        }
        for status in ["completed", "failed", "busy", "no-answer"] {
            assert_eq!(StatusBucket::of(status), StatusBucket::Terminal);
        }
    }

    #[test]
    fn pre_answer_statuses_are_stuck_candidates() {
        for status in ["queued", "initiated", "ringing"] {
            assert!(is_pre_answer(status));
        }
        for status in ["in-progress", "answered", "completed", "unknown"] {
            assert!(!is_pre_answer(status));
        }
    }

    #[test]
    fn outcome_classification() {
        let cases = [
            (provider_view("completed", 42, None), CallOutcome::Completed),
            (provider_view("completed", 10, None), CallOutcome::Completed),
            (
                provider_view("completed", 3, Some("NO_ANSWER")),
                CallOutcome::Missed,
            ),
            (
                provider_view("completed", 3, Some("USER_BUSY")),
                CallOutcome::Busy,
            ),
            (provider_view("completed", 3, None), CallOutcome::Missed),
            (provider_view("failed", 0, None), CallOutcome::Failed),
            (provider_view("busy", 0, None), CallOutcome::Busy),
            (provider_view("no-answer", 0, None), CallOutcome::Missed),
            (provider_view("no_answer", 0, None), CallOutcome::Missed),
            (provider_view("ringing", 0, None), CallOutcome::Unknown),
        ];
        for (view, expected) in cases {
            assert_eq!(
                CallOutcome::classify(&view),
                expected,
                "status {:?} duration {} hangup {:?}",
                view.status,
                view.duration,
                view.hangup_cause
            );
        }
    }

    #[test]
    fn completion_result_for_a_real_conversation() {
        let job = sample_job();
        let ctx = ResultContext {
            job: &job,
            provider_ref: "prov-abc",
            method: "status_poll",
            environment: "local",
        };
        let provider = provider_view("completed", 42, Some("NORMAL_CLEARING"));
        let mut data = Map::new();
        data.insert("transcript".to_owned(), json!([{"text": "hi"}]));
        data.insert("recording_file".to_owned(), json!("rec.mp3"));
        data.insert(
            "public_recording_url".to_owned(),
            json!("https://cdn.example.com/rec.mp3"),
        );
        let agent = AgentCallStatus {
            status: "completed".to_owned(),
            data,
        };

        let result = completion_result(&ctx, &provider, Some(&agent));

        assert_eq!(result["call_id"], json!("call-1"));
        assert_eq!(result["provider_ref"], json!("prov-abc"));
        assert_eq!(result["status"], json!("completed"));
        assert_eq!(result["call_outcome"], json!("completed"));
        assert_eq!(result["duration"], json!(42));
        assert_eq!(result["duration_seconds"], json!(42));
        assert_eq!(result["transcript"], json!([{"text": "hi"}]));
        assert_eq!(
            result["public_recording_url"],
            json!("https://cdn.example.com/rec.mp3")
        );
        assert_eq!(result["recording_status"], json!("available"));
        assert_eq!(result["next_action"], json!("none"));
        assert_eq!(result["environment"], json!("local"));
    }

    #[test]
    fn short_completion_resolves_as_missed_and_retries() {
        let job = sample_job();
        let ctx = ResultContext {
            job: &job,
            provider_ref: "prov-abc",
            method: "status_poll",
            environment: "local",
        };
        let provider = provider_view("completed", 4, None);

        let result = completion_result(&ctx, &provider, None);

        assert_eq!(result["status"], json!("completed"));
        assert_eq!(result["call_outcome"], json!("missed"));
        assert_eq!(result["transcript"], json!([]));
        assert_eq!(result["recording_status"], json!("not_available"));
        assert_eq!(result["next_action"], json!("retry"));
    }

    #[test]
    fn failed_outcome_flips_result_status_to_failed() {
        let job = sample_job();
        let ctx = ResultContext {
            job: &job,
            provider_ref: "prov-abc",
            method: "status_poll",
            environment: "local",
        };
        let provider = provider_view("failed", 0, Some("CARRIER_ERROR"));

        let result = completion_result(&ctx, &provider, None);

        assert_eq!(result["status"], json!("failed"));
        assert_eq!(result["call_outcome"], json!("failed"));
        assert_eq!(result["next_action"], json!("retry"));
    }

    #[test]
    fn failure_result_retries_except_on_timeout() {
        let job = sample_job();
        let ctx = ResultContext {
            job: &job,
            provider_ref: "unknown-+15550001111-1700000000",
            method: "status_poll",
            environment: "local",
        };

        let failed = failure_result(&ctx, "startup_failed", Some("never left queued"));
        assert_eq!(failed["status"], json!("failed"));
        assert_eq!(failed["call_outcome"], json!("startup_failed"));
        assert_eq!(failed["recording_status"], json!("failed"));
        assert_eq!(failed["error"], json!("never left queued"));
        assert_eq!(failed["next_action"], json!("retry"));

        let timed_out = failure_result(&ctx, "timeout", None);
        assert_eq!(timed_out["next_action"], json!("none"));
        assert_eq!(timed_out["error"], json!(null));
    }

    #[test]
    fn no_answer_result_is_an_auto_detected_miss() {
        let job = sample_job();
        let ctx = ResultContext {
            job: &job,
            provider_ref: "prov-abc",
            method: "status_poll",
            environment: "local",
        };

        let result = no_answer_result(&ctx, TimeDelta::seconds(75), None);

        assert_eq!(result["status"], json!("completed"));
        assert_eq!(result["call_outcome"], json!("missed"));
        assert_eq!(result["hangup_cause"], json!("no_answer_timeout"));
        assert_eq!(result["auto_detected"], json!(true));
        assert_eq!(result["detection_reason"], json!("No answer after 75s"));
        assert_eq!(result["next_action"], json!("retry"));
    }

    #[test]
    fn stuck_result_marks_background_detection() {
        let job = sample_job();

        let result = stuck_result(&job, TimeDelta::seconds(90));

        assert_eq!(result["status"], json!("completed"));
        assert_eq!(result["call_outcome"], json!("missed"));
        assert_eq!(result["hangup_cause"], json!("stuck_call_timeout"));
        assert_eq!(result["recording_status"], json!("not_started"));
        assert_eq!(result["auto_detected"], json!(true));
        assert_eq!(result["background_detection"], json!(true));
        assert_eq!(
            result["detection_reason"],
            json!("Stuck in processing for 90s")
        );
        assert_eq!(result["next_action"], json!("retry"));
    }
}
