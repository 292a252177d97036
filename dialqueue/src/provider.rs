//! The telephony provider seam.
//!
//! [`CallProvider`] abstracts the two provider operations the engine needs:
//! placing an outbound call and polling its status. [`PlivoProvider`] is the
//! stock REST implementation; tests and embedders with their own telephony
//! stack supply something else.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::env_or;
use crate::job::JobId;

/// A request to place one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub call_id: JobId,
    pub to: String,
}

/// Provider-reported view of a call.
///
/// `status` is normalised to lowercase; everything else is passed through as
/// the provider reported it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderCallStatus {
    pub status: String,
    pub duration: i64,
    pub hangup_cause: Option<String>,
    pub answer_time: Option<String>,
    pub end_time: Option<String>,
}

impl ProviderCallStatus {
    /// The view served when the provider has no record of the call (yet).
    pub fn not_found() -> Self {
        Self {
            status: "not_found".to_owned(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Placement and status operations against the telephony provider.
#[async_trait]
pub trait CallProvider: Send + Sync {
    /// Places the call. `Ok(None)` means the provider accepted the request
    /// but returned no call reference; the caller synthesizes a fallback.
    async fn place(&self, request: &PlacementRequest) -> Result<Option<String>, ProviderError>;

    /// Polls the provider for the call's current state.
    async fn status(&self, call_ref: &str) -> Result<ProviderCallStatus, ProviderError>;
}

/// Connection settings for the Plivo REST API.
#[derive(Debug, Clone)]
pub struct PlivoConfig {
    pub auth_id: String,
    pub auth_token: String,
    pub from_number: String,
    pub answer_url: String,
    pub hangup_url: String,
    /// Status-callback endpoint, registered with the provider only when set.
    pub callback_url: Option<String>,
    pub api_url: String,
}

impl PlivoConfig {
    pub fn from_env() -> Self {
        let callback_url = match env_or("PLIVO_CALLBACK_URL", "") {
            url if url.is_empty() => None,
            url => Some(url),
        };
        Self {
            auth_id: env_or("PLIVO_AUTH_ID", ""),
            auth_token: env_or("PLIVO_AUTH_TOKEN", ""),
            from_number: env_or("PLIVO_FROM_NUMBER", ""),
            answer_url: env_or("PLIVO_ANSWER_URL", ""),
            hangup_url: env_or("PLIVO_HANGUP_URL", ""),
            callback_url,
            api_url: env_or("PLIVO_API_URL", "https://api.plivo.com"),
        }
    }
}

/// [`CallProvider`] implementation over the Plivo REST API.
#[derive(Debug, Clone)]
pub struct PlivoProvider {
    config: PlivoConfig,
    client: reqwest::Client,
}

impl PlivoProvider {
    pub fn new(config: PlivoConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self { config, client })
    }

    fn call_endpoint(&self) -> String {
        format!(
            "{}/v1/Account/{}/Call/",
            self.config.api_url, self.config.auth_id
        )
    }
}

#[async_trait]
impl CallProvider for PlivoProvider {
    async fn place(&self, request: &PlacementRequest) -> Result<Option<String>, ProviderError> {
        let answer_url = format!("{}?call_id={}", self.config.answer_url, request.call_id);
        let mut payload = serde_json::json!({
            "from": self.config.from_number,
            "to": request.to,
            "answer_url": answer_url,
            "answer_method": "POST",
            "hangup_url": self.config.hangup_url,
            "hangup_method": "POST",
        });
        if let Some(callback_url) = &self.config.callback_url {
            payload["callback_url"] = Value::from(callback_url.clone());
            payload["callback_method"] = Value::from("POST");
        }

        tracing::debug!(call_id = %request.call_id, to = %request.to, "Placing call");
        let response = self
            .client
            .post(self.call_endpoint())
            .basic_auth(&self.config.auth_id, Some(&self.config.auth_token))
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: Value = response.json().await?;
        Ok(body
            .get("request_uuid")
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    async fn status(&self, call_ref: &str) -> Result<ProviderCallStatus, ProviderError> {
        let live_url = format!("{}{}/?status=live", self.call_endpoint(), call_ref);
        let response = self
            .client
            .get(&live_url)
            .basic_auth(&self.config.auth_id, Some(&self.config.auth_token))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let payload: Value = response.json().await?;
            return Ok(parse_status_payload(&payload));
        }
        if status != reqwest::StatusCode::NOT_FOUND {
            return Err(api_error(response).await);
        }

        // Not live any more; look for the finished call record.
        let record_url = format!("{}{}/", self.call_endpoint(), call_ref);
        let response = self
            .client
            .get(&record_url)
            .basic_auth(&self.config.auth_id, Some(&self.config.auth_token))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let payload: Value = response.json().await?;
            Ok(parse_status_payload(&payload))
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Ok(ProviderCallStatus::not_found())
        } else {
            Err(api_error(response).await)
        }
    }
}

async fn api_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ProviderError::Api { status, message }
}

/// Maps a provider payload, live or finished, onto [`ProviderCallStatus`].
fn parse_status_payload(payload: &Value) -> ProviderCallStatus {
    let status = payload
        .get("call_status")
        .or_else(|| payload.get("call_state"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_lowercase();
    let duration = payload
        .get("call_duration")
        .or_else(|| payload.get("duration"))
        .map(coerce_duration)
        .unwrap_or(0);
    ProviderCallStatus {
        status,
        duration,
        hangup_cause: string_field(payload, "hangup_cause_name")
            .or_else(|| string_field(payload, "hangup_cause")),
        answer_time: string_field(payload, "answer_time"),
        end_time: string_field(payload, "end_time"),
    }
}

fn string_field(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Providers report durations as numbers or numeric strings; anything else
/// counts as zero, and negatives are clamped.
fn coerce_duration(value: &Value) -> i64 {
    let duration = match value {
        Value::Number(number) => number.as_i64().unwrap_or(0),
        Value::String(text) => text.trim().parse().unwrap_or(0),
        _ => 0,
    };
    duration.max(0)
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    /// [`CallProvider`] driven by responses scripted in call order.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedProvider {
        place_returns: Arc<Mutex<VecDeque<Result<Option<String>, ProviderError>>>>,
        status_returns: Arc<Mutex<VecDeque<Result<ProviderCallStatus, ProviderError>>>>,
        placements: Arc<Mutex<Vec<PlacementRequest>>>,
    }

    impl ScriptedProvider {
        pub(crate) fn expect_place_returning(&self, result: Result<Option<String>, ProviderError>) {
            self.place_returns.lock().unwrap().push_back(result)
        }

        pub(crate) fn expect_status_returning(
            &self,
            result: Result<ProviderCallStatus, ProviderError>,
        ) {
            self.status_returns.lock().unwrap().push_back(result)
        }

        pub(crate) fn placements(&self) -> Vec<PlacementRequest> {
            self.placements.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CallProvider for ScriptedProvider {
        async fn place(&self, request: &PlacementRequest) -> Result<Option<String>, ProviderError> {
            self.placements.lock().unwrap().push(request.clone());
            self.place_returns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Some("prov-scripted".to_owned())))
        }

        async fn status(&self, _call_ref: &str) -> Result<ProviderCallStatus, ProviderError> {
            self.status_returns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ProviderCallStatus::not_found()))
        }
    }

    #[test]
    fn parses_a_live_call_payload() {
        let payload = json!({
            "call_status": "in-progress",
            "direction": "outbound",
        });

        let status = parse_status_payload(&payload);

        assert_eq!(status.status, "in-progress");
        assert_eq!(status.duration, 0);
        assert_eq!(status.hangup_cause, None);
    }

    #[test]
    fn parses_a_finished_call_record() {
        let payload = json!({
            "call_state": "Completed",
            "call_duration": "42",
            "hangup_cause_name": "NORMAL_CLEARING",
            "answer_time": "2025-01-15 14:30:05",
            "end_time": "2025-01-15 14:30:47",
        });

        let status = parse_status_payload(&payload);

        assert_eq!(status.status, "completed");
        assert_eq!(status.duration, 42);
        assert_eq!(status.hangup_cause.as_deref(), Some("NORMAL_CLEARING"));
        assert_eq!(status.answer_time.as_deref(), Some("2025-01-15 14:30:05"));
        assert_eq!(status.end_time.as_deref(), Some("2025-01-15 14:30:47"));
    }

    #[test]
    fn unknown_payloads_fall_back_to_unknown_status() {
        let status = parse_status_payload(&json!({}));

        assert_eq!(status.status, "unknown");
        assert_eq!(status.duration, 0);
    }

    #[test]
    fn durations_are_coerced_non_negative() {
        assert_eq!(coerce_duration(&json!(42)), 42);
        assert_eq!(coerce_duration(&json!("17")), 17);
        assert_eq!(coerce_duration(&json!(-3)), 0);
        assert_eq!(coerce_duration(&json!("nope")), 0);
        assert_eq!(coerce_duration(&json!(null)), 0);
    }

    #[test]
    fn empty_time_fields_read_as_absent() {
        let payload = json!({"call_state": "failed", "answer_time": ""});

        let status = parse_status_payload(&payload);

        assert_eq!(status.answer_time, None);
    }
}
