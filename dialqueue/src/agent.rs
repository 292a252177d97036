//! The conversation-agent seam.
//!
//! The agent side runs the actual conversation once a call connects. The
//! engine notifies it when a call is placed and polls it for enrichment data
//! (transcript, recording) while tracking. The agent is never the authority
//! on call completion.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::env_or;
use crate::job::JobId;

/// Heads-up sent to the agent side when a call has been placed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartNotice {
    pub call_id: JobId,
    pub provider_ref: String,
    pub phone_number: String,
    pub campaign_id: String,
    pub config: Map<String, Value>,
    pub method: String,
}

/// Agent-side view of a call.
///
/// The payload bag is kept opaque; accessors pull out the fields the result
/// builder cares about.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentCallStatus {
    pub status: String,
    pub data: Map<String, Value>,
}

impl AgentCallStatus {
    /// The view served when the agent has no record of the call.
    pub fn not_found() -> Self {
        Self {
            status: "not_found".to_owned(),
            data: Map::new(),
        }
    }

    /// An agent that knows the call by any status other than
    /// `unknown`/`error`/`not_found` confirms that the call started.
    pub fn confirms_startup(&self) -> bool {
        !matches!(self.status.as_str(), "unknown" | "error" | "not_found")
    }

    pub fn transcript(&self) -> Value {
        self.data
            .get("transcript")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }

    pub fn recording_file(&self) -> Option<&str> {
        self.data.get("recording_file").and_then(Value::as_str)
    }

    pub fn public_recording_url(&self) -> Option<&str> {
        self.data
            .get("public_recording_url")
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent returned {status}")]
    Api { status: u16 },
}

/// Notification and status operations against the conversation agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn notify_start(&self, notice: &StartNotice) -> Result<(), AgentError>;

    /// Polls the agent for its view of the call. An unknown call maps to the
    /// `not_found` status, which is transitional rather than an error.
    async fn status(&self, call_id: &JobId) -> Result<AgentCallStatus, AgentError>;
}

/// Connection settings for the agent service.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub base_url: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or("AGENT_BASE_URL", "http://localhost:8004"),
        }
    }
}

/// [`AgentClient`] implementation over the agent service's REST API.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    config: AgentConfig,
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn notify_start(&self, notice: &StartNotice) -> Result<(), AgentError> {
        tracing::debug!(call_id = %notice.call_id, "Notifying agent of call start");
        let response = self
            .client
            .post(format!("{}/start-call", self.config.base_url))
            .json(notice)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::Api {
                status: response.status().as_u16(),
            })
        }
    }

    async fn status(&self, call_id: &JobId) -> Result<AgentCallStatus, AgentError> {
        let response = self
            .client
            .get(format!("{}/call-status/{}", self.config.base_url, call_id))
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(AgentCallStatus::not_found());
        }
        if !status.is_success() {
            return Err(AgentError::Api {
                status: status.as_u16(),
            });
        }

        let payload: Value = response.json().await?;
        Ok(parse_agent_payload(&payload))
    }
}

fn parse_agent_payload(payload: &Value) -> AgentCallStatus {
    AgentCallStatus {
        status: payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_lowercase(),
        data: payload
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    /// [`AgentClient`] driven by responses scripted in call order.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedAgent {
        status_returns: Arc<Mutex<VecDeque<Result<AgentCallStatus, AgentError>>>>,
        notices: Arc<Mutex<Vec<StartNotice>>>,
    }

    impl ScriptedAgent {
        pub(crate) fn expect_status_returning(
            &self,
            result: Result<AgentCallStatus, AgentError>,
        ) {
            self.status_returns.lock().unwrap().push_back(result)
        }

        pub(crate) fn notices(&self) -> Vec<StartNotice> {
            self.notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentClient for ScriptedAgent {
        async fn notify_start(&self, notice: &StartNotice) -> Result<(), AgentError> {
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }

        async fn status(&self, _call_id: &JobId) -> Result<AgentCallStatus, AgentError> {
            self.status_returns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(AgentCallStatus::not_found()))
        }
    }

    #[test]
    fn parses_an_agent_payload() {
        let payload = json!({
            "status": "completed",
            "data": {
                "transcript": [{"role": "agent", "text": "hello"}],
                "recording_file": "rec-1.mp3",
                "public_recording_url": "https://cdn.example.com/rec-1.mp3",
            },
        });

        let status = parse_agent_payload(&payload);

        assert_eq!(status.status, "completed");
        assert_eq!(
            status.transcript(),
            json!([{"role": "agent", "text": "hello"}])
        );
        assert_eq!(status.recording_file(), Some("rec-1.mp3"));
        assert_eq!(
            status.public_recording_url(),
            Some("https://cdn.example.com/rec-1.mp3")
        );
    }

    #[test]
    fn missing_fields_fall_back_to_unknown_and_empty() {
        let status = parse_agent_payload(&json!({}));

        assert_eq!(status.status, "unknown");
        assert_eq!(status.transcript(), json!([]));
        assert_eq!(status.recording_file(), None);
    }

    #[test]
    fn startup_confirmation_excludes_unknown_error_and_not_found() {
        for status in ["in_progress", "active", "completed"] {
            let view = AgentCallStatus {
                status: status.to_owned(),
                data: Map::new(),
            };
            assert!(view.confirms_startup(), "{status} should confirm startup");
        }
        for status in ["unknown", "error", "not_found"] {
            let view = AgentCallStatus {
                status: status.to_owned(),
                data: Map::new(),
            };
            assert!(!view.confirms_startup(), "{status} should not confirm");
        }
        assert!(!AgentCallStatus::not_found().confirms_startup());
    }
}
