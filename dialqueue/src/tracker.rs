//! Call placement and completion tracking.
//!
//! The tracker drives one claimed job end to end: place the call with the
//! provider, notify the agent side, verify the call actually starts, then
//! poll the status sources until the call resolves. The provider is the
//! authority on completion, a pushed callback record overrides polling, and
//! the agent only contributes enrichment data.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::agent::{AgentCallStatus, AgentClient, StartNotice};
use crate::backoff::Strategy;
use crate::call::{self, ResultContext, StatusBucket, QUICK_TERMINAL_SECONDS};
use crate::config::{TrackingConfig, TrackingProfile};
use crate::job::{CallJob, JobId, JobPatch};
use crate::provider::{CallProvider, PlacementRequest, ProviderCallStatus};
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("call placement failed: {0}")]
    Placement(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("both tracking attempts failed; primary: {primary}; fallback: {fallback}")]
    BothAttemptsFailed { primary: String, fallback: String },
}

/// What one probe of the status sources produced.
enum Probe {
    /// A pushed callback record, authoritative as-is.
    Pushed(Value),
    Status(ProviderCallStatus),
}

#[derive(Clone)]
pub(crate) struct Tracker<S> {
    store: S,
    provider: Arc<dyn CallProvider>,
    agent: Arc<dyn AgentClient>,
    config: TrackingConfig,
}

impl<S> Tracker<S>
where
    S: JobStore,
{
    pub(crate) fn new(
        store: S,
        provider: Arc<dyn CallProvider>,
        agent: Arc<dyn AgentClient>,
        config: TrackingConfig,
    ) -> Self {
        Self {
            store,
            provider,
            agent,
            config,
        }
    }

    /// Runs the full placement-and-tracking pipeline for one claimed job,
    /// returning the final result bag.
    ///
    /// The primary deployment profile gets the first attempt. If that attempt
    /// errors, one fallback attempt runs with the conservative profile,
    /// re-placing the call. Both failing preserves both error messages.
    pub(crate) async fn execute(&self, job: &CallJob) -> Result<Value, TrackingError> {
        let primary = match self.attempt(job, self.config.primary).await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };
        tracing::warn!(
            job_id = %job.id,
            "Tracking attempt failed, retrying with the fallback profile: {primary}",
        );
        match self.attempt(job, self.config.fallback).await {
            Ok(result) => Ok(result),
            Err(fallback) => Err(TrackingError::BothAttemptsFailed {
                primary: primary.to_string(),
                fallback: fallback.to_string(),
            }),
        }
    }

    async fn attempt(
        &self,
        job: &CallJob,
        profile: TrackingProfile,
    ) -> Result<Value, TrackingError> {
        let started = Instant::now();
        let provider_ref = self.place(job).await?;
        let agent_notified = self.notify_agent(job, &provider_ref).await;
        let ctx = ResultContext {
            job,
            provider_ref: &provider_ref,
            method: "status_poll",
            environment: &self.config.environment,
        };

        tokio::time::sleep(profile.initial_delay).await;

        match self.verify_startup(&ctx, profile, agent_notified).await {
            Some(result) => Ok(result),
            None => Ok(self.track(&ctx, profile, started, agent_notified).await),
        }
    }

    /// Places the call and records the provider reference on the job.
    ///
    /// A placement accepted without a call reference gets a synthesized
    /// `unknown-{phone}-{epoch}` fallback so tracking can continue.
    async fn place(&self, job: &CallJob) -> Result<String, TrackingError> {
        let request = PlacementRequest {
            call_id: job.id.clone(),
            to: job.phone_number.clone(),
        };
        let placed = self
            .provider
            .place(&request)
            .await
            .map_err(|err| TrackingError::Placement(err.to_string()))?;
        let provider_ref = placed.unwrap_or_else(|| {
            let fallback = format!("unknown-{}-{}", job.phone_number, Utc::now().timestamp());
            tracing::warn!(job_id = %job.id, "Provider returned no call reference, using {fallback}");
            fallback
        });
        self.store
            .update(
                &job.id,
                JobPatch::default()
                    .with_provider_ref(provider_ref.as_str())
                    .with_environment(self.config.environment.clone()),
            )
            .await?;
        tracing::info!(job_id = %job.id, provider_ref, "Placed call");
        Ok(provider_ref)
    }

    /// Best-effort heads-up to the agent side; failure never fails the call.
    async fn notify_agent(&self, job: &CallJob, provider_ref: &str) -> bool {
        let notice = StartNotice {
            call_id: job.id.clone(),
            provider_ref: provider_ref.to_owned(),
            phone_number: job.phone_number.clone(),
            campaign_id: job.campaign_id.clone(),
            config: job.call_config.clone(),
            method: "call_queue_system".to_owned(),
        };
        self.agent
            .notify_start(&notice)
            .await
            .inspect_err(|err| {
                tracing::warn!(job_id = %job.id, "Agent start notification failed: {err}");
            })
            .is_ok()
    }

    /// Polls until the call is confirmed live. `None` means verified and
    /// tracking should proceed; `Some` carries an already-final result: a
    /// call that went terminal during startup, or a startup failure.
    async fn verify_startup(
        &self,
        ctx: &ResultContext<'_>,
        profile: TrackingProfile,
        agent_notified: bool,
    ) -> Option<Value> {
        let verifying = Instant::now();
        let mut consecutive_errors = 0u32;
        while verifying.elapsed() < profile.startup_timeout {
            match self.provider_status(profile, ctx.provider_ref).await {
                Ok(view) => {
                    consecutive_errors = 0;
                    match StatusBucket::of(&view.status) {
                        StatusBucket::Active => {
                            tracing::info!(
                                job_id = %ctx.job.id,
                                status = %view.status,
                                "Call confirmed started",
                            );
                            return None;
                        }
                        StatusBucket::Terminal if view.duration < QUICK_TERMINAL_SECONDS => {
                            let error = format!(
                                "Call completed quickly with status {} (duration: {}s)",
                                view.status, view.duration
                            );
                            tracing::warn!(job_id = %ctx.job.id, "{error}");
                            return Some(record_notification(
                                call::failure_result(ctx, "failed_to_start", Some(&error)),
                                agent_notified,
                            ));
                        }
                        StatusBucket::Terminal => {
                            tracing::info!(
                                job_id = %ctx.job.id,
                                status = %view.status,
                                "Call went terminal during startup",
                            );
                            let agent = self.agent_view(&ctx.job.id).await;
                            return Some(record_notification(
                                call::completion_result(ctx, &view, agent.as_ref()),
                                agent_notified,
                            ));
                        }
                        StatusBucket::Transitional => {
                            // Secondary confirmation from the agent side.
                            if let Ok(agent) = self.agent.status(&ctx.job.id).await {
                                if agent.confirms_startup() {
                                    tracing::info!(
                                        job_id = %ctx.job.id,
                                        status = %agent.status,
                                        "Call start confirmed by the agent",
                                    );
                                    return None;
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        job_id = %ctx.job.id,
                        consecutive_errors,
                        "Startup status check failed: {error}",
                    );
                    if consecutive_errors >= profile.startup_error_ceiling {
                        let error = format!(
                            "Too many consecutive errors ({consecutive_errors}) during startup verification"
                        );
                        return Some(record_notification(
                            call::failure_result(ctx, "failed_to_start", Some(&error)),
                            agent_notified,
                        ));
                    }
                }
            }
            tokio::time::sleep(profile.check_interval).await;
        }

        let error = format!(
            "Startup verification timeout after {}s",
            profile.startup_timeout.as_secs()
        );
        tracing::warn!(job_id = %ctx.job.id, "{error}");
        Some(record_notification(
            call::failure_result(ctx, "failed_to_start", Some(&error)),
            agent_notified,
        ))
    }

    /// The tracking loop proper: probes the status sources each interval
    /// until the call resolves or the overall budget runs out.
    async fn track(
        &self,
        ctx: &ResultContext<'_>,
        profile: TrackingProfile,
        started: Instant,
        agent_notified: bool,
    ) -> Value {
        let mut completed_streak = 0u32;
        let mut consecutive_errors = 0u32;
        while started.elapsed() < self.config.budget {
            match self.probe(ctx, profile).await {
                Ok(Probe::Pushed(result)) => {
                    tracing::info!(job_id = %ctx.job.id, "Resolved via pushed completion callback");
                    return result;
                }
                Ok(Probe::Status(view)) => {
                    consecutive_errors = 0;
                    match StatusBucket::of(&view.status) {
                        StatusBucket::Terminal => {
                            // `completed` needs two consecutive reads before
                            // it is trusted; the other terminal statuses
                            // resolve on one.
                            if view.status == "completed" {
                                completed_streak += 1;
                                if completed_streak < self.config.debounce_checks {
                                    tracing::debug!(
                                        job_id = %ctx.job.id,
                                        completed_streak,
                                        "Completed status reported, confirming",
                                    );
                                } else {
                                    return self.resolve(ctx, &view, agent_notified).await;
                                }
                            } else {
                                return self.resolve(ctx, &view, agent_notified).await;
                            }
                        }
                        _ => {
                            completed_streak = 0;
                            if call::is_pre_answer(&view.status)
                                && since(started) >= self.config.stuck_after
                            {
                                tracing::warn!(
                                    job_id = %ctx.job.id,
                                    status = %view.status,
                                    "Call never answered, resolving as missed",
                                );
                                let agent = self.agent_view(&ctx.job.id).await;
                                return record_notification(
                                    call::no_answer_result(ctx, since(started), agent.as_ref()),
                                    agent_notified,
                                );
                            }
                        }
                    }
                    tokio::time::sleep(profile.check_interval).await;
                }
                Err(error) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        job_id = %ctx.job.id,
                        consecutive_errors,
                        "Tracking status check failed: {error}",
                    );
                    if consecutive_errors >= self.config.error_ceiling {
                        let error = format!(
                            "Lost connection to status sources after {consecutive_errors} attempts"
                        );
                        return record_notification(
                            call::failure_result(ctx, "connection_lost", Some(&error)),
                            agent_notified,
                        );
                    }
                    let backoff = self.config.poll_backoff.backoff(consecutive_errors);
                    tokio::time::sleep(backoff.to_std().unwrap_or(Duration::ZERO)).await;
                }
            }
        }

        // Budget exhausted: one final snapshot, returned as completed with a
        // warning rather than as a failure.
        tracing::warn!(job_id = %ctx.job.id, "Tracking budget exhausted, taking a final snapshot");
        let view = self
            .provider_status(profile, ctx.provider_ref)
            .await
            .unwrap_or_else(|_| ProviderCallStatus::not_found());
        let agent = self.agent_view(&ctx.job.id).await;
        let final_ctx = ResultContext {
            method: "timeout",
            ..*ctx
        };
        let mut result = call::completion_result(&final_ctx, &view, agent.as_ref());
        if let Some(bag) = result.as_object_mut() {
            bag.insert(
                "warning".to_owned(),
                json!(format!(
                    "Completed via timeout after {}s",
                    self.config.budget.as_secs()
                )),
            );
        }
        record_notification(result, agent_notified)
    }

    /// One probe of the ordered status sources: the stored callback record
    /// first, the provider second. Errors from either count against the
    /// tracking error ceiling.
    async fn probe(
        &self,
        ctx: &ResultContext<'_>,
        profile: TrackingProfile,
    ) -> Result<Probe, String> {
        if let Some(result) = self
            .pushed_result(&ctx.job.id)
            .await
            .map_err(|err| err.to_string())?
        {
            return Ok(Probe::Pushed(result));
        }
        self.provider_status(profile, ctx.provider_ref)
            .await
            .map(Probe::Status)
    }

    /// Provider status read, capped at the profile's per-request timeout.
    /// A timed out request counts as an error like any other.
    async fn provider_status(
        &self,
        profile: TrackingProfile,
        provider_ref: &str,
    ) -> Result<ProviderCallStatus, String> {
        match tokio::time::timeout(profile.request_timeout, self.provider.status(provider_ref))
            .await
        {
            Ok(view) => view.map_err(|err| err.to_string()),
            Err(_) => Err(format!(
                "Status request timed out after {}s",
                profile.request_timeout.as_secs()
            )),
        }
    }

    /// The result bag stored by a pushed completion callback, if one has
    /// arrived for this job.
    async fn pushed_result(&self, id: &JobId) -> Result<Option<Value>, StoreError> {
        Ok(self.store.get(id).await?.and_then(|job| job.result))
    }

    async fn resolve(
        &self,
        ctx: &ResultContext<'_>,
        view: &ProviderCallStatus,
        agent_notified: bool,
    ) -> Value {
        tracing::info!(job_id = %ctx.job.id, status = %view.status, "Call resolved");
        let agent = self.agent_view(&ctx.job.id).await;
        record_notification(
            call::completion_result(ctx, view, agent.as_ref()),
            agent_notified,
        )
    }

    /// Best-effort agent enrichment fetched at resolution time.
    async fn agent_view(&self, id: &JobId) -> Option<AgentCallStatus> {
        self.agent
            .status(id)
            .await
            .inspect_err(|err| {
                tracing::debug!(call_id = %id, "Agent enrichment unavailable: {err}");
            })
            .ok()
    }
}

fn since(start: Instant) -> TimeDelta {
    TimeDelta::seconds(start.elapsed().as_secs() as i64)
}

/// Stamps whether the agent heads-up landed on a result produced by this
/// attempt. Pushed callback bags bypass this and are returned untouched.
fn record_notification(mut result: Value, agent_notified: bool) -> Value {
    if let Some(bag) = result.as_object_mut() {
        bag.insert("agent_notified".to_owned(), Value::Bool(agent_notified));
    }
    result
}
