//! Engine configuration.
//!
//! Plain structs with `Default` impls covering the stock deployment.
//! `from_env` constructors read overrides from the environment so a
//! deployment can be tuned without code changes.

use std::time::Duration;

use chrono::TimeDelta;

use crate::backoff::{BackoffStrategy, Doubling, Linear};

/// Worker pool, retry, and bookkeeping knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent workers draining the queue.
    pub workers: usize,
    /// Global cap on dequeues per second, shared across workers.
    pub rate_limit_per_second: u64,
    /// How long a worker sleeps when the queue is empty.
    pub idle_sleep: Duration,
    /// How long a worker sleeps after an unexpected loop error.
    pub error_sleep: Duration,
    /// Cadence of the background scheduled-job promotion loop.
    pub sweep_interval: Duration,
    /// Cadence of the queue metrics refresh loop.
    pub metrics_interval: Duration,
    /// How long finished job records are retained.
    pub retention: TimeDelta,
    /// Delay policy for job-level retries.
    pub retry: BackoffStrategy<Doubling>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            rate_limit_per_second: 10,
            idle_sleep: Duration::from_secs(5),
            error_sleep: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(30),
            retention: TimeDelta::hours(24),
            retry: BackoffStrategy::default(),
        }
    }
}

impl QueueConfig {
    /// Reads `DIALQUEUE_WORKERS`, `DIALQUEUE_RATE_LIMIT`, and
    /// `DIALQUEUE_RETENTION_HOURS`, falling back to the defaults.
    pub fn from_env() -> Self {
        Self {
            workers: env_parsed("DIALQUEUE_WORKERS", 10),
            rate_limit_per_second: env_parsed("DIALQUEUE_RATE_LIMIT", 10),
            retention: TimeDelta::hours(env_parsed("DIALQUEUE_RETENTION_HOURS", 24)),
            ..Default::default()
        }
    }
}

/// Cadence and thresholds for the stuck-job reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// A processing job older than this is force-completed as missed.
    pub stuck_after: TimeDelta,
    /// Extended sleep after a sweep error.
    pub error_sleep: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stuck_after: TimeDelta::seconds(60),
            error_sleep: Duration::from_secs(60),
        }
    }
}

/// Cadence and thresholds for the crash recovery loop.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    /// Extended sleep after a recovery pass error.
    pub error_sleep: Duration,
    /// A processing job untouched for this long is treated as interrupted
    /// and requeued.
    pub stale_after: TimeDelta,
    /// Job records older than this are deleted outright.
    pub cleanup_after: TimeDelta,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            error_sleep: Duration::from_secs(60),
            stale_after: TimeDelta::minutes(10),
            cleanup_after: TimeDelta::days(7),
        }
    }
}

/// Timing bundle for one deployment environment.
///
/// Cloud deployments sit behind slower cold-starting infrastructure and get
/// more patient timeouts and a higher startup error tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingProfile {
    /// Budget for verifying that a placed call actually started.
    pub startup_timeout: Duration,
    /// Wait before the first status poll after placement.
    pub initial_delay: Duration,
    /// Pause between status polls.
    pub check_interval: Duration,
    /// Per-request timeout for status source calls.
    pub request_timeout: Duration,
    /// Consecutive transport errors tolerated during startup verification.
    pub startup_error_ceiling: u32,
}

impl TrackingProfile {
    pub const CLOUD: Self = Self {
        startup_timeout: Duration::from_secs(300),
        initial_delay: Duration::from_secs(30),
        check_interval: Duration::from_secs(20),
        request_timeout: Duration::from_secs(45),
        startup_error_ceiling: 8,
    };

    pub const LOCAL: Self = Self {
        startup_timeout: Duration::from_secs(120),
        initial_delay: Duration::from_secs(10),
        check_interval: Duration::from_secs(10),
        request_timeout: Duration::from_secs(15),
        startup_error_ceiling: 5,
    };
}

/// Configuration of the call tracking state machine.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Profile for the first tracking attempt.
    pub primary: TrackingProfile,
    /// Conservative profile for the single fallback attempt.
    pub fallback: TrackingProfile,
    /// Environment tag recorded in results.
    pub environment: String,
    /// Overall budget for one tracking attempt; expiry yields a
    /// completed-with-warning result rather than a failure.
    pub budget: Duration,
    /// A call still in a pre-answer provider status after this long is
    /// resolved as missed.
    pub stuck_after: TimeDelta,
    /// Consecutive tracking errors before the attempt is abandoned.
    pub error_ceiling: u32,
    /// Consecutive `completed` provider reads required before a completion
    /// is trusted.
    pub debounce_checks: u32,
    /// Delay policy after a failed status poll.
    pub poll_backoff: BackoffStrategy<Linear>,
}

impl TrackingConfig {
    pub fn local() -> Self {
        Self {
            primary: TrackingProfile::LOCAL,
            fallback: TrackingProfile::LOCAL,
            environment: "local".to_owned(),
            budget: Duration::from_secs(3600),
            stuck_after: TimeDelta::seconds(60),
            error_ceiling: 6,
            debounce_checks: 2,
            poll_backoff: BackoffStrategy::linear(TimeDelta::seconds(5))
                .with_max(TimeDelta::seconds(30)),
        }
    }

    pub fn cloud() -> Self {
        Self {
            primary: TrackingProfile::CLOUD,
            environment: "cloud".to_owned(),
            ..Self::local()
        }
    }

    /// Chooses the profile from `DIALQUEUE_ENVIRONMENT` (`cloud` or `local`),
    /// treating a set `K_SERVICE` variable as cloud when unset.
    pub fn from_env() -> Self {
        let cloud = match std::env::var("DIALQUEUE_ENVIRONMENT") {
            Ok(value) => value.eq_ignore_ascii_case("cloud"),
            Err(_) => std::env::var("K_SERVICE").is_ok(),
        };
        if cloud {
            Self::cloud()
        } else {
            Self::local()
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::local()
    }
}

pub(crate) fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

pub(crate) fn env_parsed<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stock_queue_config() {
        let config = QueueConfig::default();

        assert_eq!(config.workers, 10);
        assert_eq!(config.rate_limit_per_second, 10);
        assert_eq!(config.idle_sleep, Duration::from_secs(5));
        assert_eq!(config.error_sleep, Duration::from_secs(10));
        assert_eq!(config.metrics_interval, Duration::from_secs(30));
        assert_eq!(config.retention, TimeDelta::hours(24));
    }

    #[test]
    fn cloud_profile_is_more_patient_than_local() {
        assert_eq!(
            TrackingProfile::CLOUD,
            TrackingProfile {
                startup_timeout: Duration::from_secs(300),
                initial_delay: Duration::from_secs(30),
                check_interval: Duration::from_secs(20),
                request_timeout: Duration::from_secs(45),
                startup_error_ceiling: 8,
            }
        );
        assert_eq!(
            TrackingProfile::LOCAL,
            TrackingProfile {
                startup_timeout: Duration::from_secs(120),
                initial_delay: Duration::from_secs(10),
                check_interval: Duration::from_secs(10),
                request_timeout: Duration::from_secs(15),
                startup_error_ceiling: 5,
            }
        );
    }

    #[test]
    fn cloud_tracking_pairs_with_a_conservative_fallback() {
        let config = TrackingConfig::cloud();

        assert_eq!(config.primary, TrackingProfile::CLOUD);
        assert_eq!(config.fallback, TrackingProfile::LOCAL);
        assert_eq!(config.environment, "cloud");
        assert_eq!(config.budget, Duration::from_secs(3600));
        assert_eq!(config.stuck_after, TimeDelta::seconds(60));
        assert_eq!(config.error_ceiling, 6);
        assert_eq!(config.debounce_checks, 2);
    }

    #[test]
    fn environment_variables_override_queue_defaults() {
        std::env::set_var("DIALQUEUE_WORKERS", "3");
        std::env::set_var("DIALQUEUE_RATE_LIMIT", "50");

        let config = QueueConfig::from_env();

        assert_eq!(config.workers, 3);
        assert_eq!(config.rate_limit_per_second, 50);

        std::env::remove_var("DIALQUEUE_WORKERS");
        std::env::remove_var("DIALQUEUE_RATE_LIMIT");
    }
}
