//! The purpose of this module is to alleviate the need to import many of the `[dialqueue]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use dialqueue::prelude::*;
//! ```
pub use crate::agent::AgentClient;
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::config::{QueueConfig, ReaperConfig, RecoveryConfig, TrackingConfig};
pub use crate::job::{CallJob, JobId, JobStatus, Priority};
pub use crate::provider::CallProvider;
pub use crate::queue::Enqueued;
pub use crate::recovery::Resilience;
pub use crate::report::ResultReporter;
pub use crate::store::memory::InMemoryStore;
pub use crate::store::JobStore;
pub use crate::DialQueue;
