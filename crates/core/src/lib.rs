//! `relq-core`: the job model shared by every layer.
//!
//! This crate is **pure**: no store access, no threads. It knows how a job is
//! encoded, how a failure is stamped onto it, and where store keys live.

pub mod backoff;
pub mod error;
pub mod failure;
pub mod id;
pub mod job;
pub mod keys;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use error::{CoreError, CoreResult};
pub use failure::{DEFAULT_STACKTRACE_SIZE, FailureReport, FailureRoute, format_error, format_stacktrace};
pub use id::{NodeId, QueueName};
pub use job::{DEFAULT_MAX_RETRY_COUNT, Job};
