//! Failure bookkeeping: what gets stamped onto a job when its handler fails.

use std::error::Error;

use chrono::{DateTime, Utc};

/// Frames kept from a failing job's stacktrace unless configured otherwise.
pub const DEFAULT_STACKTRACE_SIZE: usize = 5;

/// Where a failed job goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRoute {
    /// Retry budget left; schedule a retry.
    Retry,
    /// Budget exhausted; archive as dead.
    Dead,
}

/// A single failure, already formatted for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub failed_at: DateTime<Utc>,
    pub message: String,
    pub backtrace: String,
}

impl FailureReport {
    /// Build a report from an error and the frames captured where it surfaced.
    pub fn new<S: AsRef<str>>(
        failed_at: DateTime<Utc>,
        error: &(dyn Error + '_),
        stacktrace: &[S],
        stacktrace_size: usize,
    ) -> Self {
        Self {
            failed_at,
            message: format_error(error),
            backtrace: format_stacktrace(stacktrace, stacktrace_size),
        }
    }
}

/// Render an error and its source chain as `outer: inner: root`.
pub fn format_error(error: &(dyn Error + '_)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Keep at most `limit` frames, one per indented line.
pub fn format_stacktrace<S: AsRef<str>>(frames: &[S], limit: usize) -> String {
    frames
        .iter()
        .take(limit)
        .map(|frame| format!("    {}\n", frame.as_ref().trim()))
        .collect()
}
