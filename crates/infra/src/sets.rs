//! Retry and dead sets: time-ordered homes for failed jobs.
//!
//! Both are sorted sets of encoded jobs. The retry set is scored by the time a
//! job becomes due again, the dead set by the time the job gave up.

use std::time::Duration;

use chrono::{DateTime, Utc};

use relq_core::keys::{DEAD_KEY, RETRY_KEY};
use relq_core::{BackoffPolicy, CoreError, Job};

use crate::store::{QueueStore, ScheduledEntry, SetTrim, StoreError};

/// Failure to file a job into one of the sets.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Encode(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Jobs scheduled for another attempt.
#[derive(Debug, Clone)]
pub struct RetrySet {
    pub key: String,
    pub backoff: BackoffPolicy,
}

impl Default for RetrySet {
    fn default() -> Self {
        Self {
            key: RETRY_KEY.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetrySet {
    /// When a job that failed at `failed_at` becomes due again.
    pub fn due_at(&self, job: &Job, failed_at: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.delay_for_attempt(job.retry_count);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| failed_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Add `job` (already stamped with its failure) to the set.
    ///
    /// `release` names the list entry the job leaves in the same atomic unit.
    pub fn add<S: QueueStore>(
        &self,
        store: &mut S,
        job: &Job,
        failed_at: DateTime<Utc>,
        release: Option<(&str, &str)>,
    ) -> Result<(), SubmitError> {
        let member = job.encode()?;
        store.schedule(&ScheduledEntry {
            set: &self.key,
            score: score(self.due_at(job, failed_at)),
            member: &member,
            release,
            trim: None,
        })?;
        Ok(())
    }
}

/// Jobs that exhausted their retries. Terminal.
#[derive(Debug, Clone)]
pub struct DeadSet {
    pub key: String,
    /// Entries kept at most; oldest go first.
    pub max_jobs: usize,
    /// Entries older than this (relative to the newest insert) are dropped.
    pub max_age: Duration,
}

impl Default for DeadSet {
    fn default() -> Self {
        Self {
            key: DEAD_KEY.to_string(),
            max_jobs: 10_000,
            max_age: Duration::from_secs(180 * 24 * 60 * 60),
        }
    }
}

impl DeadSet {
    pub fn add<S: QueueStore>(
        &self,
        store: &mut S,
        job: &Job,
        failed_at: DateTime<Utc>,
        release: Option<(&str, &str)>,
    ) -> Result<(), SubmitError> {
        let member = job.encode()?;
        let oldest_kept = chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| failed_at.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        store.schedule(&ScheduledEntry {
            set: &self.key,
            score: score(failed_at),
            member: &member,
            release,
            trim: Some(SetTrim {
                min_score: score(oldest_kept),
                max_len: self.max_jobs,
            }),
        })?;
        Ok(())
    }
}
