//! The job record as it travels between the work queue, in-progress lists and
//! the retry/dead sets.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::failure::{FailureReport, FailureRoute};
use crate::id::QueueName;

/// Retry budget applied when a job does not carry its own `max_retry_count`.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 25;

/// A background job.
///
/// `original_json` is the exact string the job was decoded from. Removal from
/// an in-progress list matches by value, so acknowledging a job must use this
/// string and never a re-encoded copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque job identity; never changes.
    pub jid: String,
    /// Queue the job belongs to.
    pub queue: String,
    /// Handler routing key.
    #[serde(default)]
    pub class: String,
    /// Handler arguments.
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_count: Option<u32>,
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub enqueued_at: Option<DateTime<Utc>>,
    /// First failure; set once.
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub failed_at: Option<DateTime<Utc>>,
    /// Most recent failure after the first.
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub retried_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_backtrace: Option<String>,
    /// Fields written by other producers; carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
    #[serde(skip)]
    original_json: String,
}

fn zero_if_null<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or(0))
}

impl Job {
    /// Create a fresh job for `queue` with a generated jid.
    pub fn new(queue: &QueueName, class: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self {
            jid: Uuid::now_v7().simple().to_string(),
            queue: queue.to_string(),
            class: class.into(),
            args,
            retry_count: 0,
            max_retry_count: None,
            enqueued_at: Some(Utc::now().trunc_subsecs(0)),
            failed_at: None,
            retried_at: None,
            error_message: None,
            error_backtrace: None,
            extra: Map::new(),
            original_json: String::new(),
        }
    }

    /// Override the retry budget for this job.
    pub fn with_max_retry_count(mut self, max: u32) -> Self {
        self.max_retry_count = Some(max);
        self
    }

    /// Parse a job from its stored form, remembering the exact input.
    pub fn decode(raw: impl Into<String>) -> CoreResult<Self> {
        let raw = raw.into();
        let mut job: Job =
            serde_json::from_str(&raw).map_err(|e| CoreError::decode(e.to_string()))?;
        job.original_json = raw;
        Ok(job)
    }

    /// Serialize the job; `original_json` is never part of the output.
    pub fn encode(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Encode {
            jid: self.jid.clone(),
            reason: e.to_string(),
        })
    }

    /// Encode the job and adopt the result as its stored form.
    ///
    /// Used by producers right before pushing the job onto a list.
    pub fn seal(mut self) -> CoreResult<Self> {
        self.original_json = self.encode()?;
        Ok(self)
    }

    /// The exact string this job was decoded from (empty if never stored).
    pub fn original_json(&self) -> &str {
        &self.original_json
    }

    pub fn effective_max_retry_count(&self, default: u32) -> u32 {
        self.max_retry_count.unwrap_or(default)
    }

    /// Stamp a failure onto the job and decide where it goes next.
    ///
    /// The first failure sets `failed_at`; every later one sets `retried_at`
    /// and leaves `failed_at` alone. `retry_count` grows by exactly one.
    pub fn record_failure(&mut self, report: FailureReport, default_max: u32) -> FailureRoute {
        let retry_count = self.retry_count.saturating_add(1);
        self.retry_count = retry_count;
        self.error_message = Some(report.message);
        self.error_backtrace = Some(report.backtrace);

        if retry_count > 1 {
            self.retried_at = Some(report.failed_at);
        } else {
            self.failed_at = Some(report.failed_at);
        }

        if retry_count <= self.effective_max_retry_count(default_max) {
            FailureRoute::Retry
        } else {
            FailureRoute::Dead
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn orders() -> QueueName {
        QueueName::new("orders").unwrap()
    }

    fn report(secs: i64) -> FailureReport {
        FailureReport {
            failed_at: Utc.timestamp_opt(secs, 0).unwrap(),
            message: "boom".to_string(),
            backtrace: String::new(),
        }
    }

    #[test]
    fn decode_keeps_exact_input() {
        let raw = r#"{"jid":"j1","queue":"orders","class":"Mail","args":[1, 2],"custom":true}"#;
        let job = Job::decode(raw).unwrap();

        assert_eq!(job.original_json(), raw);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.extra.get("custom"), Some(&JsonValue::Bool(true)));
    }

    #[test]
    fn null_retry_count_reads_as_zero() {
        let job = Job::decode(r#"{"jid":"j1","queue":"q","retry_count":null}"#).unwrap();
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Job::decode("not json"), Err(CoreError::Decode(_))));
        assert!(matches!(Job::decode(r#"{"queue":"q"}"#), Err(CoreError::Decode(_))));
    }

    #[test]
    fn timestamps_are_unix_seconds() {
        let mut job = Job::new(&orders(), "Mail", vec![]);
        job.record_failure(report(1_700_000_000), DEFAULT_MAX_RETRY_COUNT);

        let encoded = job.encode().unwrap();
        let value: JsonValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["failed_at"], JsonValue::from(1_700_000_000i64));
        assert!(value.get("retried_at").is_none());
        assert!(value.get("original_json").is_none());
    }

    #[test]
    fn sealed_job_round_trips_through_original_json() {
        let job = Job::new(&orders(), "Mail", vec![JsonValue::from("x")]).seal().unwrap();
        let decoded = Job::decode(job.original_json()).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn first_failure_sets_failed_at_only() {
        let mut job = Job::new(&orders(), "Mail", vec![]);
        let route = job.record_failure(report(100), DEFAULT_MAX_RETRY_COUNT);

        assert_eq!(route, FailureRoute::Retry);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.failed_at, Some(Utc.timestamp_opt(100, 0).unwrap()));
        assert!(job.retried_at.is_none());
    }

    #[test]
    fn later_failures_set_retried_at_and_keep_failed_at() {
        let mut job = Job::new(&orders(), "Mail", vec![]);
        job.record_failure(report(100), DEFAULT_MAX_RETRY_COUNT);
        job.record_failure(report(200), DEFAULT_MAX_RETRY_COUNT);

        assert_eq!(job.retry_count, 2);
        assert_eq!(job.failed_at, Some(Utc.timestamp_opt(100, 0).unwrap()));
        assert_eq!(job.retried_at, Some(Utc.timestamp_opt(200, 0).unwrap()));

        job.record_failure(report(300), DEFAULT_MAX_RETRY_COUNT);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.failed_at, Some(Utc.timestamp_opt(100, 0).unwrap()));
        assert_eq!(job.retried_at, Some(Utc.timestamp_opt(300, 0).unwrap()));
    }

    #[test]
    fn exceeding_budget_routes_to_dead() {
        let mut job = Job::new(&orders(), "Mail", vec![]).with_max_retry_count(2);

        assert_eq!(job.record_failure(report(1), 25), FailureRoute::Retry);
        assert_eq!(job.record_failure(report(2), 25), FailureRoute::Retry);
        assert_eq!(job.record_failure(report(3), 25), FailureRoute::Dead);
        assert_eq!(job.retry_count, 3);
    }

    #[test]
    fn default_budget_applies_without_override() {
        let mut job = Job::new(&orders(), "Mail", vec![]);
        job.retry_count = 4;
        assert_eq!(job.record_failure(report(1), 5), FailureRoute::Retry);
        assert_eq!(job.record_failure(report(2), 5), FailureRoute::Dead);
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Once the incremented count passes the budget the job is always
            /// dead, whatever it started with.
            #[test]
            fn route_is_dead_iff_count_exceeds_budget(prior in 0u32..100, max in 0u32..50) {
                let mut job = Job::new(&orders(), "Mail", vec![]).with_max_retry_count(max);
                job.retry_count = prior;

                let route = job.record_failure(report(10), DEFAULT_MAX_RETRY_COUNT);

                prop_assert_eq!(job.retry_count, prior + 1);
                if prior + 1 > max {
                    prop_assert_eq!(route, FailureRoute::Dead);
                } else {
                    prop_assert_eq!(route, FailureRoute::Retry);
                }
            }
        }
    }
}
