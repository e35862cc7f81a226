//! The task record moved through the lifecycle streams.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TaskId};

/// A unit of work routed to a performer.
///
/// The payload and routing fields are immutable once created; only the
/// lifecycle bookkeeping (timestamps, retry counter, last error) changes as
/// the record moves between streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier
    pub task_id: TaskId,
    /// Job the task was produced for
    pub job_id: JobId,
    /// Destination performer
    pub performer_address: String,
    /// Per-target definition id
    pub task_definition_id: i32,
    /// Opaque work description
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Failure transitions so far (never decreases)
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Requested confirmation timeout, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Earliest re-dispatch time while staged for retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a new record with no timeout.
    pub fn new(
        task_id: TaskId,
        job_id: JobId,
        performer_address: impl Into<String>,
        task_definition_id: i32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id,
            job_id,
            performer_address: performer_address.into(),
            task_definition_id,
            payload,
            retry_count: 0,
            last_attempt_at: None,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
            last_error: None,
            timeout_secs: None,
            scheduled_for: None,
        }
    }

    /// Request a confirmation timeout (whole seconds, rounded up).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let mut secs = timeout.as_secs();
        if timeout.subsec_nanos() > 0 {
            secs += 1;
        }
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Reject records that cannot be routed.
    pub fn validate(&self) -> DomainResult<()> {
        if self.performer_address.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "task {} has no performer address",
                self.task_id
            )));
        }
        Ok(())
    }

    /// Start a (new) dispatched lifecycle.
    pub fn mark_dispatched(&mut self, at: DateTime<Utc>) {
        self.dispatched_at = Some(at);
        self.last_attempt_at = Some(at);
        self.completed_at = None;
        self.scheduled_for = None;
    }

    pub fn mark_completed(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.scheduled_for = None;
    }

    /// Record a failure transition.
    ///
    /// Increments the retry counter exactly once per call.
    pub fn mark_failed(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(reason.into());
        self.last_attempt_at = Some(at);
    }

    pub fn schedule_retry(&mut self, at: DateTime<Utc>) {
        self.scheduled_for = Some(at);
    }

    /// Whether a staged retry may be re-dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_none_or(|at| at <= now)
    }

    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self).map_err(|e| DomainError::malformed(e.to_string()))
    }

    pub fn from_json(raw: &str) -> DomainResult<Self> {
        serde_json::from_str(raw).map_err(|e| DomainError::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TaskRecord {
        TaskRecord::new(
            TaskId::new(42),
            JobId::new(7),
            "0xperformer",
            3,
            json!({ "target": "0xabc", "args": [1, 2] }),
        )
    }

    #[test]
    fn failure_increments_retry_counter_once() {
        let mut task = sample();
        let at = Utc::now();
        task.mark_failed("performer unreachable", at);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("performer unreachable"));
        assert_eq!(task.last_attempt_at, Some(at));

        task.mark_failed("again", at);
        assert_eq!(task.retry_count, 2);
    }

    #[test]
    fn timeout_rounds_up_to_whole_seconds() {
        let task = sample().with_timeout(Duration::from_millis(1500));
        assert_eq!(task.timeout_secs, Some(2));
        assert_eq!(task.timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn serialized_form_uses_wire_field_names() {
        let task = sample().with_timeout(Duration::from_secs(3600));
        let value: serde_json::Value = serde_json::from_str(&task.to_json().unwrap()).unwrap();
        assert_eq!(value["task_id"], json!(42));
        assert_eq!(value["job_id"], json!(7));
        assert_eq!(value["performer_address"], json!("0xperformer"));
        assert_eq!(value["task_definition_id"], json!(3));
        assert_eq!(value["timeout_secs"], json!(3600));
        assert!(value.get("completed_at").is_none());
    }

    #[test]
    fn decoding_garbage_is_a_malformed_record() {
        let err = TaskRecord::from_json("{not json").unwrap_err();
        assert!(matches!(err, DomainError::MalformedRecord(_)));
    }

    #[test]
    fn empty_performer_is_rejected() {
        let mut task = sample();
        task.performer_address = "  ".to_string();
        assert!(matches!(task.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn staged_retry_becomes_due_at_schedule() {
        let now = Utc::now();
        let mut task = sample();
        assert!(task.is_due(now));
        task.schedule_retry(now + chrono::Duration::seconds(10));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + chrono::Duration::seconds(10)));
    }
}
