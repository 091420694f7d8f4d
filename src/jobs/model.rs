//! Job data model: jobs, queued messages, attempts, and API payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobStatus, MAX_TRANSITIONS, StateTransition};
use crate::conditions::Condition;
use crate::error::JobError;
use crate::sheet::Row;

/// Status of one recipient's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for its first attempt.
    Pending,
    /// Handed to the transport.
    Sending,
    /// Delivered.
    Sent,
    /// Permanently failed.
    Failed,
    /// Failed transiently, waiting for its backoff to elapse.
    Retry,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

/// One transport attempt. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttempt {
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Raw transport error, kept for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One recipient's send within a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: Uuid,
    pub job_id: Uuid,
    pub phone: String,
    /// Rendered body.
    pub message: String,
    /// Substitution data: template variable → value.
    pub data: Row,
    pub retry_count: u32,
    /// Lower values are dispatched first.
    pub priority: i32,
    /// Not eligible before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: Vec<MessageAttempt>,
    pub status: MessageStatus,
    /// Coarse, observer-facing failure reason.
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(job_id: Uuid, planned: PlannedMessage, message: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            phone: planned.phone,
            message,
            data: planned.data,
            retry_count: 0,
            priority: planned.priority,
            scheduled_at: planned.scheduled_at,
            attempts: Vec::new(),
            status: MessageStatus::Pending,
            error: None,
            updated_at: now,
        }
    }

    /// Whether the message may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Append an attempt and move to its status.
    pub fn record_attempt(
        &mut self,
        status: MessageStatus,
        raw_error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.attempts.push(MessageAttempt {
            timestamp: now,
            status,
            error: raw_error,
        });
        self.status = status;
        self.updated_at = now;
    }

    /// Per-recipient view for status queries.
    pub fn result(&self) -> MessageResult {
        MessageResult {
            phone: self.phone.clone(),
            status: self.status,
            error: self.error.clone(),
            timestamp: self.updated_at,
            retry_count: self.retry_count,
            data: self.data.clone(),
        }
    }
}

/// A message to enqueue, before rendering.
#[derive(Debug, Clone)]
pub struct PlannedMessage {
    pub phone: String,
    /// Row the body is rendered from.
    pub data: Row,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl PlannedMessage {
    pub fn new(phone: impl Into<String>, data: Row) -> Self {
        Self {
            phone: phone.into(),
            data,
            priority: 0,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Per-recipient terminal view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResult {
    pub phone: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub data: Row,
}

/// Aggregate progress, derived from a job's counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub pending: usize,
    pub percentage: u32,
}

impl JobProgress {
    pub fn from_counts(total: usize, sent: usize, failed: usize, pending: usize) -> Self {
        let percentage = if total > 0 {
            (((sent + failed) as f64 / total as f64) * 100.0).round() as u32
        } else {
            0
        };
        Self {
            total,
            sent,
            failed,
            pending,
            percentage,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.sent + self.failed + self.pending
    }
}

/// One bulk-send campaign.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub file_id: Uuid,
    pub status: JobStatus,
    pub template: String,
    pub conditions: Vec<Condition>,
    pub test_mode: bool,
    pub total_messages: usize,
    pub sent_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the job failed, if it did.
    pub error: Option<String>,
    pub transitions: Vec<StateTransition>,
}

impl Job {
    pub fn new(spec: &JobSpec, total: usize, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_id: spec.file_id,
            status: JobStatus::Queued,
            template: spec.template.clone(),
            conditions: spec.conditions.clone(),
            test_mode: spec.test_mode,
            total_messages: total,
            sent_count: 0,
            failed_count: 0,
            pending_count: total,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress::from_counts(
            self.total_messages,
            self.sent_count,
            self.failed_count,
            self.pending_count,
        )
    }

    /// Move one pending message to sent.
    pub fn count_sent(&mut self) {
        self.pending_count -= 1;
        self.sent_count += 1;
    }

    /// Move one pending message to failed.
    pub fn count_failed(&mut self) {
        self.pending_count -= 1;
        self.failed_count += 1;
    }

    /// Transition to a new status, recording history and timestamps.
    pub fn transition_to(
        &mut self,
        target: JobStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.status,
            to: target,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = target;

        match target {
            JobStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed => self.completed_at = Some(now),
            _ => {}
        }

        Ok(())
    }
}

/// What a job is built from.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub file_id: Uuid,
    pub template: String,
    pub conditions: Vec<Condition>,
    pub test_mode: bool,
}

/// Create-job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub file_id: Uuid,
    pub template: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Dry run: no transport calls, still counted as sent.
    #[serde(default)]
    pub test_mode: bool,
    /// Restrict the send to these numbers (must also match the conditions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_numbers: Option<Vec<String>>,
}

/// Create-job response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub total_messages: usize,
    pub status: JobStatus,
    /// Template variables no column could resolve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Full status of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub results: Vec<MessageResult>,
    /// Seconds, from recent throughput.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub test_mode: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            file_id: job.file_id,
            status: job.status,
            progress: job.progress(),
            test_mode: job.test_mode,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Result of a pause/resume/cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    /// The transition happened.
    Applied { status: JobStatus },
    /// Already in the requested state; nothing changed.
    AlreadyInState { status: JobStatus },
    /// The job is completed or failed; the request was rejected.
    AlreadyTerminal { status: JobStatus },
}

impl ControlOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Applied { status }
            | Self::AlreadyInState { status }
            | Self::AlreadyTerminal { status } => *status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec {
            file_id: Uuid::new_v4(),
            template: "Hi".into(),
            conditions: vec![],
            test_mode: false,
        }
    }

    #[test]
    fn progress_percentage_rounds() {
        let p = JobProgress::from_counts(3, 1, 0, 2);
        assert_eq!(p.percentage, 33);
        let p = JobProgress::from_counts(3, 1, 1, 1);
        assert_eq!(p.percentage, 67);
        assert!(p.is_consistent());
        assert_eq!(JobProgress::from_counts(0, 0, 0, 0).percentage, 0);
    }

    #[test]
    fn job_transitions_set_timestamps() {
        let now = Utc::now();
        let mut job = Job::new(&spec(), 2, now);
        assert_eq!(job.pending_count, 2);

        job.transition_to(JobStatus::Running, None, now).unwrap();
        assert_eq!(job.started_at, Some(now));
        job.transition_to(JobStatus::Paused, None, now).unwrap();
        job.transition_to(JobStatus::Running, None, now).unwrap();
        job.transition_to(JobStatus::Completed, None, now).unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.transitions.len(), 4);

        let err = job.transition_to(JobStatus::Running, None, now).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[test]
    fn transition_history_capped() {
        let now = Utc::now();
        let mut job = Job::new(&spec(), 1, now);
        job.transition_to(JobStatus::Running, None, now).unwrap();
        for _ in 0..250 {
            job.transition_to(JobStatus::Paused, None, now).unwrap();
            job.transition_to(JobStatus::Running, None, now).unwrap();
        }
        assert!(job.transitions.len() <= MAX_TRANSITIONS);
    }

    #[test]
    fn counts_preserve_total() {
        let mut job = Job::new(&spec(), 3, Utc::now());
        job.count_sent();
        job.count_failed();
        assert!(job.progress().is_consistent());
        assert_eq!(job.progress().pending, 1);
    }

    #[test]
    fn control_outcome_wire_format() {
        let json = serde_json::to_string(&ControlOutcome::AlreadyTerminal {
            status: JobStatus::Completed,
        })
        .unwrap();
        assert_eq!(json, r#"{"outcome":"already_terminal","status":"completed"}"#);
    }

    #[test]
    fn due_check() {
        let now = Utc::now();
        let planned = PlannedMessage::new("+1", Row::new())
            .scheduled_at(now + chrono::Duration::seconds(10));
        let msg = QueuedMessage::new(Uuid::new_v4(), planned, "hi".into(), now);
        assert!(!msg.is_due(now));
        assert!(msg.is_due(now + chrono::Duration::seconds(10)));
    }
}
