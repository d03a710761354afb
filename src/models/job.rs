//! Generation job model and its status lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Opaque request payload handed to the generation provider.
///
/// The core only checks that something was supplied; it never reads the contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(serde_json::Value);

impl JobPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Null, empty strings and empty containers are rejected at intake
    pub fn is_malformed(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.trim().is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::Object(fields) => fields.is_empty(),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for JobPayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
pub enum JobStatus {
    Pending,
    Dispatched,
    Ready,
    Failed,
    Scheduled,
    Played,
}

impl JobStatus {
    /// Whether `self -> next` is an edge of the job lifecycle.
    ///
    /// `Dispatched -> Pending` exists only for the circuit-open requeue policy.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Failed)
                | (Dispatched, Ready)
                | (Dispatched, Failed)
                | (Dispatched, Pending)
                | (Ready, Scheduled)
                | (Scheduled, Played)
        )
    }

    /// Terminal jobs are archived and never touched again
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Played)
    }
}

/// Output of a successful generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Where the playback executor can fetch the generated audio
    pub uri: String,
    /// Expected airtime; becomes the slot length
    #[serde(with = "crate::config::duration_serde::duration")]
    pub duration: Duration,
}

/// A submission as produced by the intake collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub submitter_id: String,
    pub payload: JobPayload,
    pub category: String,
}

impl NewJob {
    pub fn new<S: Into<String>, C: Into<String>>(
        submitter_id: S,
        payload: JobPayload,
        category: C,
    ) -> Self {
        Self {
            submitter_id: submitter_id.into(),
            payload,
            category: category.into(),
        }
    }
}

/// One generation request moving through the queue, the dispatcher and the planner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub submitter_id: String,
    pub payload: JobPayload,
    pub priority_score: f64,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Total provider attempts across every dispatch; never decreases
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Genre tag, only used for broadcast diversity
    pub category: String,
    pub artifact: Option<Artifact>,
}

impl Job {
    /// Create a pending job submitted now
    pub fn new(request: NewJob) -> Self {
        Self::new_at(request, Utc::now())
    }

    /// Create a pending job with an explicit submission time
    pub fn new_at(request: NewJob, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter_id: request.submitter_id,
            payload: request.payload,
            priority_score: 0.0,
            submitted_at,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            category: request.category,
            artifact: None,
        }
    }

    /// Move the job to `next`, rejecting edges the lifecycle does not allow
    pub fn transition(&mut self, next: JobStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the job failed and remember why
    pub fn fail<S: Into<String>>(&mut self, reason: S) -> AppResult<()> {
        self.transition(JobStatus::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Attach the generated artifact and mark the job ready for broadcast
    pub fn complete(&mut self, artifact: Artifact) -> AppResult<()> {
        self.transition(JobStatus::Ready)?;
        self.artifact = Some(artifact);
        Ok(())
    }

    pub fn record_attempts(&mut self, attempts: u32) {
        self.attempts = self.attempts.saturating_add(attempts);
    }

    /// Airtime of the generated artifact, if any
    pub fn expected_duration(&self) -> Option<Duration> {
        self.artifact.as_ref().map(|a| a.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::IntoEnumIterator;

    fn sample_job() -> Job {
        Job::new(NewJob::new(
            "alice",
            JobPayload::new(json!({"prompt": "lofi rain"})),
            "lofi",
        ))
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);

        job.transition(JobStatus::Dispatched).unwrap();
        job.complete(Artifact {
            uri: "mem://1".to_string(),
            duration: Duration::from_secs(180),
        })
        .unwrap();
        job.transition(JobStatus::Scheduled).unwrap();
        job.transition(JobStatus::Played).unwrap();

        assert!(job.status.is_terminal());
        assert_eq!(job.expected_duration(), Some(Duration::from_secs(180)));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for next in JobStatus::iter() {
            assert!(!JobStatus::Failed.can_transition_to(next));
            assert!(!JobStatus::Played.can_transition_to(next));
        }
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut job = sample_job();
        let err = job.transition(JobStatus::Played).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Pending);

        job.fail("submitter banned").unwrap();
        assert_eq!(job.last_error.as_deref(), Some("submitter banned"));
        assert!(job.transition(JobStatus::Dispatched).is_err());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(JobPayload::new(json!(null)).is_malformed());
        assert!(JobPayload::new(json!("   ")).is_malformed());
        assert!(JobPayload::new(json!({})).is_malformed());
        assert!(!JobPayload::new(json!({"prompt": "synthwave"})).is_malformed());
        assert!(!JobPayload::new(json!(42)).is_malformed());
    }

    #[test]
    fn test_attempts_never_decrease() {
        let mut job = sample_job();
        job.record_attempts(2);
        job.record_attempts(0);
        job.record_attempts(1);
        assert_eq!(job.attempts, 3);
    }
}
