use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobState::Queued),
            "RUNNING" => Some(JobState::Running),
            "SUCCEEDED" => Some(JobState::Succeeded),
            "FAILED" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("dispatch job {job_id} cannot go from {from:?} to {to:?}")]
pub struct JobError {
    pub job_id: Uuid,
    pub from: JobState,
    pub to: JobState,
}

/// Lifecycle record of one dispatch pass.
///
/// The job carries no snapshot of the requests it covers: running it again
/// re-reads whatever is still pending, which is what makes re-queueing safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: Uuid,
    pub state: JobState,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn queued(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::Queued,
            attempts: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobState::Queued, JobState::Running, now)?;
        self.attempts += 1;
        self.error = None;
        Ok(())
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobState::Running, JobState::Succeeded, now)
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobState::Running, JobState::Failed, now)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobState::Failed, JobState::Queued, now)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.state == JobState::Running && now - self.updated_at > stale_after
    }

    fn transition(&mut self, from: JobState, to: JobState, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.state != from {
            return Err(JobError {
                job_id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }
}
