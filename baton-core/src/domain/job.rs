//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::stage::StageIdentifier;
use super::status::ExecutionResult;

/// A run of a named job within a stage instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: i64,
    pub stage_id: i64,
    pub pipeline_id: i64,
    pub identifier: JobIdentifier,
    pub state: JobState,
    pub result: Option<ExecutionResult>,
    /// Agent the job was assigned to, once `Assigned`
    pub agent: Option<String>,
    /// Every applied state change, oldest first
    pub transitions: Vec<JobTransition>,
}

impl JobInstance {
    pub fn name(&self) -> &str {
        &self.identifier.job_name
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }
}

/// Job lifecycle state, declared in lifecycle order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobState {
    Scheduled,
    Assigned,
    Building,
    Completed,
}

impl JobState {
    pub fn is_completed(self) -> bool {
        matches!(self, JobState::Completed)
    }

    /// Same rule as stages: forward only, `Completed` is terminal
    pub fn can_transition_to(self, next: JobState) -> bool {
        !self.is_completed() && next >= self
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Scheduled => write!(f, "Scheduled"),
            JobState::Assigned => write!(f, "Assigned"),
            JobState::Building => write!(f, "Building"),
            JobState::Completed => write!(f, "Completed"),
        }
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub state: JobState,
    pub changed_at: DateTime<Utc>,
}

/// Identity of a job instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentifier {
    pub stage: StageIdentifier,
    pub job_name: String,
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.job_name)
    }
}
