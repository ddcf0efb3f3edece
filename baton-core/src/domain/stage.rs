//! Stage domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::job::JobInstance;
use super::name::PipelineName;
use super::status::ExecutionResult;

/// A run of a named stage within a pipeline instance
///
/// Reruns of the same stage name produce new instances with a higher
/// `stage_counter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInstance {
    pub id: i64,
    pub pipeline_id: i64,
    pub identifier: StageIdentifier,
    pub state: StageState,
    /// Set once the stage is `Completed`
    pub result: Option<ExecutionResult>,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs: Vec<JobInstance>,
}

impl StageInstance {
    pub fn name(&self) -> &str {
        &self.identifier.stage_name
    }

    pub fn pipeline_name(&self) -> &PipelineName {
        &self.identifier.pipeline_name
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }
}

/// Stage lifecycle state
///
/// Variants are declared in lifecycle order; transitions only move forward
/// and `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageState {
    Scheduled,
    Building,
    Completed,
}

impl StageState {
    pub fn is_active(self) -> bool {
        !self.is_completed()
    }

    pub fn is_completed(self) -> bool {
        matches!(self, StageState::Completed)
    }

    /// Whether moving from `self` to `next` is a forward transition
    ///
    /// Re-recording the current non-terminal state is accepted.
    pub fn can_transition_to(self, next: StageState) -> bool {
        !self.is_completed() && next >= self
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Scheduled => write!(f, "Scheduled"),
            StageState::Building => write!(f, "Building"),
            StageState::Completed => write!(f, "Completed"),
        }
    }
}

/// Identity of a stage instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageIdentifier {
    pub pipeline_name: PipelineName,
    pub pipeline_counter: i32,
    pub pipeline_label: String,
    pub stage_name: String,
    pub stage_counter: i32,
}

impl fmt::Display for StageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline_name, self.pipeline_counter, self.stage_name, self.stage_counter
        )
    }
}
