//! Pipeline lock state

use serde::{Deserialize, Serialize};

use super::pipeline::PipelineIdentity;

/// Lock marker for a pipeline name
///
/// At most one instance of a pipeline may hold the lock at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineLockState {
    Unlocked,
    LockedBy(PipelineIdentity),
}

impl PipelineLockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, PipelineLockState::LockedBy(_))
    }

    pub fn holder(&self) -> Option<&PipelineIdentity> {
        match self {
            PipelineLockState::LockedBy(identity) => Some(identity),
            PipelineLockState::Unlocked => None,
        }
    }

    /// True when the lock is held by an instance other than `instance_id`
    pub fn is_held_by_other(&self, instance_id: i64) -> bool {
        self.holder().is_some_and(|holder| holder.id != instance_id)
    }
}
