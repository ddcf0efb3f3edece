//! Pipeline domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::name::PipelineName;
use super::stage::StageInstance;

/// One numbered run of a named pipeline
///
/// The counter is assigned at creation (previous maximum for the name plus
/// one) and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInstance {
    pub id: i64,
    pub name: PipelineName,
    pub counter: i32,
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// Stage instances ordered by scheduling order, reruns included
    pub stages: Vec<StageInstance>,
}

impl PipelineInstance {
    pub fn identity(&self) -> PipelineIdentity {
        PipelineIdentity {
            id: self.id,
            name: self.name.clone(),
            counter: self.counter,
            label: self.label.clone(),
        }
    }

    /// True while at least one stage has not completed
    pub fn is_any_stage_active(&self) -> bool {
        self.stages.iter().any(StageInstance::is_active)
    }

    /// Latest run (highest counter) of the named stage
    pub fn latest_stage(&self, stage_name: &str) -> Option<&StageInstance> {
        self.stages
            .iter()
            .filter(|s| s.identifier.stage_name.eq_ignore_ascii_case(stage_name))
            .max_by_key(|s| s.identifier.stage_counter)
    }
}

/// Identity of a pipeline instance
///
/// Carried by lock state and lock errors so callers can name the instance
/// that holds a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineIdentity {
    pub id: i64,
    pub name: PipelineName,
    pub counter: i32,
    pub label: String,
}

impl fmt::Display for PipelineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (id {})", self.name, self.counter, self.id)
    }
}
