//! Scheduling request DTOs
//!
//! These describe *what* to create. Deciding *when* to create a pipeline
//! instance is the scheduler's job, not this crate's.

use serde::{Deserialize, Serialize};

use crate::domain::name::PipelineName;

/// Request to create a new pipeline instance with its stages and jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPipeline {
    pub name: PipelineName,
    /// Explicit label; the assigned counter is used when absent
    pub label: Option<String>,
    pub stages: Vec<NewStage>,
}

impl NewPipeline {
    pub fn new(name: impl Into<PipelineName>) -> Self {
        Self {
            name: name.into(),
            label: None,
            stages: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_stage(mut self, stage: NewStage) -> Self {
        self.stages.push(stage);
        self
    }
}

/// A stage to schedule and the names of its jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStage {
    pub name: String,
    pub jobs: Vec<String>,
}

impl NewStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
        }
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.jobs.push(job.into());
        self
    }
}
