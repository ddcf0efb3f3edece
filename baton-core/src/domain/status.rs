//! Execution results shared by stages and jobs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final outcome of a completed stage or job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionResult {
    Passed,
    Failed,
    Cancelled,
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionResult::Passed => write!(f, "Passed"),
            ExecutionResult::Failed => write!(f, "Failed"),
            ExecutionResult::Cancelled => write!(f, "Cancelled"),
        }
    }
}
