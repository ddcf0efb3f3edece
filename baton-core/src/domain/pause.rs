//! Pipeline pause state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a pipeline is paused, and by whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseInfo {
    pub paused: bool,
    pub cause: Option<String>,
    pub paused_by: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
}

impl PauseInfo {
    /// The "not paused" value, also what a never-paused pipeline reports
    pub fn unpaused() -> Self {
        Self {
            paused: false,
            cause: None,
            paused_by: None,
            paused_at: None,
        }
    }

    pub fn paused(cause: impl Into<String>, paused_by: impl Into<String>) -> Self {
        Self {
            paused: true,
            cause: Some(cause.into()),
            paused_by: Some(paused_by.into()),
            paused_at: Some(Utc::now()),
        }
    }
}

impl Default for PauseInfo {
    fn default() -> Self {
        Self::unpaused()
    }
}
