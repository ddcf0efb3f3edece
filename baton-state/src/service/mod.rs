//! Service Module
//!
//! Coordination services built on the persistence seam: pipeline locks,
//! pause state, the active-pipeline index and the cached execution state.

pub mod active;
pub mod execution;
pub mod lock;
pub mod pause;

pub use active::{ActivePipelineIndex, ActivePipelinesSnapshot};
pub use execution::{ExecutionStateStore, TransitionOutcome};
pub use lock::PipelineLockRegistry;
pub use pause::PauseRegistry;
