//! Repository Module
//!
//! The persistence seam. [`PersistenceStore`] is everything the
//! coordination layer needs from durable storage: writes are issued inside
//! a [`Transaction`] and become visible when it commits. Plain reads observe
//! committed state only; the `*_in` reads also see the writes the given
//! transaction has made so far. [`InMemoryStore`] implements it together with
//! [`TransactionManager`](crate::transaction::TransactionManager).

pub mod memory;

pub use memory::InMemoryStore;

use baton_core::domain::job::{JobInstance, JobState};
use baton_core::domain::lock::PipelineLockState;
use baton_core::domain::name::PipelineName;
use baton_core::domain::pause::PauseInfo;
use baton_core::domain::pipeline::{PipelineIdentity, PipelineInstance};
use baton_core::domain::stage::{StageInstance, StageState};
use baton_core::domain::status::ExecutionResult;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::transaction::Transaction;

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage for pipelines, stages, jobs, locks and pause state
///
/// Stage names are matched case-insensitively, like pipeline names.
pub trait PersistenceStore: Send + Sync {
    // Writes

    /// Inserts the pipeline row (without stages) and returns its id
    fn insert_pipeline_instance(&self, tx: &Transaction, pipeline: &PipelineInstance) -> StoreResult<i64>;

    /// Inserts the stage row (without jobs) and returns its id
    fn insert_stage_instance(&self, tx: &Transaction, stage: &StageInstance) -> StoreResult<i64>;

    /// Inserts the job row with its recorded transitions and returns its id
    fn insert_job_instance(&self, tx: &Transaction, job: &JobInstance) -> StoreResult<i64>;

    fn update_stage_state(
        &self,
        tx: &Transaction,
        stage_id: i64,
        state: StageState,
        result: Option<ExecutionResult>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Updates the job and appends a transition record
    fn update_job_state(
        &self,
        tx: &Transaction,
        job_id: i64,
        state: JobState,
        result: Option<ExecutionResult>,
        agent: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    fn set_lock_state(&self, tx: &Transaction, name: &PipelineName, state: &PipelineLockState) -> StoreResult<()>;

    fn set_pause_state(&self, tx: &Transaction, name: &PipelineName, info: &PauseInfo) -> StoreResult<()>;

    // Reads

    fn get_lock_state(&self, name: &PipelineName) -> StoreResult<PipelineLockState>;

    fn query_locked_pipelines(&self) -> StoreResult<Vec<PipelineIdentity>>;

    fn get_pause_state(&self, name: &PipelineName) -> StoreResult<Option<PauseInfo>>;

    /// Every pipeline instance with at least one non-terminal stage
    fn query_active_instance_ids(&self) -> StoreResult<Vec<(PipelineName, i64)>>;

    /// Runs of one stage, newest first
    fn query_history_page(
        &self,
        name: &PipelineName,
        stage: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<StageInstance>>;

    fn count_stage_instances(&self, name: &PipelineName, stage: &str) -> StoreResult<usize>;

    /// Id of the newest instance of the pipeline
    fn query_most_recent(&self, name: &PipelineName) -> StoreResult<Option<i64>>;

    /// Id of the newest passed run of the stage
    fn query_most_recent_passed(&self, name: &PipelineName, stage: &str) -> StoreResult<Option<i64>>;

    /// Instance ids, newest first
    fn query_pipeline_ids(&self, name: &PipelineName, limit: usize, offset: usize) -> StoreResult<Vec<i64>>;

    fn count_pipeline_instances(&self, name: &PipelineName) -> StoreResult<usize>;

    /// The instance with its stages and their jobs
    fn load_pipeline(&self, id: i64) -> StoreResult<Option<PipelineInstance>>;

    fn find_pipeline_id_by_counter(&self, name: &PipelineName, counter: i32) -> StoreResult<Option<i64>>;

    /// Newest instance carrying `label`
    fn find_pipeline_id_by_label(&self, name: &PipelineName, label: &str) -> StoreResult<Option<i64>>;

    /// Highest counter used by the pipeline, 0 when it has never run
    fn max_pipeline_counter(&self, name: &PipelineName) -> StoreResult<i32>;

    /// Highest counter of the stage within one instance, 0 when it has never run
    fn max_stage_counter(&self, pipeline_id: i64, stage: &str) -> StoreResult<i32>;

    /// The stage with its jobs
    fn load_stage(&self, id: i64) -> StoreResult<Option<StageInstance>>;

    /// The job with its full transition history
    fn load_job(&self, id: i64) -> StoreResult<Option<JobInstance>>;

    /// Whether any run of the stage is non-terminal
    fn is_stage_active(&self, name: &PipelineName, stage: &str) -> StoreResult<bool>;

    /// Ids of every job that has not completed, ascending
    fn query_active_job_ids(&self) -> StoreResult<Vec<i64>>;

    // Reads through a transaction

    fn get_lock_state_in(&self, tx: &Transaction, name: &PipelineName) -> StoreResult<PipelineLockState>;

    fn max_pipeline_counter_in(&self, tx: &Transaction, name: &PipelineName) -> StoreResult<i32>;

    fn load_stage_in(&self, tx: &Transaction, id: i64) -> StoreResult<Option<StageInstance>>;

    fn load_job_in(&self, tx: &Transaction, id: i64) -> StoreResult<Option<JobInstance>>;
}
