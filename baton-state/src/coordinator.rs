//! Coordinator
//!
//! Wires the registries, the active-pipeline index and the execution state
//! store around one persistence store, and exposes the operations the rest
//! of an orchestrator calls.

use baton_core::domain::job::{JobInstance, JobState};
use baton_core::domain::lock::PipelineLockState;
use baton_core::domain::name::PipelineName;
use baton_core::domain::pause::PauseInfo;
use baton_core::domain::pipeline::{PipelineIdentity, PipelineInstance};
use baton_core::domain::stage::{StageInstance, StageState};
use baton_core::domain::status::ExecutionResult;
use baton_core::dto::history::{HistoryPage, PipelineHistoryPage};
use baton_core::dto::schedule::NewPipeline;
use std::sync::Arc;

use crate::config::StateConfig;
use crate::error::{LockError, Result, StoreError};
use crate::repository::PersistenceStore;
use crate::service::{
    ActivePipelineIndex, ActivePipelinesSnapshot, ExecutionStateStore, PauseRegistry, PipelineLockRegistry,
    TransitionOutcome,
};
use crate::transaction::{TransactionManager, Transactions};

pub struct Coordinator {
    transactions: Transactions,
    locks: Arc<PipelineLockRegistry>,
    pauses: PauseRegistry,
    index: Arc<ActivePipelineIndex>,
    executions: ExecutionStateStore,
}

impl Coordinator {
    /// Builds a coordinator over a store that also manages its transactions
    pub fn new<S>(store: Arc<S>, config: StateConfig) -> Self
    where
        S: PersistenceStore + TransactionManager + 'static,
    {
        let transactions: Arc<dyn TransactionManager> = store.clone();
        Self::with_parts(store, transactions, config)
    }

    pub fn with_parts(
        store: Arc<dyn PersistenceStore>,
        transactions: Arc<dyn TransactionManager>,
        config: StateConfig,
    ) -> Self {
        let transactions = Transactions::new(transactions);
        let index = Arc::new(ActivePipelineIndex::new());
        let locks = Arc::new(PipelineLockRegistry::new(
            Arc::clone(&store),
            transactions.clone(),
            &config,
        ));
        let pauses = PauseRegistry::new(Arc::clone(&store), transactions.clone(), &config);
        let executions = ExecutionStateStore::new(
            store,
            transactions.clone(),
            config,
            Arc::clone(&index),
            Arc::clone(&locks),
        );

        Self {
            transactions,
            locks,
            pauses,
            index,
            executions,
        }
    }

    /// Cold start: scans storage for active instances
    pub fn initialize(&self) -> Result<()> {
        tracing::info!("Initializing coordination state...");
        self.executions.initialize()?;
        tracing::info!(
            pipelines = self.index.snapshot().len(),
            "Coordination state ready"
        );
        Ok(())
    }

    pub fn transactions(&self) -> &Transactions {
        &self.transactions
    }

    pub fn locks(&self) -> &PipelineLockRegistry {
        &self.locks
    }

    pub fn pauses(&self) -> &PauseRegistry {
        &self.pauses
    }

    pub fn executions(&self) -> &ExecutionStateStore {
        &self.executions
    }

    // Locks

    pub fn lock_pipeline(&self, instance: &PipelineInstance) -> std::result::Result<(), LockError> {
        self.locks.lock_pipeline(instance)
    }

    pub fn unlock_pipeline(&self, name: &PipelineName) -> std::result::Result<(), StoreError> {
        self.locks.unlock_pipeline(name)
    }

    pub fn current_lock(&self, name: &PipelineName) -> std::result::Result<PipelineLockState, StoreError> {
        self.locks.current_lock(name)
    }

    pub fn locked_pipelines(&self) -> std::result::Result<Vec<PipelineIdentity>, StoreError> {
        self.locks.locked_pipelines()
    }

    // Pause

    pub fn pause(&self, name: &PipelineName, cause: &str, paused_by: &str) -> std::result::Result<PauseInfo, StoreError> {
        self.pauses.pause(name, cause, paused_by)
    }

    pub fn unpause(&self, name: &PipelineName) -> std::result::Result<(), StoreError> {
        self.pauses.unpause(name)
    }

    pub fn pause_state(&self, name: &PipelineName) -> std::result::Result<PauseInfo, StoreError> {
        self.pauses.pause_state(name)
    }

    // Execution state

    pub fn schedule_pipeline(&self, request: &NewPipeline) -> Result<PipelineInstance> {
        self.executions.schedule_pipeline(request)
    }

    pub fn rerun_stage(&self, pipeline_id: i64, stage_name: &str) -> Result<StageInstance> {
        self.executions.rerun_stage(pipeline_id, stage_name)
    }

    pub fn record_stage_transition(
        &self,
        stage_id: i64,
        state: StageState,
        result: Option<ExecutionResult>,
    ) -> Result<TransitionOutcome<StageInstance>> {
        self.executions.record_stage_transition(stage_id, state, result)
    }

    pub fn record_job_transition(
        &self,
        job_id: i64,
        state: JobState,
        result: Option<ExecutionResult>,
        agent: Option<&str>,
    ) -> Result<TransitionOutcome<JobInstance>> {
        self.executions
            .record_job_transition(job_id, state, result, agent)
    }

    pub fn active_pipelines(&self) -> ActivePipelinesSnapshot {
        self.index.snapshot()
    }

    /// Jobs that have not completed yet
    pub fn active_jobs(&self) -> Result<Vec<JobInstance>> {
        self.executions.active_jobs()
    }

    pub fn history_page(
        &self,
        name: &PipelineName,
        stage: &str,
        page_size: usize,
        offset: usize,
    ) -> Result<HistoryPage> {
        self.executions.history_page(name, stage, page_size, offset)
    }

    pub fn pipeline_history(&self, name: &PipelineName, page_size: usize, offset: usize) -> Result<PipelineHistoryPage> {
        self.executions.pipeline_history(name, page_size, offset)
    }

    /// Drops every cached value; the active-pipeline index is kept
    pub fn clear_caches(&self) {
        self.executions.clear_caches();
        self.locks.clear_cache();
        self.pauses.clear_cache();
    }
}
