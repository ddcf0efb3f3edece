//! Execution State Store
//!
//! Cached, transaction-aware access to pipeline, stage and job state.
//!
//! Every write runs in a transaction and registers after-commit callbacks
//! that invalidate exactly the cache entries the write made stale, then
//! feed the transition to the active-pipeline index. Reads go through the
//! caches and fall back to the store on a miss. Everything handed out is a
//! private copy.

use baton_core::domain::job::{JobIdentifier, JobInstance, JobState, JobTransition};
use baton_core::domain::name::PipelineName;
use baton_core::domain::pipeline::PipelineInstance;
use baton_core::domain::stage::{StageIdentifier, StageInstance, StageState};
use baton_core::domain::status::ExecutionResult;
use baton_core::dto::history::{HistoryPage, Pagination, PipelineHistoryPage};
use baton_core::dto::schedule::{NewPipeline, NewStage};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use super::active::{ActivePipelineIndex, ActivePipelinesSnapshot};
use super::lock::PipelineLockRegistry;
use crate::cache::{CacheStats, TransactionalCache};
use crate::config::StateConfig;
use crate::error::{InvalidTransitionWarning, Result, StateError, StoreError, TransitionSubject};
use crate::repository::PersistenceStore;
use crate::sync::KeyedMutex;
use crate::transaction::{Transaction, Transactions};

/// Result of a state write that may be rejected as stale
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome<T> {
    /// The write committed; holds the updated instance
    Applied(T),
    /// The write targeted a completed instance or moved backwards and was dropped
    Ignored(InvalidTransitionWarning),
}

impl<T> TransitionOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            TransitionOutcome::Applied(value) => Some(value),
            TransitionOutcome::Ignored(_) => None,
        }
    }

    pub fn warning(&self) -> Option<&InvalidTransitionWarning> {
        match self {
            TransitionOutcome::Applied(_) => None,
            TransitionOutcome::Ignored(warning) => Some(warning),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PipelineKey {
    Id(i64),
    Counter(PipelineName, i32),
    Label(PipelineName, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StageKey {
    pipeline: PipelineName,
    stage: String,
}

impl StageKey {
    fn new(pipeline: &PipelineName, stage: &str) -> Self {
        Self {
            pipeline: pipeline.clone(),
            stage: stage.to_lowercase(),
        }
    }

    /// Dependency group shared by every history page of this stage
    fn group(&self) -> String {
        format!("{}/{}", self.pipeline.normalized(), self.stage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PageKey {
    stage: StageKey,
    page_size: usize,
    offset: usize,
}

type Cache<K, V> = Arc<TransactionalCache<K, V>>;

struct Caches {
    pipelines: Cache<PipelineKey, Option<PipelineInstance>>,
    most_recent: Cache<PipelineName, Option<i64>>,
    most_recent_passed: Cache<StageKey, Option<StageInstance>>,
    stages: Cache<i64, Option<StageInstance>>,
    jobs: Cache<i64, Option<JobInstance>>,
    active_job_ids: Cache<(), Vec<i64>>,
    history: Cache<PageKey, HistoryPage>,
    stage_counts: Cache<StageKey, usize>,
    stage_active: Cache<StageKey, bool>,
}

impl Caches {
    fn new(capacity: usize) -> Self {
        Self {
            pipelines: Arc::new(TransactionalCache::new("pipelines", capacity)),
            most_recent: Arc::new(TransactionalCache::new("most-recent-pipeline", capacity)),
            most_recent_passed: Arc::new(TransactionalCache::new("most-recent-passed-stage", capacity)),
            stages: Arc::new(TransactionalCache::new("stages", capacity)),
            jobs: Arc::new(TransactionalCache::new("jobs", capacity)),
            active_job_ids: Arc::new(TransactionalCache::new("active-job-ids", 1)),
            history: Arc::new(TransactionalCache::new("stage-history", capacity)),
            stage_counts: Arc::new(TransactionalCache::new("stage-counts", capacity)),
            stage_active: Arc::new(TransactionalCache::new("stage-active", capacity)),
        }
    }

    fn clear(&self) {
        self.pipelines.clear();
        self.most_recent.clear();
        self.most_recent_passed.clear();
        self.stages.clear();
        self.jobs.clear();
        self.active_job_ids.clear();
        self.history.clear();
        self.stage_counts.clear();
        self.stage_active.clear();
    }

    fn stats(&self) -> Vec<(&'static str, CacheStats)> {
        vec![
            (self.pipelines.name(), self.pipelines.stats()),
            (self.most_recent.name(), self.most_recent.stats()),
            (self.most_recent_passed.name(), self.most_recent_passed.stats()),
            (self.stages.name(), self.stages.stats()),
            (self.jobs.name(), self.jobs.stats()),
            (self.active_job_ids.name(), self.active_job_ids.stats()),
            (self.history.name(), self.history.stats()),
            (self.stage_counts.name(), self.stage_counts.stats()),
            (self.stage_active.name(), self.stage_active.stats()),
        ]
    }
}

/// Loads pipelines by id through the cache; cheap to clone into callbacks
#[derive(Clone)]
struct PipelineReader {
    store: Arc<dyn PersistenceStore>,
    cache: Cache<PipelineKey, Option<PipelineInstance>>,
}

impl PipelineReader {
    fn by_id(&self, id: i64) -> std::result::Result<Option<PipelineInstance>, StoreError> {
        self.cache
            .read_through(PipelineKey::Id(id), || self.store.load_pipeline(id))
    }

    fn is_active(&self, id: i64) -> std::result::Result<bool, StoreError> {
        Ok(self
            .by_id(id)?
            .is_some_and(|pipeline| pipeline.is_any_stage_active()))
    }
}

pub struct ExecutionStateStore {
    store: Arc<dyn PersistenceStore>,
    transactions: Transactions,
    config: StateConfig,
    index: Arc<ActivePipelineIndex>,
    locks: Arc<PipelineLockRegistry>,
    sections: KeyedMutex<String>,
    caches: Caches,
    pipelines: PipelineReader,
}

impl ExecutionStateStore {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        transactions: Transactions,
        config: StateConfig,
        index: Arc<ActivePipelineIndex>,
        locks: Arc<PipelineLockRegistry>,
    ) -> Self {
        let caches = Caches::new(config.cache_capacity);
        let pipelines = PipelineReader {
            store: Arc::clone(&store),
            cache: Arc::clone(&caches.pipelines),
        };
        Self {
            store,
            transactions,
            config,
            index,
            locks,
            sections: KeyedMutex::new(),
            caches,
            pipelines,
        }
    }

    /// Builds the active-pipeline index and optionally warms the pipeline cache
    pub fn initialize(&self) -> Result<()> {
        let count = self.index.rebuild(self.store.as_ref())?;

        if self.config.warm_history_on_start {
            for id in self.index.snapshot().ids_newest_first() {
                self.pipelines.by_id(id)?;
            }
            tracing::info!(instances = count, "Pipeline cache warmed");
        }
        Ok(())
    }

    // Scheduling

    /// Creates a new instance of the pipeline with every requested stage scheduled
    ///
    /// The counter is one past the highest used so far; the label defaults
    /// to the counter.
    pub fn schedule_pipeline(&self, request: &NewPipeline) -> Result<PipelineInstance> {
        let pipeline = self
            .transactions
            .run(|tx| self.schedule_pipeline_in(tx, request))?;
        tracing::info!(
            "Pipeline scheduled: {} with {} stage(s)",
            pipeline.identity(),
            pipeline.stages.len()
        );
        Ok(pipeline)
    }

    pub fn schedule_pipeline_in(&self, tx: &Transaction, request: &NewPipeline) -> Result<PipelineInstance> {
        validate_request(request)?;
        self.enter(tx, format!("schedule:{}", request.name.normalized()));

        let counter = self.store.max_pipeline_counter_in(tx, &request.name)? + 1;
        let label = request.label.clone().unwrap_or_else(|| counter.to_string());
        let mut pipeline = PipelineInstance {
            id: 0,
            name: request.name.clone(),
            counter,
            label,
            created_at: Utc::now(),
            stages: Vec::new(),
        };
        pipeline.id = self.store.insert_pipeline_instance(tx, &pipeline)?;
        self.after_pipeline_created(tx, &pipeline);

        for new_stage in &request.stages {
            let stage = self.insert_stage(tx, &pipeline, new_stage, 1)?;
            pipeline.stages.push(stage);
        }
        Ok(pipeline)
    }

    /// Schedules a new run of a stage that already ran in the instance
    ///
    /// The run reuses the job names of the previous run and gets the next
    /// stage counter. Fails while the previous run is still active.
    pub fn rerun_stage(&self, pipeline_id: i64, stage_name: &str) -> Result<StageInstance> {
        let stage = self.transactions.run(|tx| {
            let pipeline = self
                .store
                .load_pipeline(pipeline_id)?
                .ok_or_else(|| StateError::NotFound(format!("pipeline instance {}", pipeline_id)))?;
            self.enter(tx, format!("schedule:{}", pipeline.name.normalized()));

            let previous = pipeline.latest_stage(stage_name).ok_or_else(|| {
                StateError::InvalidRequest(format!(
                    "stage '{}' has never run in {}",
                    stage_name,
                    pipeline.identity()
                ))
            })?;
            if previous.is_active() {
                return Err(StateError::InvalidRequest(format!(
                    "stage {} is still active",
                    previous.identifier
                )));
            }

            let request = NewStage {
                name: previous.name().to_string(),
                jobs: previous.jobs.iter().map(|job| job.name().to_string()).collect(),
            };
            let counter = self.store.max_stage_counter(pipeline_id, stage_name)? + 1;
            self.insert_stage(tx, &pipeline, &request, counter)
        })?;

        tracing::info!("Stage rerun scheduled: {}", stage.identifier);
        Ok(stage)
    }

    // Transitions

    /// Moves a stage forward
    ///
    /// A transition out of `Completed` or backwards is not applied; it is
    /// logged and returned as [`TransitionOutcome::Ignored`].
    pub fn record_stage_transition(
        &self,
        stage_id: i64,
        state: StageState,
        result: Option<ExecutionResult>,
    ) -> Result<TransitionOutcome<StageInstance>> {
        self.transactions
            .run(|tx| self.record_stage_transition_in(tx, stage_id, state, result))
    }

    pub fn record_stage_transition_in(
        &self,
        tx: &Transaction,
        stage_id: i64,
        state: StageState,
        result: Option<ExecutionResult>,
    ) -> Result<TransitionOutcome<StageInstance>> {
        validate_result("stage", stage_id, state.is_completed(), result)?;
        self.enter(tx, format!("stage:{}", stage_id));

        let current = self
            .store
            .load_stage_in(tx, stage_id)?
            .ok_or_else(|| StateError::NotFound(format!("stage {}", stage_id)))?;

        if !current.state.can_transition_to(state) {
            let warning = InvalidTransitionWarning {
                subject: TransitionSubject::Stage,
                identity: current.identifier.to_string(),
                current_state: current.state.to_string(),
                current_result: current.result,
                attempted_state: state.to_string(),
                attempted_result: result,
            };
            tracing::warn!("{}", warning);
            return Ok(TransitionOutcome::Ignored(warning));
        }

        let now = Utc::now();
        self.store.update_stage_state(tx, stage_id, state, result, now)?;

        let mut updated = current;
        updated.state = state;
        updated.result = result;
        if state.is_completed() {
            updated.completed_at = Some(now);
        }
        self.after_stage_saved(tx, &updated);

        tracing::debug!(stage = %updated.identifier, state = %state, "Stage transition recorded");
        Ok(TransitionOutcome::Applied(updated))
    }

    /// Moves a job forward and appends to its transition history
    ///
    /// `agent` is recorded when given and kept otherwise.
    pub fn record_job_transition(
        &self,
        job_id: i64,
        state: JobState,
        result: Option<ExecutionResult>,
        agent: Option<&str>,
    ) -> Result<TransitionOutcome<JobInstance>> {
        self.transactions
            .run(|tx| self.record_job_transition_in(tx, job_id, state, result, agent))
    }

    pub fn record_job_transition_in(
        &self,
        tx: &Transaction,
        job_id: i64,
        state: JobState,
        result: Option<ExecutionResult>,
        agent: Option<&str>,
    ) -> Result<TransitionOutcome<JobInstance>> {
        validate_result("job", job_id, state.is_completed(), result)?;
        self.enter(tx, format!("job:{}", job_id));

        let current = self
            .store
            .load_job_in(tx, job_id)?
            .ok_or_else(|| StateError::NotFound(format!("job {}", job_id)))?;

        if !current.state.can_transition_to(state) {
            let warning = InvalidTransitionWarning {
                subject: TransitionSubject::Job,
                identity: current.identifier.to_string(),
                current_state: current.state.to_string(),
                current_result: current.result,
                attempted_state: state.to_string(),
                attempted_result: result,
            };
            tracing::warn!("{}", warning);
            return Ok(TransitionOutcome::Ignored(warning));
        }

        let now = Utc::now();
        self.store
            .update_job_state(tx, job_id, state, result, agent, now)?;

        let mut updated = current;
        updated.state = state;
        updated.result = result;
        if let Some(agent) = agent {
            updated.agent = Some(agent.to_string());
        }
        updated.transitions.push(JobTransition { state, changed_at: now });
        self.after_job_saved(tx, &updated);

        tracing::debug!(job = %updated.identifier, state = %state, "Job transition recorded");
        Ok(TransitionOutcome::Applied(updated))
    }

    // Reads

    pub fn load_pipeline(&self, id: i64) -> Result<Option<PipelineInstance>> {
        Ok(self.pipelines.by_id(id)?)
    }

    pub fn find_pipeline_by_counter(&self, name: &PipelineName, counter: i32) -> Result<Option<PipelineInstance>> {
        let key = PipelineKey::Counter(name.clone(), counter);
        Ok(self.caches.pipelines.read_through(key, || {
            match self.store.find_pipeline_id_by_counter(name, counter)? {
                Some(id) => self.store.load_pipeline(id),
                None => Ok(None),
            }
        })?)
    }

    /// Newest instance carrying `label`
    pub fn find_pipeline_by_label(&self, name: &PipelineName, label: &str) -> Result<Option<PipelineInstance>> {
        let key = PipelineKey::Label(name.clone(), label.to_string());
        Ok(self.caches.pipelines.read_through(key, || {
            match self.store.find_pipeline_id_by_label(name, label)? {
                Some(id) => self.store.load_pipeline(id),
                None => Ok(None),
            }
        })?)
    }

    /// Newest instance of the pipeline
    pub fn most_recent(&self, name: &PipelineName) -> Result<Option<PipelineInstance>> {
        match self.most_recent_id(name)? {
            Some(id) => self.load_pipeline(id),
            None => Ok(None),
        }
    }

    /// Newest passed run of the stage
    pub fn most_recent_passed(&self, name: &PipelineName, stage: &str) -> Result<Option<StageInstance>> {
        let key = StageKey::new(name, stage);
        Ok(self.caches.most_recent_passed.read_through(key, || {
            match self.store.query_most_recent_passed(name, stage)? {
                Some(id) => self.store.load_stage(id),
                None => Ok(None),
            }
        })?)
    }

    pub fn stage_by_id(&self, id: i64) -> Result<Option<StageInstance>> {
        Ok(self
            .caches
            .stages
            .read_through(id, || self.store.load_stage(id))?)
    }

    /// A job with its full transition history
    pub fn load_with_transitions(&self, job_id: i64) -> Result<JobInstance> {
        self.caches
            .jobs
            .read_through(job_id, || self.store.load_job(job_id))?
            .ok_or_else(|| StateError::NotFound(format!("job {}", job_id)))
    }

    /// Every job that has not completed, oldest first
    pub fn active_jobs(&self) -> Result<Vec<JobInstance>> {
        let ids = self
            .caches
            .active_job_ids
            .read_through((), || self.store.query_active_job_ids())?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let job = self
                .caches
                .jobs
                .read_through(id, || self.store.load_job(id))?;
            if let Some(job) = job.filter(|job| !job.is_completed()) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Whether any run of the stage has not completed
    pub fn is_stage_active(&self, name: &PipelineName, stage: &str) -> Result<bool> {
        let key = StageKey::new(name, stage);
        Ok(self
            .caches
            .stage_active
            .read_through(key, || self.store.is_stage_active(name, stage))?)
    }

    pub fn stage_run_count(&self, name: &PipelineName, stage: &str) -> Result<usize> {
        Ok(self.stage_count(name, stage)?)
    }

    /// One page of the stage's runs, newest first
    ///
    /// `page_size` must lie in `1..=max_page_size`.
    pub fn history_page(
        &self,
        name: &PipelineName,
        stage: &str,
        page_size: usize,
        offset: usize,
    ) -> Result<HistoryPage> {
        self.validate_page_size(page_size)?;

        let key = PageKey {
            stage: StageKey::new(name, stage),
            page_size,
            offset,
        };
        let group = key.stage.group();
        Ok(self.caches.history.read_through_with_dependency(key, &group, || {
            let total = self.stage_count(name, stage)?;
            let stages = self.store.query_history_page(name, stage, page_size, offset)?;
            Ok::<_, StoreError>(HistoryPage {
                pipeline_name: name.clone(),
                stage_name: stage.to_string(),
                pagination: Pagination::new(offset, page_size, total),
                stages,
            })
        })?)
    }

    /// One page of the pipeline's instances, newest first
    pub fn pipeline_history(&self, name: &PipelineName, page_size: usize, offset: usize) -> Result<PipelineHistoryPage> {
        self.validate_page_size(page_size)?;

        let total = self.store.count_pipeline_instances(name)?;
        let ids = if page_size == 1 && offset == 0 {
            self.most_recent_id(name)?.into_iter().collect()
        } else {
            self.store.query_pipeline_ids(name, page_size, offset)?
        };

        let mut pipelines = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(pipeline) = self.load_pipeline(id)? {
                pipelines.push(pipeline);
            }
        }

        Ok(PipelineHistoryPage {
            pipeline_name: name.clone(),
            pagination: Pagination::new(offset, page_size, total),
            pipelines,
        })
    }

    pub fn active_pipelines(&self) -> ActivePipelinesSnapshot {
        self.index.snapshot()
    }

    /// The instances in the active-pipeline index, newest first
    pub fn active_pipeline_instances(&self) -> Result<Vec<PipelineInstance>> {
        let mut pipelines = Vec::new();
        for id in self.index.snapshot().ids_newest_first() {
            if let Some(pipeline) = self.load_pipeline(id)? {
                pipelines.push(pipeline);
            }
        }
        Ok(pipelines)
    }

    pub fn clear_caches(&self) {
        self.caches.clear();
        tracing::info!("Execution state caches cleared");
    }

    pub fn cache_stats(&self) -> Vec<(&'static str, CacheStats)> {
        self.caches.stats()
    }

    fn most_recent_id(&self, name: &PipelineName) -> std::result::Result<Option<i64>, StoreError> {
        self.caches
            .most_recent
            .read_through(name.clone(), || self.store.query_most_recent(name))
    }

    fn stage_count(&self, name: &PipelineName, stage: &str) -> std::result::Result<usize, StoreError> {
        self.caches
            .stage_counts
            .read_through(StageKey::new(name, stage), || {
                self.store.count_stage_instances(name, stage)
            })
    }

    fn validate_page_size(&self, page_size: usize) -> Result<()> {
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(StateError::InvalidPage(format!(
                "page size {} is outside 1..={}",
                page_size, self.config.max_page_size
            )));
        }
        Ok(())
    }

    fn enter(&self, tx: &Transaction, key: String) {
        tx.hold_section(key.clone(), &self.sections, key);
    }

    fn insert_stage(
        &self,
        tx: &Transaction,
        pipeline: &PipelineInstance,
        request: &NewStage,
        counter: i32,
    ) -> Result<StageInstance> {
        let now = Utc::now();
        let mut stage = StageInstance {
            id: 0,
            pipeline_id: pipeline.id,
            identifier: StageIdentifier {
                pipeline_name: pipeline.name.clone(),
                pipeline_counter: pipeline.counter,
                pipeline_label: pipeline.label.clone(),
                stage_name: request.name.clone(),
                stage_counter: counter,
            },
            state: StageState::Scheduled,
            result: None,
            scheduled_at: now,
            completed_at: None,
            jobs: Vec::new(),
        };
        stage.id = self.store.insert_stage_instance(tx, &stage)?;

        for job_name in &request.jobs {
            let mut job = JobInstance {
                id: 0,
                stage_id: stage.id,
                pipeline_id: pipeline.id,
                identifier: JobIdentifier {
                    stage: stage.identifier.clone(),
                    job_name: job_name.clone(),
                },
                state: JobState::Scheduled,
                result: None,
                agent: None,
                transitions: vec![JobTransition {
                    state: JobState::Scheduled,
                    changed_at: now,
                }],
            };
            job.id = self.store.insert_job_instance(tx, &job)?;
            self.caches.jobs.invalidate_after_commit(tx, job.id);
            stage.jobs.push(job);
        }
        if !stage.jobs.is_empty() {
            self.caches.active_job_ids.invalidate_after_commit(tx, ());
        }

        self.after_stage_saved(tx, &stage);
        Ok(stage)
    }

    fn after_pipeline_created(&self, tx: &Transaction, pipeline: &PipelineInstance) {
        let pipelines = &self.caches.pipelines;
        pipelines.invalidate_after_commit(tx, PipelineKey::Id(pipeline.id));
        pipelines.invalidate_after_commit(tx, PipelineKey::Counter(pipeline.name.clone(), pipeline.counter));
        pipelines.invalidate_after_commit(tx, PipelineKey::Label(pipeline.name.clone(), pipeline.label.clone()));
        self.caches.most_recent.invalidate_after_commit(tx, pipeline.name.clone());
    }

    fn invalidate_pipeline_after_commit(&self, tx: &Transaction, pipeline_id: i64, stage: &StageIdentifier) {
        let pipelines = &self.caches.pipelines;
        pipelines.invalidate_after_commit(tx, PipelineKey::Id(pipeline_id));
        pipelines.invalidate_after_commit(
            tx,
            PipelineKey::Counter(stage.pipeline_name.clone(), stage.pipeline_counter),
        );
        pipelines.invalidate_after_commit(
            tx,
            PipelineKey::Label(stage.pipeline_name.clone(), stage.pipeline_label.clone()),
        );
    }

    // Invalidations are registered before the index update so the index
    // reads committed pipelines.
    fn after_stage_saved(&self, tx: &Transaction, stage: &StageInstance) {
        let key = StageKey::new(stage.pipeline_name(), stage.name());

        self.caches.stages.invalidate_after_commit(tx, stage.id);
        self.invalidate_pipeline_after_commit(tx, stage.pipeline_id, &stage.identifier);
        self.caches
            .history
            .invalidate_dependency_after_commit(tx, key.group());
        self.caches.stage_counts.invalidate_after_commit(tx, key.clone());
        self.caches.stage_active.invalidate_after_commit(tx, key.clone());
        self.caches.most_recent_passed.invalidate_after_commit(tx, key);
        self.locks.invalidate_after_commit(tx, stage.pipeline_name());

        let index = Arc::clone(&self.index);
        let pipelines = self.pipelines.clone();
        let stage = stage.clone();
        tx.on_after_commit(move || {
            index.on_stage_transition(&stage, |id| pipelines.is_active(id));
        });
    }

    fn after_job_saved(&self, tx: &Transaction, job: &JobInstance) {
        let stage = &job.identifier.stage;
        let key = StageKey::new(&stage.pipeline_name, &stage.stage_name);

        self.caches.jobs.invalidate_after_commit(tx, job.id);
        if job.is_completed() {
            self.caches.active_job_ids.invalidate_after_commit(tx, ());
        }
        self.caches.stages.invalidate_after_commit(tx, job.stage_id);
        self.invalidate_pipeline_after_commit(tx, job.pipeline_id, stage);
        self.caches
            .history
            .invalidate_dependency_after_commit(tx, key.group());
        self.caches.most_recent_passed.invalidate_after_commit(tx, key);
    }
}

fn validate_request(request: &NewPipeline) -> Result<()> {
    if request.name.as_str().trim().is_empty() {
        return Err(StateError::InvalidRequest("pipeline name must not be empty".to_string()));
    }
    if request.stages.is_empty() {
        return Err(StateError::InvalidRequest(format!(
            "pipeline '{}' has no stages",
            request.name
        )));
    }

    let mut stage_names = HashSet::new();
    for stage in &request.stages {
        if stage.name.trim().is_empty() {
            return Err(StateError::InvalidRequest("stage name must not be empty".to_string()));
        }
        if !stage_names.insert(stage.name.to_lowercase()) {
            return Err(StateError::InvalidRequest(format!(
                "stage '{}' appears more than once",
                stage.name
            )));
        }

        let mut job_names = HashSet::new();
        for job in &stage.jobs {
            if !job_names.insert(job.to_lowercase()) {
                return Err(StateError::InvalidRequest(format!(
                    "job '{}' appears more than once in stage '{}'",
                    job, stage.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_result(subject: &str, id: i64, completed: bool, result: Option<ExecutionResult>) -> Result<()> {
    match (completed, result) {
        (true, None) => Err(StateError::InvalidRequest(format!(
            "completing {} {} requires a result",
            subject, id
        ))),
        (false, Some(result)) => Err(StateError::InvalidRequest(format!(
            "{} {} cannot be {} before it completes",
            subject, id, result
        ))),
        _ => Ok(()),
    }
}
