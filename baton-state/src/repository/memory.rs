//! In-memory store
//!
//! Keeps committed rows in ordered tables behind a read/write lock and
//! journals the writes of every open transaction separately. Commit applies
//! a journal atomically; rollback throws it away. Plain reads only ever see
//! the committed tables. Reads through a transaction replay its journal over
//! a copy of the rows they touch.
//!
//! Faults can be injected to exercise failure paths, and every call is
//! counted so tests can assert which reads were served from cache.

use baton_core::domain::job::{JobInstance, JobState, JobTransition};
use baton_core::domain::lock::PipelineLockState;
use baton_core::domain::name::PipelineName;
use baton_core::domain::pause::PauseInfo;
use baton_core::domain::pipeline::{PipelineIdentity, PipelineInstance};
use baton_core::domain::stage::{StageInstance, StageState};
use baton_core::domain::status::ExecutionResult;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use uuid::Uuid;

use super::{PersistenceStore, StoreResult};
use crate::error::StoreError;
use crate::transaction::{Transaction, TransactionManager};

#[derive(Default)]
struct Tables {
    pipelines: BTreeMap<i64, PipelineInstance>,
    stages: BTreeMap<i64, StageInstance>,
    jobs: BTreeMap<i64, JobInstance>,
    locks: HashMap<PipelineName, PipelineIdentity>,
    pauses: HashMap<PipelineName, PauseInfo>,
}

impl Tables {
    fn stage_with_jobs(&self, stage: &StageInstance) -> StageInstance {
        let mut stage = stage.clone();
        stage.jobs = self
            .jobs
            .values()
            .filter(|job| job.stage_id == stage.id)
            .cloned()
            .collect();
        stage
    }

    fn pipeline_with_stages(&self, pipeline: &PipelineInstance) -> PipelineInstance {
        let mut pipeline = pipeline.clone();
        pipeline.stages = self
            .stages
            .values()
            .filter(|stage| stage.pipeline_id == pipeline.id)
            .map(|stage| self.stage_with_jobs(stage))
            .collect();
        pipeline
    }

    fn runs_of<'a>(
        &'a self,
        name: &'a PipelineName,
        stage: &'a str,
    ) -> impl DoubleEndedIterator<Item = &'a StageInstance> + 'a {
        self.stages.values().filter(move |s| {
            s.pipeline_name() == name && s.name().eq_ignore_ascii_case(stage)
        })
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::Pipeline(pipeline) => {
                self.pipelines.insert(pipeline.id, pipeline);
            }
            Write::Stage(stage) => {
                self.stages.insert(stage.id, stage);
            }
            Write::Job(job) => {
                self.jobs.insert(job.id, job);
            }
            Write::StageState { id, state, result, at } => {
                if let Some(stage) = self.stages.get_mut(&id) {
                    stage.state = state;
                    stage.result = result;
                    if state.is_completed() {
                        stage.completed_at = Some(at);
                    }
                }
            }
            Write::JobState {
                id,
                state,
                result,
                agent,
                at,
            } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = state;
                    job.result = result;
                    if agent.is_some() {
                        job.agent = agent;
                    }
                    job.transitions.push(JobTransition { state, changed_at: at });
                }
            }
            Write::Lock { name, state } => match state {
                PipelineLockState::LockedBy(identity) => {
                    self.locks.insert(name, identity);
                }
                PipelineLockState::Unlocked => {
                    self.locks.remove(&name);
                }
            },
            Write::Pause { name, info } => {
                self.pauses.insert(name, info);
            }
        }
    }
}

#[derive(Clone)]
enum Write {
    Pipeline(PipelineInstance),
    Stage(StageInstance),
    Job(JobInstance),
    StageState {
        id: i64,
        state: StageState,
        result: Option<ExecutionResult>,
        at: DateTime<Utc>,
    },
    JobState {
        id: i64,
        state: JobState,
        result: Option<ExecutionResult>,
        agent: Option<String>,
        at: DateTime<Utc>,
    },
    Lock {
        name: PipelineName,
        state: PipelineLockState,
    },
    Pause {
        name: PipelineName,
        info: PauseInfo,
    },
}

#[derive(Default)]
struct Faults {
    fail_next_write: AtomicBool,
    fail_next_commit: AtomicBool,
    fail_reads: AtomicBool,
}

/// Transactional in-memory implementation of [`PersistenceStore`]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    journals: Mutex<HashMap<Uuid, Vec<Write>>>,
    pipeline_ids: AtomicI64,
    stage_ids: AtomicI64,
    job_ids: AtomicI64,
    faults: Faults,
    calls: DashMap<&'static str, u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            journals: Mutex::new(HashMap::new()),
            pipeline_ids: AtomicI64::new(1),
            stage_ids: AtomicI64::new(1),
            job_ids: AtomicI64::new(1),
            faults: Faults::default(),
            calls: DashMap::new(),
        }
    }

    /// The next write in any transaction fails with a backend error
    pub fn fail_next_write(&self) {
        self.faults.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// The next commit fails and its journal is discarded
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Every read fails with a backend error while set
    pub fn set_fail_reads(&self, fail: bool) {
        self.faults.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// How many times `operation` has been called
    pub fn calls(&self, operation: &str) -> u64 {
        self.calls.get(operation).map_or(0, |count| *count)
    }

    pub fn reset_calls(&self) {
        self.calls.clear();
    }

    /// Transactions begun and not yet committed or rolled back
    pub fn open_transactions(&self) -> usize {
        self.journals.lock().len()
    }

    fn record(&self, operation: &'static str) {
        *self.calls.entry(operation).or_insert(0) += 1;
    }

    fn read(&self, operation: &'static str) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.record(operation);
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("simulated read failure in {}", operation)));
        }
        Ok(self.tables.read())
    }

    fn write(&self, operation: &'static str, tx: &Transaction, write: Write) -> StoreResult<()> {
        self.record(operation);
        if self.faults.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("simulated write failure in {}", operation)));
        }
        let mut journals = self.journals.lock();
        let journal = journals
            .get_mut(&tx.id())
            .ok_or_else(|| StoreError::Conflict(format!("transaction {} is not active", tx.id())))?;
        journal.push(write);
        Ok(())
    }

    /// Committed rows picked by `seed` with the journal of `tx` applied on top
    fn view_in(
        &self,
        operation: &'static str,
        tx: &Transaction,
        seed: impl FnOnce(&Tables) -> Tables,
    ) -> StoreResult<Tables> {
        let mut view = {
            let tables = self.read(operation)?;
            seed(&tables)
        };
        if let Some(journal) = self.journals.lock().get(&tx.id()) {
            for write in journal {
                view.apply(write.clone());
            }
        }
        Ok(view)
    }

    // Rows inserted earlier in the same transaction count as present.
    fn stage_exists(&self, tx: &Transaction, id: i64) -> bool {
        if self.tables.read().stages.contains_key(&id) {
            return true;
        }
        self.journals.lock().get(&tx.id()).is_some_and(|journal| {
            journal
                .iter()
                .any(|write| matches!(write, Write::Stage(stage) if stage.id == id))
        })
    }

    fn job_exists(&self, tx: &Transaction, id: i64) -> bool {
        if self.tables.read().jobs.contains_key(&id) {
            return true;
        }
        self.journals.lock().get(&tx.id()).is_some_and(|journal| {
            journal
                .iter()
                .any(|write| matches!(write, Write::Job(job) if job.id == id))
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for InMemoryStore {
    fn begin(&self) -> StoreResult<Transaction> {
        self.record("begin");
        let tx = Transaction::new();
        self.journals.lock().insert(tx.id(), Vec::new());
        Ok(tx)
    }

    fn commit(&self, tx: &Transaction) -> StoreResult<()> {
        self.record("commit");
        let journal = self
            .journals
            .lock()
            .remove(&tx.id())
            .ok_or_else(|| StoreError::Conflict(format!("transaction {} is not active", tx.id())))?;

        if self.faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated commit failure".to_string()));
        }

        let mut tables = self.tables.write();
        for write in journal {
            tables.apply(write);
        }
        Ok(())
    }

    fn rollback(&self, tx: &Transaction) {
        self.record("rollback");
        self.journals.lock().remove(&tx.id());
    }
}

impl PersistenceStore for InMemoryStore {
    fn insert_pipeline_instance(&self, tx: &Transaction, pipeline: &PipelineInstance) -> StoreResult<i64> {
        let id = self.pipeline_ids.fetch_add(1, Ordering::SeqCst);
        let mut row = pipeline.clone();
        row.id = id;
        row.stages.clear();
        self.write("insert_pipeline_instance", tx, Write::Pipeline(row))?;
        Ok(id)
    }

    fn insert_stage_instance(&self, tx: &Transaction, stage: &StageInstance) -> StoreResult<i64> {
        let id = self.stage_ids.fetch_add(1, Ordering::SeqCst);
        let mut row = stage.clone();
        row.id = id;
        row.jobs.clear();
        self.write("insert_stage_instance", tx, Write::Stage(row))?;
        Ok(id)
    }

    fn insert_job_instance(&self, tx: &Transaction, job: &JobInstance) -> StoreResult<i64> {
        let id = self.job_ids.fetch_add(1, Ordering::SeqCst);
        let mut row = job.clone();
        row.id = id;
        self.write("insert_job_instance", tx, Write::Job(row))?;
        Ok(id)
    }

    fn update_stage_state(
        &self,
        tx: &Transaction,
        stage_id: i64,
        state: StageState,
        result: Option<ExecutionResult>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if !self.stage_exists(tx, stage_id) {
            return Err(StoreError::NotFound(format!("stage {}", stage_id)));
        }
        self.write(
            "update_stage_state",
            tx,
            Write::StageState {
                id: stage_id,
                state,
                result,
                at,
            },
        )
    }

    fn update_job_state(
        &self,
        tx: &Transaction,
        job_id: i64,
        state: JobState,
        result: Option<ExecutionResult>,
        agent: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if !self.job_exists(tx, job_id) {
            return Err(StoreError::NotFound(format!("job {}", job_id)));
        }
        self.write(
            "update_job_state",
            tx,
            Write::JobState {
                id: job_id,
                state,
                result,
                agent: agent.map(str::to_string),
                at,
            },
        )
    }

    fn set_lock_state(&self, tx: &Transaction, name: &PipelineName, state: &PipelineLockState) -> StoreResult<()> {
        self.write(
            "set_lock_state",
            tx,
            Write::Lock {
                name: name.clone(),
                state: state.clone(),
            },
        )
    }

    fn set_pause_state(&self, tx: &Transaction, name: &PipelineName, info: &PauseInfo) -> StoreResult<()> {
        self.write(
            "set_pause_state",
            tx,
            Write::Pause {
                name: name.clone(),
                info: info.clone(),
            },
        )
    }

    fn get_lock_state(&self, name: &PipelineName) -> StoreResult<PipelineLockState> {
        let tables = self.read("get_lock_state")?;
        Ok(tables
            .locks
            .get(name)
            .cloned()
            .map_or(PipelineLockState::Unlocked, PipelineLockState::LockedBy))
    }

    fn query_locked_pipelines(&self) -> StoreResult<Vec<PipelineIdentity>> {
        let tables = self.read("query_locked_pipelines")?;
        let mut locked: Vec<_> = tables.locks.values().cloned().collect();
        locked.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(locked)
    }

    fn get_pause_state(&self, name: &PipelineName) -> StoreResult<Option<PauseInfo>> {
        let tables = self.read("get_pause_state")?;
        Ok(tables.pauses.get(name).cloned())
    }

    fn query_active_instance_ids(&self) -> StoreResult<Vec<(PipelineName, i64)>> {
        let tables = self.read("query_active_instance_ids")?;
        let active: BTreeSet<(PipelineName, i64)> = tables
            .stages
            .values()
            .filter(|stage| stage.is_active())
            .map(|stage| (stage.pipeline_name().clone(), stage.pipeline_id))
            .collect();
        Ok(active.into_iter().collect())
    }

    fn query_history_page(
        &self,
        name: &PipelineName,
        stage: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<StageInstance>> {
        let tables = self.read("query_history_page")?;
        Ok(tables
            .runs_of(name, stage)
            .rev()
            .skip(offset)
            .take(limit)
            .map(|run| tables.stage_with_jobs(run))
            .collect())
    }

    fn count_stage_instances(&self, name: &PipelineName, stage: &str) -> StoreResult<usize> {
        let tables = self.read("count_stage_instances")?;
        Ok(tables.runs_of(name, stage).count())
    }

    fn query_most_recent(&self, name: &PipelineName) -> StoreResult<Option<i64>> {
        let tables = self.read("query_most_recent")?;
        Ok(tables
            .pipelines
            .values()
            .rev()
            .find(|pipeline| &pipeline.name == name)
            .map(|pipeline| pipeline.id))
    }

    fn query_most_recent_passed(&self, name: &PipelineName, stage: &str) -> StoreResult<Option<i64>> {
        let tables = self.read("query_most_recent_passed")?;
        Ok(tables
            .runs_of(name, stage)
            .rev()
            .find(|run| run.is_completed() && run.result == Some(ExecutionResult::Passed))
            .map(|run| run.id))
    }

    fn query_pipeline_ids(&self, name: &PipelineName, limit: usize, offset: usize) -> StoreResult<Vec<i64>> {
        let tables = self.read("query_pipeline_ids")?;
        Ok(tables
            .pipelines
            .values()
            .rev()
            .filter(|pipeline| &pipeline.name == name)
            .skip(offset)
            .take(limit)
            .map(|pipeline| pipeline.id)
            .collect())
    }

    fn count_pipeline_instances(&self, name: &PipelineName) -> StoreResult<usize> {
        let tables = self.read("count_pipeline_instances")?;
        Ok(tables.pipelines.values().filter(|p| &p.name == name).count())
    }

    fn load_pipeline(&self, id: i64) -> StoreResult<Option<PipelineInstance>> {
        let tables = self.read("load_pipeline")?;
        Ok(tables
            .pipelines
            .get(&id)
            .map(|pipeline| tables.pipeline_with_stages(pipeline)))
    }

    fn find_pipeline_id_by_counter(&self, name: &PipelineName, counter: i32) -> StoreResult<Option<i64>> {
        let tables = self.read("find_pipeline_id_by_counter")?;
        Ok(tables
            .pipelines
            .values()
            .find(|p| &p.name == name && p.counter == counter)
            .map(|p| p.id))
    }

    fn find_pipeline_id_by_label(&self, name: &PipelineName, label: &str) -> StoreResult<Option<i64>> {
        let tables = self.read("find_pipeline_id_by_label")?;
        Ok(tables
            .pipelines
            .values()
            .rev()
            .find(|p| &p.name == name && p.label == label)
            .map(|p| p.id))
    }

    fn max_pipeline_counter(&self, name: &PipelineName) -> StoreResult<i32> {
        let tables = self.read("max_pipeline_counter")?;
        Ok(tables
            .pipelines
            .values()
            .filter(|p| &p.name == name)
            .map(|p| p.counter)
            .max()
            .unwrap_or(0))
    }

    fn max_stage_counter(&self, pipeline_id: i64, stage: &str) -> StoreResult<i32> {
        let tables = self.read("max_stage_counter")?;
        Ok(tables
            .stages
            .values()
            .filter(|s| s.pipeline_id == pipeline_id && s.name().eq_ignore_ascii_case(stage))
            .map(|s| s.identifier.stage_counter)
            .max()
            .unwrap_or(0))
    }

    fn load_stage(&self, id: i64) -> StoreResult<Option<StageInstance>> {
        let tables = self.read("load_stage")?;
        Ok(tables.stages.get(&id).map(|stage| tables.stage_with_jobs(stage)))
    }

    fn load_job(&self, id: i64) -> StoreResult<Option<JobInstance>> {
        let tables = self.read("load_job")?;
        Ok(tables.jobs.get(&id).cloned())
    }

    fn is_stage_active(&self, name: &PipelineName, stage: &str) -> StoreResult<bool> {
        let tables = self.read("is_stage_active")?;
        let active = tables.runs_of(name, stage).any(|run| run.is_active());
        Ok(active)
    }

    fn query_active_job_ids(&self) -> StoreResult<Vec<i64>> {
        let tables = self.read("query_active_job_ids")?;
        Ok(tables
            .jobs
            .values()
            .filter(|job| !job.is_completed())
            .map(|job| job.id)
            .collect())
    }

    fn get_lock_state_in(&self, tx: &Transaction, name: &PipelineName) -> StoreResult<PipelineLockState> {
        let view = self.view_in("get_lock_state_in", tx, |tables| Tables {
            locks: tables
                .locks
                .get_key_value(name)
                .map(|(name, holder)| (name.clone(), holder.clone()))
                .into_iter()
                .collect(),
            ..Tables::default()
        })?;
        Ok(view
            .locks
            .get(name)
            .cloned()
            .map_or(PipelineLockState::Unlocked, PipelineLockState::LockedBy))
    }

    fn max_pipeline_counter_in(&self, tx: &Transaction, name: &PipelineName) -> StoreResult<i32> {
        let view = self.view_in("max_pipeline_counter_in", tx, |tables| Tables {
            pipelines: tables
                .pipelines
                .iter()
                .filter(|(_, p)| &p.name == name)
                .map(|(id, p)| (*id, p.clone()))
                .collect(),
            ..Tables::default()
        })?;
        Ok(view
            .pipelines
            .values()
            .filter(|p| &p.name == name)
            .map(|p| p.counter)
            .max()
            .unwrap_or(0))
    }

    fn load_stage_in(&self, tx: &Transaction, id: i64) -> StoreResult<Option<StageInstance>> {
        let view = self.view_in("load_stage_in", tx, |tables| Tables {
            stages: tables
                .stages
                .get(&id)
                .map(|stage| (id, stage.clone()))
                .into_iter()
                .collect(),
            jobs: tables
                .jobs
                .iter()
                .filter(|(_, job)| job.stage_id == id)
                .map(|(job_id, job)| (*job_id, job.clone()))
                .collect(),
            ..Tables::default()
        })?;
        Ok(view.stages.get(&id).map(|stage| view.stage_with_jobs(stage)))
    }

    fn load_job_in(&self, tx: &Transaction, id: i64) -> StoreResult<Option<JobInstance>> {
        let mut view = self.view_in("load_job_in", tx, |tables| Tables {
            jobs: tables
                .jobs
                .get(&id)
                .map(|job| (id, job.clone()))
                .into_iter()
                .collect(),
            ..Tables::default()
        })?;
        Ok(view.jobs.remove(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::domain::job::JobIdentifier;
    use baton_core::domain::stage::StageIdentifier;

    fn pipeline(name: &str, counter: i32) -> PipelineInstance {
        PipelineInstance {
            id: 0,
            name: PipelineName::from(name),
            counter,
            label: counter.to_string(),
            created_at: Utc::now(),
            stages: Vec::new(),
        }
    }

    fn stage(pipeline: &PipelineInstance, name: &str, counter: i32) -> StageInstance {
        StageInstance {
            id: 0,
            pipeline_id: pipeline.id,
            identifier: StageIdentifier {
                pipeline_name: pipeline.name.clone(),
                pipeline_counter: pipeline.counter,
                pipeline_label: pipeline.label.clone(),
                stage_name: name.to_string(),
                stage_counter: counter,
            },
            state: StageState::Scheduled,
            result: None,
            scheduled_at: Utc::now(),
            completed_at: None,
            jobs: Vec::new(),
        }
    }

    fn insert_run(store: &InMemoryStore, name: &str, counter: i32) -> (i64, i64) {
        let tx = store.begin().unwrap();
        let mut instance = pipeline(name, counter);
        instance.id = store.insert_pipeline_instance(&tx, &instance).unwrap();
        let stage_id = store
            .insert_stage_instance(&tx, &stage(&instance, "compile", 1))
            .unwrap();
        store.commit(&tx).unwrap();
        (instance.id, stage_id)
    }

    #[test]
    fn test_uncommitted_writes_are_invisible() {
        let store = InMemoryStore::new();
        let tx = store.begin().unwrap();
        let id = store
            .insert_pipeline_instance(&tx, &pipeline("build-1", 1))
            .unwrap();

        assert_eq!(store.load_pipeline(id).unwrap(), None);
        store.commit(&tx).unwrap();
        assert!(store.load_pipeline(id).unwrap().is_some());
    }

    #[test]
    fn test_rollback_discards_journal() {
        let store = InMemoryStore::new();
        let tx = store.begin().unwrap();
        let id = store
            .insert_pipeline_instance(&tx, &pipeline("build-1", 1))
            .unwrap();
        store.rollback(&tx);

        assert_eq!(store.load_pipeline(id).unwrap(), None);
        assert_eq!(store.open_transactions(), 0);
        assert!(matches!(store.commit(&tx), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_failed_commit_applies_nothing() {
        let store = InMemoryStore::new();
        store.fail_next_commit();
        let tx = store.begin().unwrap();
        let id = store
            .insert_pipeline_instance(&tx, &pipeline("build-1", 1))
            .unwrap();

        assert!(matches!(store.commit(&tx), Err(StoreError::Backend(_))));
        assert_eq!(store.load_pipeline(id).unwrap(), None);
    }

    #[test]
    fn test_history_is_newest_first() {
        let store = InMemoryStore::new();
        let stage_ids: Vec<i64> = (1..=5).map(|c| insert_run(&store, "build-1", c).1).collect();

        let page = store
            .query_history_page(&PipelineName::from("BUILD-1"), "Compile", 2, 1)
            .unwrap();
        let ids: Vec<i64> = page.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![stage_ids[3], stage_ids[2]]);
        assert_eq!(
            store
                .count_stage_instances(&PipelineName::from("build-1"), "compile")
                .unwrap(),
            5
        );
    }

    #[test]
    fn test_active_instances_follow_stage_state() {
        let store = InMemoryStore::new();
        let (first, first_stage) = insert_run(&store, "build-1", 1);
        let (second, _) = insert_run(&store, "build-1", 2);

        let tx = store.begin().unwrap();
        store
            .update_stage_state(&tx, first_stage, StageState::Completed, Some(ExecutionResult::Passed), Utc::now())
            .unwrap();
        store.commit(&tx).unwrap();

        let active = store.query_active_instance_ids().unwrap();
        assert_eq!(active, vec![(PipelineName::from("build-1"), second)]);
        assert_ne!(first, second);
        assert_eq!(
            store
                .query_most_recent_passed(&PipelineName::from("build-1"), "compile")
                .unwrap(),
            Some(first_stage)
        );
    }

    #[test]
    fn test_lock_round_trip() {
        let store = InMemoryStore::new();
        let name = PipelineName::from("build-1");
        let holder = PipelineIdentity {
            id: 101,
            name: name.clone(),
            counter: 7,
            label: "7".to_string(),
        };

        let tx = store.begin().unwrap();
        store
            .set_lock_state(&tx, &name, &PipelineLockState::LockedBy(holder.clone()))
            .unwrap();
        assert_eq!(store.get_lock_state(&name).unwrap(), PipelineLockState::Unlocked);
        store.commit(&tx).unwrap();

        assert_eq!(
            store.get_lock_state(&PipelineName::from("Build-1")).unwrap(),
            PipelineLockState::LockedBy(holder.clone())
        );
        assert_eq!(store.query_locked_pipelines().unwrap(), vec![holder]);
    }

    #[test]
    fn test_reads_in_transaction_see_its_own_writes() {
        let store = InMemoryStore::new();
        let name = PipelineName::from("build-1");
        let (_, stage_id) = insert_run(&store, "build-1", 1);
        let holder = PipelineIdentity {
            id: 101,
            name: name.clone(),
            counter: 1,
            label: "1".to_string(),
        };

        let tx = store.begin().unwrap();
        store
            .set_lock_state(&tx, &name, &PipelineLockState::LockedBy(holder.clone()))
            .unwrap();
        store
            .update_stage_state(&tx, stage_id, StageState::Completed, Some(ExecutionResult::Failed), Utc::now())
            .unwrap();
        store
            .insert_pipeline_instance(&tx, &pipeline("build-1", 2))
            .unwrap();

        assert_eq!(
            store.get_lock_state_in(&tx, &PipelineName::from("BUILD-1")).unwrap(),
            PipelineLockState::LockedBy(holder)
        );
        assert_eq!(store.get_lock_state(&name).unwrap(), PipelineLockState::Unlocked);
        assert_eq!(store.max_pipeline_counter_in(&tx, &name).unwrap(), 2);
        assert_eq!(store.max_pipeline_counter(&name).unwrap(), 1);

        let stage = store.load_stage_in(&tx, stage_id).unwrap().unwrap();
        assert_eq!(stage.state, StageState::Completed);
        assert_eq!(store.load_stage(stage_id).unwrap().unwrap().state, StageState::Scheduled);

        store.rollback(&tx);
        let other = store.begin().unwrap();
        assert_eq!(store.load_stage_in(&other, stage_id).unwrap().unwrap().state, StageState::Scheduled);
        store.rollback(&other);
    }

    #[test]
    fn test_job_reads_in_transaction_and_active_jobs() {
        let store = InMemoryStore::new();
        let (pipeline_id, stage_id) = insert_run(&store, "build-1", 1);
        let row = store.load_stage(stage_id).unwrap().unwrap();

        let tx = store.begin().unwrap();
        let job_id = store
            .insert_job_instance(
                &tx,
                &JobInstance {
                    id: 0,
                    stage_id,
                    pipeline_id,
                    identifier: JobIdentifier {
                        stage: row.identifier.clone(),
                        job_name: "unit".to_string(),
                    },
                    state: JobState::Scheduled,
                    result: None,
                    agent: None,
                    transitions: Vec::new(),
                },
            )
            .unwrap();
        assert!(store.load_job(job_id).unwrap().is_none());
        assert!(store.load_job_in(&tx, job_id).unwrap().is_some());
        assert_eq!(store.load_stage_in(&tx, stage_id).unwrap().unwrap().jobs.len(), 1);
        store.commit(&tx).unwrap();
        assert_eq!(store.query_active_job_ids().unwrap(), vec![job_id]);

        let tx = store.begin().unwrap();
        store
            .update_job_state(&tx, job_id, JobState::Completed, Some(ExecutionResult::Passed), Some("agent-1"), Utc::now())
            .unwrap();
        let job = store.load_job_in(&tx, job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.agent.as_deref(), Some("agent-1"));
        store.commit(&tx).unwrap();
        assert!(store.query_active_job_ids().unwrap().is_empty());
    }

    #[test]
    fn test_update_unknown_stage_is_not_found() {
        let store = InMemoryStore::new();
        let tx = store.begin().unwrap();
        let result = store.update_stage_state(&tx, 99, StageState::Building, None, Utc::now());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_injected_faults() {
        let store = InMemoryStore::new();
        store.set_fail_reads(true);
        assert!(store.load_pipeline(1).is_err());
        store.set_fail_reads(false);
        assert!(store.load_pipeline(1).is_ok());
        assert_eq!(store.calls("load_pipeline"), 2);

        store.fail_next_write();
        let tx = store.begin().unwrap();
        assert!(store.insert_pipeline_instance(&tx, &pipeline("build-1", 1)).is_err());
        assert!(store.insert_pipeline_instance(&tx, &pipeline("build-1", 1)).is_ok());
    }
}
