use baton_core::domain::job::JobState;
use baton_core::domain::lock::PipelineLockState;
use baton_core::domain::name::PipelineName;
use baton_core::domain::pipeline::PipelineInstance;
use baton_core::domain::stage::StageState;
use baton_core::domain::status::ExecutionResult;
use baton_core::dto::schedule::{NewPipeline, NewStage};
use baton_state::{Coordinator, InMemoryStore, LockError, StateConfig, StateError, StoreError};
use std::sync::{Arc, Barrier, Once};
use std::thread;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "baton_state=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

fn coordinator() -> (Arc<InMemoryStore>, Coordinator) {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), StateConfig::default());
    coordinator.initialize().unwrap();
    (store, coordinator)
}

fn build_request() -> NewPipeline {
    NewPipeline::new("build-1")
        .with_stage(NewStage::new("compile").with_job("unit"))
        .with_stage(NewStage::new("publish").with_job("upload"))
}

fn finish(coordinator: &Coordinator, pipeline: &PipelineInstance) {
    for stage in &pipeline.stages {
        coordinator
            .record_stage_transition(stage.id, StageState::Completed, Some(ExecutionResult::Passed))
            .unwrap();
    }
}

#[test]
fn lock_blocks_second_instance_until_unlocked() {
    let (_, coordinator) = coordinator();
    let name = PipelineName::from("build-1");

    let first = coordinator.schedule_pipeline(&build_request()).unwrap();
    let second = coordinator.schedule_pipeline(&build_request()).unwrap();

    coordinator.lock_pipeline(&first).unwrap();

    match coordinator.lock_pipeline(&second) {
        Err(LockError::AlreadyLocked(err)) => {
            assert_eq!(err.pipeline, name);
            assert_eq!(err.locked_by, first.identity());
            assert_eq!(
                err.to_string(),
                format!(
                    "Pipeline 'build-1' is already locked by instance {} (counter = 1, label = 1)",
                    first.id
                )
            );
        }
        other => panic!("expected lock conflict, got {other:?}"),
    }

    coordinator.unlock_pipeline(&name).unwrap();
    coordinator.lock_pipeline(&second).unwrap();

    let holder = coordinator.current_lock(&name).unwrap();
    assert_eq!(holder, PipelineLockState::LockedBy(second.identity()));
    assert_eq!(coordinator.locked_pipelines().unwrap(), vec![second.identity()]);
}

#[test]
fn concurrent_lock_attempts_have_exactly_one_winner() {
    let (_, coordinator) = coordinator();
    let instances: Vec<PipelineInstance> = (0..6)
        .map(|_| coordinator.schedule_pipeline(&build_request()).unwrap())
        .collect();

    let coordinator = Arc::new(coordinator);
    let barrier = Arc::new(Barrier::new(instances.len()));
    let handles: Vec<_> = instances
        .into_iter()
        .map(|instance| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator.lock_pipeline(&instance).map(|()| instance.id)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<i64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(winners.len(), 1);

    for result in results {
        if let Err(LockError::AlreadyLocked(err)) = result {
            assert_eq!(err.locked_by.id, winners[0]);
        }
    }
}

#[test]
fn finished_latest_instance_is_superseded_by_newer_one() {
    let (_, coordinator) = coordinator();
    let name = PipelineName::from("build-1");

    let first = coordinator.schedule_pipeline(&build_request()).unwrap();
    finish(&coordinator, &first);
    assert_eq!(coordinator.active_pipelines().ids_for(&name), vec![first.id]);

    let second = coordinator.schedule_pipeline(&build_request()).unwrap();
    assert_eq!(coordinator.active_pipelines().ids_for(&name), vec![second.id]);
}

#[test]
fn older_running_instance_leaves_index_when_done() {
    let (_, coordinator) = coordinator();
    let name = PipelineName::from("build-1");

    let first = coordinator.schedule_pipeline(&build_request()).unwrap();
    coordinator
        .record_stage_transition(first.stages[0].id, StageState::Building, None)
        .unwrap();
    let second = coordinator.schedule_pipeline(&build_request()).unwrap();
    assert_eq!(coordinator.active_pipelines().ids_for(&name), vec![second.id, first.id]);

    finish(&coordinator, &first);
    assert_eq!(coordinator.active_pipelines().ids_for(&name), vec![second.id]);
}

#[test]
fn rolled_back_write_keeps_cached_reads() {
    let (store, coordinator) = coordinator();
    let name = PipelineName::from("build-1");
    let pipeline = coordinator.schedule_pipeline(&build_request()).unwrap();

    assert_eq!(coordinator.current_lock(&name).unwrap(), PipelineLockState::Unlocked);
    let before = coordinator.history_page(&name, "compile", 10, 0).unwrap();

    store.fail_next_commit();
    assert!(matches!(
        coordinator.lock_pipeline(&pipeline),
        Err(LockError::Store(StoreError::Backend(_)))
    ));
    assert_eq!(coordinator.locks().cached_lock(&name), Some(PipelineLockState::Unlocked));

    store.fail_next_write();
    assert!(matches!(
        coordinator.record_stage_transition(pipeline.stages[0].id, StageState::Building, None),
        Err(StateError::Store(StoreError::Backend(_)))
    ));

    let queries = store.calls("query_history_page");
    let after = coordinator.history_page(&name, "compile", 10, 0).unwrap();
    assert_eq!(after, before);
    assert_eq!(store.calls("query_history_page"), queries);
}

#[test]
fn late_job_result_does_not_overwrite_terminal_state() {
    let (_, coordinator) = coordinator();
    let pipeline = coordinator.schedule_pipeline(&build_request()).unwrap();
    let job_id = pipeline.stages[0].jobs[0].id;

    coordinator
        .record_job_transition(job_id, JobState::Assigned, None, Some("agent-1"))
        .unwrap();
    coordinator
        .record_job_transition(job_id, JobState::Completed, Some(ExecutionResult::Passed), None)
        .unwrap();
    let late = coordinator
        .record_job_transition(job_id, JobState::Completed, Some(ExecutionResult::Failed), None)
        .unwrap();

    assert!(!late.is_applied());
    let job = coordinator.executions().load_with_transitions(job_id).unwrap();
    assert_eq!(job.result, Some(ExecutionResult::Passed));
}

#[test]
fn history_pages_follow_new_runs() {
    let (_, coordinator) = coordinator();
    let name = PipelineName::from("build-1");

    for _ in 0..3 {
        let pipeline = coordinator.schedule_pipeline(&build_request()).unwrap();
        finish(&coordinator, &pipeline);
    }

    let page = coordinator.history_page(&name, "compile", 2, 0).unwrap();
    assert_eq!(page.pagination.total, 3);
    assert_eq!(page.stages.len(), 2);
    assert!(page.pagination.has_next());
    let counters: Vec<i32> = page.stages.iter().map(|s| s.identifier.pipeline_counter).collect();
    assert_eq!(counters, vec![3, 2]);

    coordinator.schedule_pipeline(&build_request()).unwrap();
    let page = coordinator.history_page(&name, "compile", 2, 0).unwrap();
    assert_eq!(page.pagination.total, 4);
    assert_eq!(page.stages[0].identifier.pipeline_counter, 4);

    let pipelines = coordinator.pipeline_history(&name, 10, 0).unwrap();
    assert_eq!(pipelines.pipelines.len(), 4);
}

#[test]
fn pause_state_round_trips() {
    let (_, coordinator) = coordinator();
    let name = PipelineName::from("build-1");

    assert!(!coordinator.pause_state(&name).unwrap().paused);
    coordinator.pause(&name, "upgrading agents", "admin").unwrap();
    assert!(coordinator.pause_state(&name).unwrap().paused);
    coordinator.unpause(&name).unwrap();
    assert!(!coordinator.pause_state(&name).unwrap().paused);
}

#[test]
fn restart_rebuilds_state_from_storage() {
    let (store, coordinator) = coordinator();
    let running = coordinator.schedule_pipeline(&build_request()).unwrap();
    coordinator.lock_pipeline(&running).unwrap();
    drop(coordinator);

    let restarted = Coordinator::new(store, StateConfig::default());
    assert!(restarted.active_pipelines().is_empty());
    restarted.initialize().unwrap();

    let name = PipelineName::from("build-1");
    assert_eq!(restarted.active_pipelines().ids_for(&name), vec![running.id]);
    assert_eq!(
        restarted.current_lock(&name).unwrap(),
        PipelineLockState::LockedBy(running.identity())
    );

    restarted.clear_caches();
    assert!(restarted.locks().cached_lock(&name).is_none());
}
