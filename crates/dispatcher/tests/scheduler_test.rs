use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use serde_json::json;

use disttask_core::{
    config::SchedulerConfig,
    models::{
        NewTask, Step, Subtask, SubtaskOutcome, SubtaskSpec, SubtaskState, Task, TaskState,
    },
    traits::{SchedulerExtension, TaskStore},
    SchedulerError, SchedulerResult, TaskTypeRegistry,
};
use disttask_dispatcher::{
    SchedulerExit, SchedulerHooks, TaskControlService, TaskScheduler, TaskService,
};
use disttask_testing_utils::{
    fast_test_config, ha_test_registry, HaTestExtension, RecordingStepExecutor, TestEnv,
    HA_TEST_TASK_TYPE,
};

mock! {
    pub Extension {}

    #[async_trait]
    impl SchedulerExtension for Extension {
        async fn generate_subtasks(&self, task: &Task, step: Step) -> SchedulerResult<Vec<SubtaskSpec>>;
        fn get_next_step(&self, task: &Task) -> Step;
        async fn on_subtask_terminal(&self, task: &Task, subtask: &Subtask) -> SchedulerResult<()>;
        fn supports_revert(&self) -> bool;
        async fn compensate(&self, task: &Task, step: Step) -> SchedulerResult<()>;
        fn is_retryable_error(&self, err: &SchedulerError) -> bool;
    }
}

/// 子任务进入终态时把任务 owner 转给 `node-2`，模拟调度器在一轮处理中途被接管
#[derive(Default)]
struct TakeoverOnTerminal {
    store: OnceLock<Arc<dyn TaskStore>>,
}

#[async_trait]
impl SchedulerExtension for TakeoverOnTerminal {
    async fn generate_subtasks(&self, _task: &Task, _step: Step) -> SchedulerResult<Vec<SubtaskSpec>> {
        Ok((0..2).map(|i| SubtaskSpec::new(json!({ "index": i }))).collect())
    }

    fn get_next_step(&self, task: &Task) -> Step {
        if task.step.is_init() {
            Step::ONE
        } else {
            Step::DONE
        }
    }

    async fn on_subtask_terminal(&self, task: &Task, _subtask: &Subtask) -> SchedulerResult<()> {
        if let Some(store) = self.store.get() {
            store
                .claim_task_owner(task.id, task.owner.as_deref(), task.owner_epoch, "node-2")
                .await?;
        }
        Ok(())
    }

    fn supports_revert(&self) -> bool {
        false
    }

    async fn compensate(&self, _task: &Task, _step: Step) -> SchedulerResult<()> {
        Ok(())
    }

    fn is_retryable_error(&self, _err: &SchedulerError) -> bool {
        false
    }
}

struct Fixture {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    task_id: i64,
    scheduler: TaskScheduler,
}

fn scheduler_config(max_subtask_retries: i32) -> SchedulerConfig {
    let mut config = fast_test_config().scheduler;
    config.max_subtask_retries = max_subtask_retries;
    config
}

async fn setup_with_registry(
    registry: TaskTypeRegistry,
    task_type: &str,
    config: SchedulerConfig,
    hooks: SchedulerHooks,
) -> Fixture {
    let store = TestEnv::memory_store();
    let registry = Arc::new(registry);
    let task_id = store
        .create_task(&NewTask::new("task-under-test", task_type, 2))
        .await
        .unwrap();
    let owned = store
        .claim_task_owner(task_id, None, 0, "node-1")
        .await
        .unwrap()
        .unwrap();
    let scheduler = TaskScheduler::new(
        &owned,
        Arc::clone(&store),
        Arc::clone(&registry),
        config,
        hooks,
    );
    Fixture {
        store,
        registry,
        task_id,
        scheduler,
    }
}

async fn setup(extension: Arc<HaTestExtension>, config: SchedulerConfig) -> Fixture {
    let registry = ha_test_registry(
        extension,
        Arc::new(RecordingStepExecutor::new(Duration::ZERO)),
    );
    setup_with_registry(registry, HA_TEST_TASK_TYPE, config, SchedulerHooks::default()).await
}

async fn task(fixture: &Fixture) -> Task {
    fixture.store.get_task_by_id(fixture.task_id).await.unwrap()
}

async fn tick(fixture: &mut Fixture) -> Option<SchedulerExit> {
    fixture.scheduler.tick().await.unwrap()
}

/// 以 `exec_id` 身份认领当前步骤所有 Pending 子任务并写入同一结果
async fn finish_step(fixture: &Fixture, step: Step, outcome: SubtaskOutcome) -> usize {
    let subtasks = fixture
        .store
        .get_subtasks_by_step(fixture.task_id, step)
        .await
        .unwrap();
    let mut finished = 0;
    for subtask in subtasks.iter().filter(|s| s.state == SubtaskState::Pending) {
        let claimed = fixture
            .store
            .claim_subtask(subtask.id, "worker-a")
            .await
            .unwrap()
            .unwrap();
        assert!(fixture
            .store
            .finish_subtask(claimed.id, "worker-a", claimed.claim_token, &outcome)
            .await
            .unwrap());
        finished += 1;
    }
    finished
}

fn succeeded() -> SubtaskOutcome {
    SubtaskOutcome::Succeeded {
        summary: None,
        row_count: 1,
    }
}

#[tokio::test]
async fn test_scheduler_drives_task_through_steps() {
    let extension = Arc::new(HaTestExtension::new(vec![3, 2]));
    let created = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&created);
    let hooks = SchedulerHooks {
        on_step_subtasks_created: Some(Arc::new(move |_task: &Task, _step: Step, count: usize| {
            hook_counter.fetch_add(count, Ordering::SeqCst);
        })),
    };
    let registry = ha_test_registry(
        Arc::clone(&extension),
        Arc::new(RecordingStepExecutor::new(Duration::ZERO)),
    );
    let mut fixture =
        setup_with_registry(registry, HA_TEST_TASK_TYPE, scheduler_config(3), hooks).await;

    assert_eq!(tick(&mut fixture).await, None);
    let current = task(&fixture).await;
    assert_eq!(current.state, TaskState::Running);
    assert_eq!(current.step, Step::INIT);

    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.step, Step::ONE);

    tick(&mut fixture).await;
    tick(&mut fixture).await;
    assert_eq!(
        fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap().len(),
        3
    );
    assert_eq!(created.load(Ordering::SeqCst), 3);

    assert_eq!(finish_step(&fixture, Step::ONE, succeeded()).await, 3);
    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.step, Step::TWO);

    tick(&mut fixture).await;
    assert_eq!(finish_step(&fixture, Step::TWO, succeeded()).await, 2);
    tick(&mut fixture).await;

    let finished = task(&fixture).await;
    assert_eq!(finished.state, TaskState::Succeeded);
    assert_eq!(finished.step, Step::DONE);
    assert!(finished.end_time.is_some());
    assert_eq!(tick(&mut fixture).await, Some(SchedulerExit::Finished));

    assert_eq!(
        extension.generate_calls(),
        vec![(fixture.task_id, Step::ONE), (fixture.task_id, Step::TWO)]
    );
    assert_eq!(extension.terminal_notifications().len(), 5);
    assert_eq!(created.load(Ordering::SeqCst), 5);
    assert!(fixture.registry.contains(HA_TEST_TASK_TYPE));
}

#[tokio::test]
async fn test_failed_subtask_is_retried_until_exhausted() {
    let extension = Arc::new(HaTestExtension::new(vec![2]));
    let mut fixture = setup(extension, scheduler_config(1)).await;
    for _ in 0..3 {
        tick(&mut fixture).await;
    }

    let subtasks = fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap();
    let victim = &subtasks[0];
    let failed = SubtaskOutcome::Failed {
        error: "boom".to_string(),
    };

    let claimed = fixture.store.claim_subtask(victim.id, "worker-a").await.unwrap().unwrap();
    fixture
        .store
        .finish_subtask(victim.id, "worker-a", claimed.claim_token, &failed)
        .await
        .unwrap();
    tick(&mut fixture).await;

    let retried = fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap();
    assert_eq!(retried[0].state, SubtaskState::Pending);
    assert_eq!(retried[0].retry_count, 1);
    assert_eq!(task(&fixture).await.state, TaskState::Running);

    let claimed = fixture.store.claim_subtask(victim.id, "worker-a").await.unwrap().unwrap();
    fixture
        .store
        .finish_subtask(victim.id, "worker-a", claimed.claim_token, &failed)
        .await
        .unwrap();
    tick(&mut fixture).await;

    let failed_task = task(&fixture).await;
    assert_eq!(failed_task.state, TaskState::Failed);
    assert!(failed_task.error.unwrap().contains("boom"));
    let remaining = fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap();
    assert_eq!(remaining[1].state, SubtaskState::Cancelled);
}

#[tokio::test]
async fn test_demoted_scheduler_leaves_subtasks_untouched_on_failure() {
    let extension = Arc::new(TakeoverOnTerminal::default());
    let mut registry = TaskTypeRegistry::new();
    registry.register("takeover", Arc::clone(&extension) as Arc<dyn SchedulerExtension>, Vec::new());
    let mut fixture =
        setup_with_registry(registry, "takeover", scheduler_config(0), SchedulerHooks::default())
            .await;
    assert!(extension.store.set(Arc::clone(&fixture.store)).is_ok());
    for _ in 0..3 {
        tick(&mut fixture).await;
    }

    let subtasks = fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap();
    assert_eq!(subtasks.len(), 2);
    let claimed = fixture.store.claim_subtask(subtasks[0].id, "worker-a").await.unwrap().unwrap();
    fixture
        .store
        .finish_subtask(
            claimed.id,
            "worker-a",
            claimed.claim_token,
            &SubtaskOutcome::Failed {
                error: "boom".to_string(),
            },
        )
        .await
        .unwrap();

    // 本轮处理中 owner 被接管，失败写入不生效
    tick(&mut fixture).await;
    let current = task(&fixture).await;
    assert_eq!(current.state, TaskState::Running);
    assert_eq!(current.owner.as_deref(), Some("node-2"));
    let after = fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap();
    assert_eq!(after[1].state, SubtaskState::Pending);

    assert_eq!(tick(&mut fixture).await, Some(SchedulerExit::Demoted));
}

#[tokio::test]
async fn test_revert_compensates_steps_in_reverse() {
    let extension = Arc::new(HaTestExtension::new(vec![1, 1]).with_revert());
    let mut fixture = setup(Arc::clone(&extension), scheduler_config(0)).await;
    for _ in 0..3 {
        tick(&mut fixture).await;
    }
    finish_step(&fixture, Step::ONE, succeeded()).await;
    tick(&mut fixture).await;
    tick(&mut fixture).await;
    finish_step(
        &fixture,
        Step::TWO,
        SubtaskOutcome::Failed {
            error: "step two broke".to_string(),
        },
    )
    .await;

    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Reverting);

    tick(&mut fixture).await;
    let reverting = task(&fixture).await;
    assert_eq!(reverting.state, TaskState::Reverting);
    assert_eq!(reverting.step, Step::ONE);

    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Reverted);
    assert_eq!(
        extension.compensations(),
        vec![(fixture.task_id, Step::TWO), (fixture.task_id, Step::ONE)]
    );
}

#[tokio::test]
async fn test_stale_scheduler_is_demoted_after_takeover() {
    let extension = Arc::new(HaTestExtension::new(vec![2]));
    let mut fixture = setup(Arc::clone(&extension), scheduler_config(3)).await;
    tick(&mut fixture).await;
    tick(&mut fixture).await;

    let current = task(&fixture).await;
    let takeover = fixture
        .store
        .claim_task_owner(current.id, current.owner.as_deref(), current.owner_epoch, "node-2")
        .await
        .unwrap();
    assert!(takeover.is_some());

    assert_eq!(tick(&mut fixture).await, Some(SchedulerExit::Demoted));
    assert!(fixture
        .store
        .get_subtasks_by_task(fixture.task_id)
        .await
        .unwrap()
        .is_empty());
    assert!(extension.generate_calls().is_empty());
}

#[tokio::test]
async fn test_cancel_waits_for_running_subtasks() {
    let extension = Arc::new(HaTestExtension::new(vec![2]));
    let mut fixture = setup(extension, scheduler_config(3)).await;
    for _ in 0..3 {
        tick(&mut fixture).await;
    }
    let subtasks = fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap();
    let running = fixture.store.claim_subtask(subtasks[0].id, "worker-a").await.unwrap().unwrap();

    let service = TaskService::new(Arc::clone(&fixture.store), Arc::clone(&fixture.registry));
    assert!(service.cancel_task("task-under-test").await.unwrap());

    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Cancelling);
    let after = fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap();
    assert_eq!(after[1].state, SubtaskState::Cancelled);

    fixture
        .store
        .finish_subtask(running.id, "worker-a", running.claim_token, &SubtaskOutcome::Cancelled)
        .await
        .unwrap();
    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Cancelled);
    assert!(!service.cancel_task("task-under-test").await.unwrap());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let extension = Arc::new(HaTestExtension::new(vec![1]));
    let mut fixture = setup(extension, scheduler_config(3)).await;
    for _ in 0..3 {
        tick(&mut fixture).await;
    }

    let service = TaskService::new(Arc::clone(&fixture.store), Arc::clone(&fixture.registry));
    assert!(service.pause_task("task-under-test").await.unwrap());
    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Paused);
    assert!(!service.pause_task("task-under-test").await.unwrap());

    assert!(service.resume_task("task-under-test").await.unwrap());
    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Running);

    finish_step(&fixture, Step::ONE, succeeded()).await;
    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Succeeded);
}

#[tokio::test]
async fn test_transient_generate_failure_is_retried() {
    let extension = Arc::new(HaTestExtension::new(vec![2]).with_transient_generate_failures(1));
    let mut fixture = setup(Arc::clone(&extension), scheduler_config(3)).await;
    tick(&mut fixture).await;
    tick(&mut fixture).await;

    tick(&mut fixture).await;
    assert!(fixture.store.get_subtasks_by_task(fixture.task_id).await.unwrap().is_empty());
    assert_eq!(task(&fixture).await.state, TaskState::Running);

    tick(&mut fixture).await;
    assert_eq!(
        fixture.store.get_subtasks_by_task(fixture.task_id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_permanent_generate_failure_fails_task() {
    let extension = Arc::new(HaTestExtension::new(vec![2]).with_failing_generate());
    let mut fixture = setup(extension, scheduler_config(3)).await;
    for _ in 0..3 {
        tick(&mut fixture).await;
    }

    let failed = task(&fixture).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert!(failed.error.is_some());
    assert_eq!(tick(&mut fixture).await, Some(SchedulerExit::Finished));
}

#[tokio::test]
async fn test_generation_happens_once_per_step() {
    let mut extension = MockExtension::new();
    extension
        .expect_get_next_step()
        .returning(|task| if task.step.is_init() { Step::ONE } else { Step::DONE });
    extension
        .expect_generate_subtasks()
        .times(1)
        .returning(|_, _| Ok(vec![SubtaskSpec::new(json!({ "payload": 1 }))]));
    extension
        .expect_on_subtask_terminal()
        .times(1)
        .returning(|_, _| Ok(()));
    extension.expect_supports_revert().return_const(false);

    let mut registry = TaskTypeRegistry::new();
    registry.register("mocked", Arc::new(extension), Vec::new());
    let mut fixture =
        setup_with_registry(registry, "mocked", scheduler_config(3), SchedulerHooks::default())
            .await;

    for _ in 0..6 {
        tick(&mut fixture).await;
    }
    assert_eq!(
        fixture.store.get_subtasks_by_step(fixture.task_id, Step::ONE).await.unwrap().len(),
        1
    );

    finish_step(&fixture, Step::ONE, succeeded()).await;
    tick(&mut fixture).await;
    assert_eq!(task(&fixture).await.state, TaskState::Succeeded);
    assert_eq!(tick(&mut fixture).await, Some(SchedulerExit::Finished));
}
