use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use disttask_application::{builtin_registry, ExampleTaskParams, Node, NodeHooks, EXAMPLE_TASK_TYPE};
use disttask_core::{
    models::{NewTask, Step, SubtaskState, Task, TaskState},
    traits::TaskStore,
    AppConfig,
};
use disttask_dispatcher::{SchedulerHooks, TaskControlService};
use disttask_testing_utils::{fast_test_config, init_test_logging, TestEnv};

fn node_config(exec_id: &str) -> AppConfig {
    let mut config = fast_test_config();
    config.node.exec_id = exec_id.to_string();
    config
}

fn example_task(key: &str, step_one: usize, step_two: usize, sleep_ms: u64) -> NewTask {
    NewTask::new(key, EXAMPLE_TASK_TYPE, 2).with_meta(
        ExampleTaskParams {
            step_one,
            step_two,
            subtask_sleep_ms: sleep_ms,
        }
        .to_meta(),
    )
}

async fn task_state(store: &Arc<dyn TaskStore>, key: &str) -> TaskState {
    store.get_task_by_key(key).await.unwrap().state
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_runs_example_task() {
    init_test_logging();
    let store = TestEnv::memory_store();
    let created = Arc::new(AtomicUsize::new(0));
    let hooks = NodeHooks {
        scheduler: SchedulerHooks {
            on_step_subtasks_created: Some(Arc::new({
                let created = Arc::clone(&created);
                move |_task: &Task, _step: Step, count: usize| {
                    created.fetch_add(count, Ordering::SeqCst);
                }
            })),
        },
        ..NodeHooks::default()
    };
    let node = Node::new(
        node_config("node-1"),
        Arc::clone(&store),
        Arc::new(builtin_registry()),
        hooks,
    );
    node.start().await.unwrap();
    assert!(node.is_running().await);

    let service = node.task_service();
    service.submit_task(example_task("single", 4, 2, 10)).await.unwrap();

    let done = TestEnv::wait_for(
        || async { task_state(&store, "single").await == TaskState::Succeeded },
        Duration::from_secs(10),
    )
    .await;
    assert!(done);

    let status = service.get_task_status("single").await.unwrap();
    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(created.load(Ordering::SeqCst), 6);

    let task = store.get_task_by_key("single").await.unwrap();
    let subtasks = store.get_subtasks_by_task(task.id).await.unwrap();
    assert_eq!(subtasks.len(), 6);
    assert!(subtasks.iter().all(|s| s.state == SubtaskState::Succeeded));

    node.stop().await.unwrap();
    assert!(!node.is_running().await);
    assert!(store.list_nodes().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_stop_releases_work() {
    init_test_logging();
    let store = TestEnv::memory_store();
    let node = Node::new(
        node_config("node-1"),
        Arc::clone(&store),
        Arc::new(builtin_registry()),
        NodeHooks::default(),
    );
    node.start().await.unwrap();
    node.task_service()
        .submit_task(example_task("slow", 4, 1, 5_000))
        .await
        .unwrap();

    let running = TestEnv::wait_for(
        || async {
            let task = store.get_task_by_key("slow").await.unwrap();
            let subtasks = store.get_subtasks_by_task(task.id).await.unwrap();
            subtasks.iter().filter(|s| s.state == SubtaskState::Running).count() == 2
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(running);

    node.stop().await.unwrap();

    let task = store.get_task_by_key("slow").await.unwrap();
    assert_eq!(task.state, TaskState::Running);
    assert!(task.owner.is_none());
    let subtasks = store.get_subtasks_by_task(task.id).await.unwrap();
    assert!(subtasks
        .iter()
        .all(|s| s.state == SubtaskState::Pending && s.retry_count == 0));
    assert!(store.list_nodes().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_killed_node_is_recovered_by_survivor() {
    init_test_logging();
    let store = TestEnv::memory_store();
    let registry = Arc::new(builtin_registry());
    let victim = Node::new(
        node_config("victim"),
        Arc::clone(&store),
        Arc::clone(&registry),
        NodeHooks::default(),
    );
    victim.start().await.unwrap();
    victim
        .task_service()
        .submit_task(example_task("recover", 2, 1, 300))
        .await
        .unwrap();

    let claimed = TestEnv::wait_for(
        || async {
            let task = store.get_task_by_key("recover").await.unwrap();
            task.owner.as_deref() == Some("victim")
                && store
                    .get_subtasks_by_task(task.id)
                    .await
                    .unwrap()
                    .iter()
                    .any(|s| s.state == SubtaskState::Running)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(claimed);

    victim.kill().await;
    assert!(!victim.liveness().is_live());
    assert_eq!(store.list_nodes().await.unwrap().len(), 1);

    let survivor = Node::new(
        node_config("survivor"),
        Arc::clone(&store),
        registry,
        NodeHooks::default(),
    );
    survivor.start().await.unwrap();

    let done = TestEnv::wait_for(
        || async { task_state(&store, "recover").await == TaskState::Succeeded },
        Duration::from_secs(15),
    )
    .await;
    assert!(done);

    let nodes = store.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].exec_id, "survivor");

    let task = store.get_task_by_key("recover").await.unwrap();
    let subtasks = store.get_subtasks_by_task(task.id).await.unwrap();
    assert_eq!(subtasks.len(), 3);
    assert!(subtasks.iter().all(|s| s.state == SubtaskState::Succeeded));
    assert!(subtasks.iter().any(|s| s.retry_count == 1));

    survivor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_executor_only_node_never_becomes_owner() {
    init_test_logging();
    let store = TestEnv::memory_store();
    let registry = Arc::new(builtin_registry());
    let mut config = node_config("executor-only");
    config.node.can_be_owner = false;
    let executor = Node::new(config, Arc::clone(&store), Arc::clone(&registry), NodeHooks::default());
    executor.start().await.unwrap();
    executor
        .task_service()
        .submit_task(example_task("exec-only", 2, 1, 10))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let task = store.get_task_by_key("exec-only").await.unwrap();
    assert_eq!(task.owner, None);
    assert_eq!(task.state, TaskState::Pending);
    assert!(executor.scheduled_task_ids().await.is_empty());

    let owner = Node::new(
        node_config("owner"),
        Arc::clone(&store),
        registry,
        NodeHooks::default(),
    );
    owner.start().await.unwrap();

    let done = TestEnv::wait_for(
        || async { task_state(&store, "exec-only").await == TaskState::Succeeded },
        Duration::from_secs(10),
    )
    .await;
    assert!(done);
    let task = store.get_task_by_key("exec-only").await.unwrap();
    assert_eq!(task.owner.as_deref(), Some("owner"));
    assert!(executor.scheduled_task_ids().await.is_empty());

    owner.stop().await.unwrap();
    executor.stop().await.unwrap();
}

#[tokio::test]
async fn test_from_config_uses_memory_store() {
    init_test_logging();
    let node = Node::from_config(
        node_config("configured"),
        Arc::new(builtin_registry()),
        NodeHooks::default(),
    )
    .await
    .unwrap();
    assert_eq!(node.exec_id(), "configured");
    assert!(!node.liveness().is_live());
    assert!(node.store().list_tasks().await.unwrap().is_empty());
}
