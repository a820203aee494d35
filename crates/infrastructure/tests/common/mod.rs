//! 两种存储实现共用的契约测试

use std::time::Duration;

use chrono::Utc;
use disttask_core::{
    models::{
        NewTask, Step, SubtaskOutcome, SubtaskSpec, SubtaskState, TaskState, TaskTransition,
    },
    traits::TaskStore,
    SchedulerError,
};
use serde_json::json;

fn specs(n: usize) -> Vec<SubtaskSpec> {
    (0..n).map(|i| SubtaskSpec::new(json!({ "index": i }))).collect()
}

/// 创建任务并以 node-1 身份认领、推进到 StepOne，返回 (task_id, epoch)
async fn running_task_at_step_one(store: &dyn TaskStore, key: &str) -> (i64, i64) {
    let id = store.create_task(&NewTask::new(key, "example", 4)).await.unwrap();
    let task = store
        .claim_task_owner(id, None, 0, "node-1")
        .await
        .unwrap()
        .expect("first claim wins");
    let epoch = task.owner_epoch;
    assert!(store
        .update_task_state(
            id,
            &TaskTransition::new(TaskState::Pending, TaskState::Running)
                .with_step(Step::ONE)
                .with_epoch(epoch)
        )
        .await
        .unwrap());
    (id, epoch)
}

pub async fn duplicate_key_is_rejected(store: &dyn TaskStore) {
    let id = store
        .create_task(&NewTask::new("😊", "example", 1))
        .await
        .unwrap();
    let err = store
        .create_task(&NewTask::new("😊", "example", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::TaskAlreadyExists { .. }));

    let tasks = store.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = store.get_task_by_key("😊").await.unwrap();
    assert_eq!(task.id, id);
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.step, Step::INIT);

    assert!(matches!(
        store.get_task_by_key("missing").await,
        Err(SchedulerError::TaskNotFound { .. })
    ));
}

pub async fn owner_claim_is_exclusive(store: &dyn TaskStore) {
    let id = store.create_task(&NewTask::new("owner", "example", 1)).await.unwrap();

    let first = store.claim_task_owner(id, None, 0, "node-1").await.unwrap();
    let second = store.claim_task_owner(id, None, 0, "node-2").await.unwrap();
    assert!(first.is_some());
    assert!(second.is_none());

    let task = store.get_task_by_id(id).await.unwrap();
    assert_eq!(task.owner.as_deref(), Some("node-1"));
    assert_eq!(task.owner_epoch, 1);

    // 接管失效 owner 需要带上读到的 owner 与 epoch
    let takeover = store
        .claim_task_owner(id, Some("node-1"), 1, "node-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(takeover.owner_epoch, 2);

    // 旧 owner 的写入被 epoch 挡住
    let stale = store
        .update_task_state(
            id,
            &TaskTransition::new(TaskState::Pending, TaskState::Running).with_epoch(1),
        )
        .await
        .unwrap();
    assert!(!stale);

    assert!(store.release_task_owner(id, "node-2", 2).await.unwrap());
    let released = store.get_task_by_id(id).await.unwrap();
    assert!(released.owner.is_none());
    assert_eq!(released.owner_epoch, 3);
}

pub async fn state_transitions_follow_lattice(store: &dyn TaskStore) {
    let id = store.create_task(&NewTask::new("lattice", "example", 1)).await.unwrap();

    let err = store
        .update_task_state(id, &TaskTransition::new(TaskState::Pending, TaskState::Succeeded))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidStateTransition { .. }));

    // 期望状态不符视为竞争失败
    assert!(!store
        .update_task_state(id, &TaskTransition::new(TaskState::Running, TaskState::Succeeded))
        .await
        .unwrap());

    assert!(store
        .update_task_state(id, &TaskTransition::new(TaskState::Pending, TaskState::Cancelling))
        .await
        .unwrap());
    assert!(store
        .update_task_state(
            id,
            &TaskTransition::new(TaskState::Cancelling, TaskState::Cancelled).with_error("cancelled")
        )
        .await
        .unwrap());

    let task = store.get_task_by_id(id).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(task.end_time.is_some());
    assert_eq!(task.error.as_deref(), Some("cancelled"));
    assert!(store.list_active_tasks().await.unwrap().is_empty());

    assert!(matches!(
        store.get_task_by_id(9999).await,
        Err(SchedulerError::TaskIdNotFound { id: 9999 })
    ));
}

pub async fn subtask_creation_is_step_idempotent(store: &dyn TaskStore) {
    let (id, epoch) = running_task_at_step_one(store, "idempotent").await;

    assert!(store.create_subtasks(id, Step::ONE, epoch, &specs(10)).await.unwrap());
    assert!(!store.create_subtasks(id, Step::ONE, epoch, &specs(10)).await.unwrap());
    // epoch 过期或步骤不匹配都不会写入
    assert!(!store.create_subtasks(id, Step::ONE, epoch - 1, &specs(3)).await.unwrap());
    assert!(!store.create_subtasks(id, Step::TWO, epoch, &specs(3)).await.unwrap());

    let subtasks = store.get_subtasks_by_step(id, Step::ONE).await.unwrap();
    assert_eq!(subtasks.len(), 10);
    let mut ordinals: Vec<i32> = subtasks.iter().map(|s| s.ordinal).collect();
    ordinals.sort();
    assert_eq!(ordinals, (0..10).collect::<Vec<_>>());
    assert!(subtasks
        .iter()
        .all(|s| s.state == SubtaskState::Pending && s.exec_id.is_none()));
}

pub async fn claim_and_finish_are_fenced(store: &dyn TaskStore) {
    let (id, epoch) = running_task_at_step_one(store, "fenced").await;
    store.create_subtasks(id, Step::ONE, epoch, &specs(1)).await.unwrap();
    let subtask_id = store.get_subtasks_by_step(id, Step::ONE).await.unwrap()[0].id;

    let claimed = store.claim_subtask(subtask_id, "node-a").await.unwrap().unwrap();
    assert_eq!(claimed.state, SubtaskState::Running);
    assert_eq!(claimed.exec_id.as_deref(), Some("node-a"));
    assert!(store.claim_subtask(subtask_id, "node-b").await.unwrap().is_none());
    assert_eq!(store.get_subtasks_for_exec("node-a").await.unwrap().len(), 1);

    // node-a 失效，子任务被重新分配并由 node-b 认领
    let reassigned = store
        .reassign_subtask(subtask_id, "node-a", claimed.claim_token, 3)
        .await
        .unwrap();
    assert_eq!(reassigned, Some(SubtaskState::Pending));
    let reclaimed = store.claim_subtask(subtask_id, "node-b").await.unwrap().unwrap();
    assert_eq!(reclaimed.retry_count, 1);
    assert!(reclaimed.claim_token > claimed.claim_token);

    // 僵尸写入被拒绝
    let zombie = store
        .finish_subtask(
            subtask_id,
            "node-a",
            claimed.claim_token,
            &SubtaskOutcome::Succeeded { summary: None, row_count: 1 },
        )
        .await
        .unwrap();
    assert!(!zombie);
    assert!(!store
        .update_subtask_progress(subtask_id, "node-a", claimed.claim_token, 5)
        .await
        .unwrap());

    assert!(store
        .update_subtask_progress(subtask_id, "node-b", reclaimed.claim_token, 7)
        .await
        .unwrap());
    assert!(store
        .finish_subtask(
            subtask_id,
            "node-b",
            reclaimed.claim_token,
            &SubtaskOutcome::Succeeded {
                summary: Some(json!({ "ok": true })),
                row_count: 10,
            },
        )
        .await
        .unwrap());

    let done = store.get_subtasks_by_task(id).await.unwrap();
    assert_eq!(done[0].state, SubtaskState::Succeeded);
    assert_eq!(done[0].row_count, 10);
    assert_eq!(done[0].summary, Some(json!({ "ok": true })));
    assert!(store.get_running_subtasks().await.unwrap().is_empty());
}

pub async fn reassignment_exhausts_retries(store: &dyn TaskStore) {
    let (id, epoch) = running_task_at_step_one(store, "exhaust").await;
    store.create_subtasks(id, Step::ONE, epoch, &specs(1)).await.unwrap();
    let subtask_id = store.get_subtasks_by_step(id, Step::ONE).await.unwrap()[0].id;

    for round in 0..2 {
        let claimed = store.claim_subtask(subtask_id, "node-a").await.unwrap().unwrap();
        let state = store
            .reassign_subtask(subtask_id, "node-a", claimed.claim_token, 1)
            .await
            .unwrap();
        let expected = if round == 0 {
            SubtaskState::Pending
        } else {
            SubtaskState::Failed
        };
        assert_eq!(state, Some(expected));
    }

    let subtask = &store.get_subtasks_by_step(id, Step::ONE).await.unwrap()[0];
    assert_eq!(subtask.state, SubtaskState::Failed);
    assert_eq!(subtask.retry_count, 1);
    assert!(subtask.error.is_some());
}

pub async fn release_and_retry_transitions(store: &dyn TaskStore) {
    let (id, epoch) = running_task_at_step_one(store, "release").await;
    store.create_subtasks(id, Step::ONE, epoch, &specs(2)).await.unwrap();
    let subtasks = store.get_subtasks_by_step(id, Step::ONE).await.unwrap();

    let claimed = store.claim_subtask(subtasks[0].id, "node-a").await.unwrap().unwrap();
    assert!(store
        .release_subtask(subtasks[0].id, "node-a", claimed.claim_token)
        .await
        .unwrap());
    let released = &store.get_subtasks_by_step(id, Step::ONE).await.unwrap()[0];
    assert_eq!(released.state, SubtaskState::Pending);
    assert_eq!(released.retry_count, 0);
    assert!(released.exec_id.is_none());

    let claimed = store.claim_subtask(subtasks[0].id, "node-a").await.unwrap().unwrap();
    assert!(store
        .finish_subtask(
            subtasks[0].id,
            "node-a",
            claimed.claim_token,
            &SubtaskOutcome::Failed { error: "boom".to_string() },
        )
        .await
        .unwrap());
    assert!(store
        .update_subtask_state(subtasks[0].id, SubtaskState::Failed, SubtaskState::Pending)
        .await
        .unwrap());
    let retried = &store.get_subtasks_by_step(id, Step::ONE).await.unwrap()[0];
    assert_eq!(retried.state, SubtaskState::Pending);
    assert_eq!(retried.retry_count, 1);

    assert!(store
        .update_subtask_state(subtasks[1].id, SubtaskState::Pending, SubtaskState::Cancelled)
        .await
        .unwrap());
    assert!(matches!(
        store
            .update_subtask_state(subtasks[1].id, SubtaskState::Running, SubtaskState::Succeeded)
            .await,
        Err(SchedulerError::InvalidStateTransition { .. })
    ));
}

pub async fn node_heartbeats_are_monotonic_and_fenced(store: &dyn TaskStore) {
    let t0 = Utc::now();
    let node = store.register_node("node-a", true, t0).await.unwrap();

    let later = t0 + chrono::Duration::seconds(5);
    assert!(store.heartbeat("node-a", node.epoch, later).await.unwrap());
    // 时间回退的心跳不会让记录变旧
    assert!(store.heartbeat("node-a", node.epoch, t0).await.unwrap());
    let nodes = store.list_nodes().await.unwrap();
    assert_eq!(
        nodes[0].last_heartbeat.timestamp_millis(),
        later.timestamp_millis()
    );

    // 观测值过期时移除失败
    assert!(!store
        .remove_dead_node("node-a", node.epoch, t0)
        .await
        .unwrap());
    assert!(store
        .remove_dead_node("node-a", node.epoch, nodes[0].last_heartbeat)
        .await
        .unwrap());
    assert!(!store.heartbeat("node-a", node.epoch, later).await.unwrap());

    let again = store.register_node("node-a", true, later).await.unwrap();
    assert!(again.epoch > node.epoch);
    assert!(!store.heartbeat("node-a", node.epoch, later).await.unwrap());

    let live = store
        .list_live_exec_ids(Duration::from_secs(1), later + chrono::Duration::milliseconds(500))
        .await
        .unwrap();
    assert_eq!(live, vec!["node-a".to_string()]);
    let live = store
        .list_live_exec_ids(Duration::from_secs(1), later + chrono::Duration::seconds(3))
        .await
        .unwrap();
    assert!(live.is_empty());

    assert!(!store.deregister_node("node-a", node.epoch).await.unwrap());
    assert!(store.deregister_node("node-a", again.epoch).await.unwrap());
    assert!(store.list_nodes().await.unwrap().is_empty());
}
