use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use disttask_core::{
    models::{
        NewTask, NodeInfo, Step, Subtask, SubtaskOutcome, SubtaskSpec, SubtaskState, Task,
        TaskState, TaskTransition,
    },
    traits::TaskStore,
    SchedulerError, SchedulerResult,
};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct StoreState {
    next_task_id: i64,
    next_subtask_id: i64,
    tasks: BTreeMap<i64, Task>,
    task_keys: HashMap<String, i64>,
    subtasks: BTreeMap<i64, Subtask>,
    nodes: HashMap<String, NodeInfo>,
    last_node_epoch: i64,
}

/// 内存任务存储
///
/// 所有操作在同一把锁内完成，因此每个条件更新天然是原子的。
/// 支持注入瞬时故障，用于验证调用方的退避重试。
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 `count` 次操作返回 `StoreUnavailable`
    pub fn inject_transient_failures(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// 模拟存储整体不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> SchedulerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::StoreUnavailable("存储不可用".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(SchedulerError::StoreUnavailable("注入的瞬时故障".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: &NewTask) -> SchedulerResult<i64> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.task_keys.contains_key(&task.key) {
            return Err(SchedulerError::TaskAlreadyExists {
                key: task.key.clone(),
            });
        }

        state.next_task_id += 1;
        let id = state.next_task_id;
        let now = Utc::now();
        state.tasks.insert(
            id,
            Task {
                id,
                key: task.key.clone(),
                task_type: task.task_type.clone(),
                state: TaskState::Pending,
                step: Step::INIT,
                concurrency: task.concurrency,
                owner: None,
                owner_epoch: 0,
                meta: task.meta.clone(),
                error: None,
                created_at: now,
                start_time: None,
                end_time: None,
                state_update_time: now,
            },
        );
        state.task_keys.insert(task.key.clone(), id);
        Ok(id)
    }

    async fn get_task_by_id(&self, id: i64) -> SchedulerResult<Task> {
        self.check_available()?;
        let state = self.state.lock().await;
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::TaskIdNotFound { id })
    }

    async fn get_task_by_key(&self, key: &str) -> SchedulerResult<Task> {
        self.check_available()?;
        let state = self.state.lock().await;
        state
            .task_keys
            .get(key)
            .and_then(|id| state.tasks.get(id))
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound {
                key: key.to_string(),
            })
    }

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.tasks.values().cloned().collect())
    }

    async fn list_active_tasks(&self) -> SchedulerResult<Vec<Task>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect())
    }

    async fn claim_task_owner(
        &self,
        task_id: i64,
        expected_owner: Option<&str>,
        expected_epoch: i64,
        new_owner: &str,
    ) -> SchedulerResult<Option<Task>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskIdNotFound { id: task_id })?;

        if task.is_terminal()
            || task.owner.as_deref() != expected_owner
            || task.owner_epoch != expected_epoch
        {
            return Ok(None);
        }

        task.owner = Some(new_owner.to_string());
        task.owner_epoch += 1;
        Ok(Some(task.clone()))
    }

    async fn release_task_owner(
        &self,
        task_id: i64,
        owner: &str,
        epoch: i64,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) if task.is_owned_by(owner, epoch) => {
                task.owner = None;
                task.owner_epoch += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_task_state(
        &self,
        task_id: i64,
        transition: &TaskTransition,
    ) -> SchedulerResult<bool> {
        if !transition.is_valid() {
            return Err(SchedulerError::InvalidStateTransition {
                from: transition.expected_state.to_string(),
                to: transition.new_state.to_string(),
            });
        }
        self.check_available()?;

        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskIdNotFound { id: task_id })?;

        if task.state != transition.expected_state {
            return Ok(false);
        }
        if let Some(epoch) = transition.expected_epoch {
            if task.owner_epoch != epoch {
                return Ok(false);
            }
        }

        let now = Utc::now();
        task.state = transition.new_state;
        if let Some(step) = transition.step {
            task.step = step;
        }
        if let Some(error) = &transition.error {
            task.error = Some(error.clone());
        }
        if transition.new_state == TaskState::Running && task.start_time.is_none() {
            task.start_time = Some(now);
        }
        if transition.new_state.is_terminal() {
            task.end_time = Some(now);
        }
        task.state_update_time = now;
        Ok(true)
    }

    async fn create_subtasks(
        &self,
        task_id: i64,
        step: Step,
        expected_epoch: i64,
        specs: &[SubtaskSpec],
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or(SchedulerError::TaskIdNotFound { id: task_id })?;

        if task.owner_epoch != expected_epoch || task.step != step || task.state != TaskState::Running
        {
            return Ok(false);
        }
        if state
            .subtasks
            .values()
            .any(|s| s.task_id == task_id && s.step == step)
        {
            debug!("任务 {} 步骤 {} 已有子任务，跳过创建", task_id, step);
            return Ok(false);
        }

        let now = Utc::now();
        for (ordinal, spec) in specs.iter().enumerate() {
            state.next_subtask_id += 1;
            let id = state.next_subtask_id;
            state.subtasks.insert(
                id,
                Subtask {
                    id,
                    task_id,
                    step,
                    ordinal: ordinal as i32,
                    exec_id: None,
                    state: SubtaskState::Pending,
                    claim_token: 0,
                    retry_count: 0,
                    meta: spec.meta.clone(),
                    summary: None,
                    row_count: 0,
                    error: None,
                    create_time: now,
                    start_time: None,
                    update_time: now,
                },
            );
        }
        Ok(true)
    }

    async fn get_subtasks_by_step(
        &self,
        task_id: i64,
        step: Step,
    ) -> SchedulerResult<Vec<Subtask>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.step == step)
            .cloned()
            .collect())
    }

    async fn get_subtasks_by_task(&self, task_id: i64) -> SchedulerResult<Vec<Subtask>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_subtasks_for_exec(&self, exec_id: &str) -> SchedulerResult<Vec<Subtask>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .subtasks
            .values()
            .filter(|s| s.state == SubtaskState::Running && s.exec_id.as_deref() == Some(exec_id))
            .cloned()
            .collect())
    }

    async fn get_running_subtasks(&self) -> SchedulerResult<Vec<Subtask>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .subtasks
            .values()
            .filter(|s| s.state == SubtaskState::Running)
            .cloned()
            .collect())
    }

    async fn claim_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
    ) -> SchedulerResult<Option<Subtask>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let subtask = state
            .subtasks
            .get_mut(&subtask_id)
            .ok_or(SchedulerError::SubtaskNotFound { id: subtask_id })?;

        if subtask.state != SubtaskState::Pending || subtask.exec_id.is_some() {
            return Ok(None);
        }

        let now = Utc::now();
        subtask.state = SubtaskState::Running;
        subtask.exec_id = Some(exec_id.to_string());
        subtask.claim_token += 1;
        subtask.start_time = Some(now);
        subtask.update_time = now;
        Ok(Some(subtask.clone()))
    }

    async fn finish_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
        outcome: &SubtaskOutcome,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let subtask = state
            .subtasks
            .get_mut(&subtask_id)
            .ok_or(SchedulerError::SubtaskNotFound { id: subtask_id })?;

        if subtask.state != SubtaskState::Running
            || subtask.exec_id.as_deref() != Some(exec_id)
            || subtask.claim_token != claim_token
        {
            return Ok(false);
        }

        subtask.state = outcome.state();
        match outcome {
            SubtaskOutcome::Succeeded { summary, row_count } => {
                subtask.summary = summary.clone();
                subtask.row_count = *row_count;
                subtask.error = None;
            }
            SubtaskOutcome::Failed { error } => subtask.error = Some(error.clone()),
            SubtaskOutcome::Cancelled => {}
        }
        subtask.update_time = Utc::now();
        Ok(true)
    }

    async fn update_subtask_progress(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
        row_count: i64,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.subtasks.get_mut(&subtask_id) {
            Some(subtask)
                if subtask.state == SubtaskState::Running
                    && subtask.exec_id.as_deref() == Some(exec_id)
                    && subtask.claim_token == claim_token =>
            {
                subtask.row_count = row_count;
                subtask.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.subtasks.get_mut(&subtask_id) {
            Some(subtask)
                if subtask.state == SubtaskState::Running
                    && subtask.exec_id.as_deref() == Some(exec_id)
                    && subtask.claim_token == claim_token =>
            {
                subtask.state = SubtaskState::Pending;
                subtask.exec_id = None;
                subtask.start_time = None;
                subtask.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reassign_subtask(
        &self,
        subtask_id: i64,
        expected_exec_id: &str,
        expected_claim_token: i64,
        max_retries: i32,
    ) -> SchedulerResult<Option<SubtaskState>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let subtask = match state.subtasks.get_mut(&subtask_id) {
            Some(subtask)
                if subtask.state == SubtaskState::Running
                    && subtask.exec_id.as_deref() == Some(expected_exec_id)
                    && subtask.claim_token == expected_claim_token =>
            {
                subtask
            }
            _ => return Ok(None),
        };

        if subtask.retry_count >= max_retries {
            subtask.state = SubtaskState::Failed;
            subtask.error = Some(format!(
                "执行节点 {expected_exec_id} 失效，重试次数已耗尽"
            ));
        } else {
            subtask.state = SubtaskState::Pending;
            subtask.retry_count += 1;
        }
        subtask.exec_id = None;
        subtask.start_time = None;
        subtask.update_time = Utc::now();
        Ok(Some(subtask.state))
    }

    async fn update_subtask_state(
        &self,
        subtask_id: i64,
        expected: SubtaskState,
        new_state: SubtaskState,
    ) -> SchedulerResult<bool> {
        if !matches!(
            (expected, new_state),
            (SubtaskState::Failed, SubtaskState::Pending)
                | (SubtaskState::Pending, SubtaskState::Cancelled)
        ) {
            return Err(SchedulerError::InvalidStateTransition {
                from: expected.to_string(),
                to: new_state.to_string(),
            });
        }
        self.check_available()?;

        let mut state = self.state.lock().await;
        let subtask = state
            .subtasks
            .get_mut(&subtask_id)
            .ok_or(SchedulerError::SubtaskNotFound { id: subtask_id })?;
        if subtask.state != expected {
            return Ok(false);
        }

        subtask.state = new_state;
        if new_state == SubtaskState::Pending {
            subtask.retry_count += 1;
            subtask.exec_id = None;
            subtask.start_time = None;
        }
        subtask.update_time = Utc::now();
        Ok(true)
    }

    async fn register_node(
        &self,
        exec_id: &str,
        can_be_owner: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<NodeInfo> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.last_node_epoch += 1;
        let node = NodeInfo {
            exec_id: exec_id.to_string(),
            epoch: state.last_node_epoch,
            can_be_owner,
            last_heartbeat: now,
            registered_at: now,
        };
        state.nodes.insert(exec_id.to_string(), node.clone());
        Ok(node)
    }

    async fn heartbeat(
        &self,
        exec_id: &str,
        epoch: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.nodes.get_mut(exec_id) {
            Some(node) if node.epoch == epoch => {
                node.last_heartbeat = node.last_heartbeat.max(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deregister_node(&self, exec_id: &str, epoch: i64) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.nodes.get(exec_id).map(|n| n.epoch) == Some(epoch) {
            state.nodes.remove(exec_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_nodes(&self) -> SchedulerResult<Vec<NodeInfo>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut nodes: Vec<NodeInfo> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.exec_id.cmp(&b.exec_id));
        Ok(nodes)
    }

    async fn remove_dead_node(
        &self,
        exec_id: &str,
        epoch: i64,
        observed_heartbeat: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let matches = state
            .nodes
            .get(exec_id)
            .map(|n| n.epoch == epoch && n.last_heartbeat == observed_heartbeat)
            .unwrap_or(false);
        if matches {
            state.nodes.remove(exec_id);
        }
        Ok(matches)
    }
}
