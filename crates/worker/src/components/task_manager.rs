use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use disttask_core::{
    models::{CancelReason, Subtask, SubtaskOutcome, SubtaskState, Task, TaskState},
    traits::TaskStore,
    LivenessGuard, SchedulerResult,
};

use super::task_execution::SubtaskExecutionManager;

/// 执行侧的轮询管理
///
/// 每个轮询周期：中止已不属于本节点或所属任务不再运行的子任务，接管本节点名下但
/// 本地没有运行的子任务（例如重新注册之后），再按任务并发度与空闲槽位认领新的子任务。
pub struct TaskManager {
    exec_id: String,
    store: Arc<dyn TaskStore>,
    execution: Arc<SubtaskExecutionManager>,
    liveness: LivenessGuard,
    poll_interval: Duration,
}

impl TaskManager {
    pub fn new(
        exec_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        execution: Arc<SubtaskExecutionManager>,
        liveness: LivenessGuard,
        poll_interval: Duration,
    ) -> Self {
        Self {
            exec_id: exec_id.into(),
            store,
            execution,
            liveness,
            poll_interval,
        }
    }

    pub fn execution(&self) -> &Arc<SubtaskExecutionManager> {
        &self.execution
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("节点 {} 的子任务轮询启动", self.exec_id);
        let mut fence_events = self.liveness.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                changed = fence_events.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let aborted = self.execution.abort_all(CancelReason::Fenced).await;
                    if aborted > 0 {
                        warn!("节点 {} 被隔离，中止了 {} 个子任务", self.exec_id, aborted);
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.tick().await {
                        Ok(started) if started > 0 => debug!("本轮开始执行 {} 个子任务", started),
                        Ok(_) => {}
                        Err(e) => warn!("节点 {} 子任务轮询失败: {}", self.exec_id, e),
                    }
                }
            }
        }
        info!("节点 {} 的子任务轮询退出", self.exec_id);
    }

    /// 执行一轮轮询，返回本轮开始执行的子任务数
    pub async fn tick(&self) -> SchedulerResult<usize> {
        if !self.liveness.is_live() {
            return Ok(0);
        }

        let mine = self.store.get_subtasks_for_exec(&self.exec_id).await?;
        let mine_ids: HashSet<i64> = mine.iter().map(|s| s.id).collect();
        let tasks: HashMap<i64, Task> = self
            .store
            .list_active_tasks()
            .await?
            .into_iter()
            .map(|task| (task.id, task))
            .collect();

        self.abort_stale_runs(&mine_ids, &tasks).await;

        let mut started = 0;
        for subtask in mine {
            if self.execution.is_running(subtask.id).await {
                continue;
            }
            match tasks.get(&subtask.task_id) {
                Some(task) if task.state.accepts_subtask_execution() => {
                    let Some(permit) = self.execution.try_reserve_slot() else {
                        return Ok(started);
                    };
                    info!("接管本节点名下未在运行的 {}", subtask.entity_description());
                    self.execution.spawn(task.clone(), subtask, permit).await;
                    started += 1;
                }
                Some(task) if task.state == TaskState::Resuming => {}
                task => {
                    self.settle_orphaned_run(&subtask, task.map(|task| task.state))
                        .await
                }
            }
        }

        let mut runnable: Vec<&Task> = tasks
            .values()
            .filter(|task| task.state.accepts_subtask_execution() && task.step.is_business())
            .collect();
        runnable.shuffle(&mut rand::rng());

        for task in runnable {
            if self.execution.available_slots() == 0 {
                break;
            }
            started += self.claim_for_task(task).await?;
        }
        Ok(started)
    }

    async fn abort_stale_runs(&self, mine_ids: &HashSet<i64>, tasks: &HashMap<i64, Task>) {
        for (subtask_id, task_id) in self.execution.running_subtasks().await {
            let reason = match tasks.get(&task_id).map(|task| task.state) {
                None | Some(TaskState::Cancelling | TaskState::Reverting) => Some(CancelReason::Cancel),
                Some(TaskState::Pausing | TaskState::Paused) => Some(CancelReason::Pause),
                Some(_) if !mine_ids.contains(&subtask_id) => Some(CancelReason::Reassigned),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                if self.execution.abort(subtask_id, reason).await {
                    info!("中止子任务 {} ({})", subtask_id, reason);
                }
            }
        }
    }

    /// 结束本节点名下、本地已没有执行过程的子任务
    ///
    /// 写回结果失败（例如存储短暂不可用）后子任务仍停留在 Running。任务暂停时释放回
    /// Pending，其余情况写入 Cancelled。
    async fn settle_orphaned_run(&self, subtask: &Subtask, task_state: Option<TaskState>) {
        let result = match task_state {
            Some(TaskState::Pausing | TaskState::Paused) => {
                self.store
                    .release_subtask(subtask.id, &self.exec_id, subtask.claim_token)
                    .await
            }
            _ => {
                self.store
                    .finish_subtask(
                        subtask.id,
                        &self.exec_id,
                        subtask.claim_token,
                        &SubtaskOutcome::Cancelled,
                    )
                    .await
            }
        };
        match result {
            Ok(true) => info!(
                "{} 已无本地执行过程，按任务状态 {:?} 收尾",
                subtask.entity_description(),
                task_state
            ),
            Ok(false) => {}
            Err(e) => warn!("收尾 {} 失败: {}", subtask.entity_description(), e),
        }
    }

    async fn claim_for_task(&self, task: &Task) -> SchedulerResult<usize> {
        let concurrency = usize::try_from(task.concurrency.max(1)).unwrap_or(1);
        let mut local = self.execution.running_count_for_task(task.id).await;
        if local >= concurrency {
            return Ok(0);
        }

        let mut pending: Vec<_> = self
            .store
            .get_subtasks_by_step(task.id, task.step)
            .await?
            .into_iter()
            .filter(|s| s.state == SubtaskState::Pending)
            .collect();
        pending.shuffle(&mut rand::rng());

        let mut started = 0;
        for subtask in pending {
            if local >= concurrency {
                break;
            }
            let Some(permit) = self.execution.try_reserve_slot() else {
                break;
            };
            if let Some(claimed) = self.store.claim_subtask(subtask.id, &self.exec_id).await? {
                debug!("认领 {} (token {})", claimed.entity_description(), claimed.claim_token);
                self.execution.spawn(task.clone(), claimed, permit).await;
                local += 1;
                started += 1;
            }
        }
        Ok(started)
    }
}
