use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use disttask_core::{
    config::SchedulerConfig,
    models::{Step, Subtask, SubtaskState, Task, TaskState, TaskTransition},
    retry_transient,
    traits::{SchedulerExtension, TaskStore},
    SchedulerError, SchedulerResult, TaskTypeRegistry,
};

/// 子任务批量创建后的回调：(任务, 步骤, 子任务数)
pub type StepSubtasksCreatedHook = Arc<dyn Fn(&Task, Step, usize) + Send + Sync>;

/// 调度器测试钩子
#[derive(Clone, Default)]
pub struct SchedulerHooks {
    pub on_step_subtasks_created: Option<StepSubtasksCreatedHook>,
}

/// 调度器退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// 任务进入终态
    Finished,
    /// 已不再是任务 owner（被接管或 epoch 变化）
    Demoted,
    /// 节点停止
    Stopped,
}

/// 单个任务的调度器
///
/// 仅在本节点持有 `(exec_id, epoch)` 所有权期间运行，所有写入都以 epoch 为条件，
/// 被接管后旧调度器的写入全部失效。
pub struct TaskScheduler {
    task_id: i64,
    exec_id: String,
    epoch: i64,
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    config: SchedulerConfig,
    hooks: SchedulerHooks,
    notified: HashSet<i64>,
}

impl TaskScheduler {
    pub fn new(
        task: &Task,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        config: SchedulerConfig,
        hooks: SchedulerHooks,
    ) -> Self {
        Self {
            task_id: task.id,
            exec_id: task.owner.clone().unwrap_or_default(),
            epoch: task.owner_epoch,
            store,
            registry,
            config,
            hooks,
            notified: HashSet::new(),
        }
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    /// 周期性推进任务直到终态、被降级或收到停止信号
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> SchedulerExit {
        info!(
            "任务 {} 的调度器启动 (owner: {}, epoch: {})",
            self.task_id, self.exec_id, self.epoch
        );
        let mut consecutive_failures = 0u32;

        loop {
            let delay = match self.tick().await {
                Ok(Some(exit)) => {
                    info!("任务 {} 的调度器退出: {:?}", self.task_id, exit);
                    return exit;
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    self.config.check_interval()
                }
                Err(SchedulerError::TaskIdNotFound { id }) => {
                    error!("任务 {} 已不存在，调度器退出", id);
                    return SchedulerExit::Finished;
                }
                Err(e) if e.is_transient() => {
                    let delay = self.config.retry.backoff(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        "任务 {} 调度遇到瞬时错误，{}ms 后重试: {}",
                        self.task_id,
                        delay.as_millis(),
                        e
                    );
                    delay
                }
                Err(e) => {
                    error!("任务 {} 调度出错: {}", self.task_id, e);
                    self.config.check_interval()
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("任务 {} 的调度器收到停止信号", self.task_id);
                    return SchedulerExit::Stopped;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 执行一轮调度
    pub async fn tick(&mut self) -> SchedulerResult<Option<SchedulerExit>> {
        let task = self.store.get_task_by_id(self.task_id).await?;
        if !task.is_owned_by(&self.exec_id, self.epoch) {
            return Ok(Some(SchedulerExit::Demoted));
        }
        if task.is_terminal() {
            return Ok(Some(SchedulerExit::Finished));
        }

        let extension = match self.registry.extension(&task.task_type) {
            Ok(extension) => extension,
            Err(e) => {
                if task.state.can_transition_to(TaskState::Failed) {
                    self.transition(&task, TaskState::Failed, |t| t.with_error(e.to_string()))
                        .await?;
                }
                return Err(e);
            }
        };

        match task.state {
            TaskState::Pending => {
                if self.transition(&task, TaskState::Running, |t| t).await? {
                    counter!("disttask_tasks_started_total").increment(1);
                }
            }
            TaskState::Running => self.on_running(&task, extension.as_ref()).await?,
            TaskState::Cancelling => self.on_cancelling(&task, extension.as_ref()).await?,
            TaskState::Pausing => {
                if !self.has_running_subtasks(&task).await? {
                    self.transition(&task, TaskState::Paused, |t| t).await?;
                }
            }
            TaskState::Resuming => {
                self.transition(&task, TaskState::Running, |t| t).await?;
            }
            TaskState::Reverting => self.on_reverting(&task, extension.as_ref()).await?,
            TaskState::Paused => {}
            TaskState::Succeeded | TaskState::Failed | TaskState::Reverted | TaskState::Cancelled => {
                return Ok(Some(SchedulerExit::Finished));
            }
        }
        Ok(None)
    }

    async fn on_running(
        &mut self,
        task: &Task,
        extension: &dyn SchedulerExtension,
    ) -> SchedulerResult<()> {
        if !task.step.is_business() {
            return self.advance_step(task, extension).await;
        }

        let subtasks = self.store.get_subtasks_by_step(task.id, task.step).await?;
        if subtasks.is_empty() {
            return self.generate_subtasks(task, extension).await;
        }

        let mut exhausted: Option<&Subtask> = None;
        for subtask in &subtasks {
            match subtask.state {
                SubtaskState::Failed if subtask.retry_count < self.config.max_subtask_retries => {
                    if self
                        .store
                        .update_subtask_state(subtask.id, SubtaskState::Failed, SubtaskState::Pending)
                        .await?
                    {
                        info!(
                            "{} 执行失败，重试第 {} 次",
                            subtask.entity_description(),
                            subtask.retry_count + 1
                        );
                        counter!("disttask_subtask_retries_total").increment(1);
                    }
                }
                SubtaskState::Failed => {
                    self.notify_terminal(task, subtask, extension).await;
                    exhausted.get_or_insert(subtask);
                }
                SubtaskState::Succeeded => self.notify_terminal(task, subtask, extension).await,
                _ => {}
            }
        }

        if let Some(subtask) = exhausted {
            let reason = format!(
                "{} 重试次数已耗尽: {}",
                subtask.entity_description(),
                subtask.error.as_deref().unwrap_or("unknown error")
            );
            return self.fail_task(task, extension, reason).await;
        }

        if subtasks.iter().all(|s| s.state == SubtaskState::Succeeded) {
            info!("任务 {} 步骤 {} 的 {} 个子任务全部完成", task.key, task.step, subtasks.len());
            self.advance_step(task, extension).await?;
        }
        Ok(())
    }

    async fn generate_subtasks(
        &self,
        task: &Task,
        extension: &dyn SchedulerExtension,
    ) -> SchedulerResult<()> {
        let specs = match extension.generate_subtasks(task, task.step).await {
            Ok(specs) => specs,
            Err(e) if extension.is_retryable_error(&e) => {
                warn!("任务 {} 步骤 {} 生成子任务失败，稍后重试: {}", task.key, task.step, e);
                return Ok(());
            }
            Err(e) => {
                let reason = format!("生成步骤 {} 的子任务失败: {}", task.step, e);
                return self.fail_task(task, extension, reason).await;
            }
        };

        if specs.is_empty() {
            debug!("任务 {} 步骤 {} 没有子任务，直接推进", task.key, task.step);
            return self.advance_step(task, extension).await;
        }

        if self
            .store
            .create_subtasks(task.id, task.step, self.epoch, &specs)
            .await?
        {
            info!("任务 {} 步骤 {} 创建了 {} 个子任务", task.key, task.step, specs.len());
            counter!("disttask_subtasks_created_total").increment(specs.len() as u64);
            if let Some(hook) = &self.hooks.on_step_subtasks_created {
                hook(task, task.step, specs.len());
            }
        }
        Ok(())
    }

    async fn advance_step(
        &self,
        task: &Task,
        extension: &dyn SchedulerExtension,
    ) -> SchedulerResult<()> {
        let next = extension.get_next_step(task);
        if next.is_done() {
            if self
                .transition(task, TaskState::Succeeded, |t| t.with_step(Step::DONE))
                .await?
            {
                info!("任务 {} 执行成功", task.key);
                counter!("disttask_tasks_finished_total", "state" => "SUCCEEDED").increment(1);
            }
        } else {
            let advanced = self
                .store
                .update_task_state(
                    task.id,
                    &TaskTransition::advance_step(TaskState::Running, next).with_epoch(self.epoch),
                )
                .await?;
            if advanced {
                info!("任务 {} 从 {} 推进到 {}", task.key, task.step, next);
            }
        }
        Ok(())
    }

    /// 子任务重试耗尽或生成失败：支持补偿的任务进入 Reverting，否则直接 Failed
    async fn fail_task(
        &self,
        task: &Task,
        extension: &dyn SchedulerExtension,
        reason: String,
    ) -> SchedulerResult<()> {
        let target = if extension.supports_revert() && task.state == TaskState::Running {
            TaskState::Reverting
        } else {
            TaskState::Failed
        };
        // 任务状态以当前 epoch 写入成功后才处理子任务
        if !self
            .transition(task, target, |t| t.with_error(reason.clone()))
            .await?
        {
            return Ok(());
        }
        warn!("任务 {} 失败并进入 {}: {}", task.key, target, reason);
        if target == TaskState::Failed {
            counter!("disttask_tasks_finished_total", "state" => "FAILED").increment(1);
            if let Err(e) = retry_transient(&self.config.retry, "cancel_pending_subtasks", || {
                self.cancel_pending_subtasks(task)
            })
            .await
            {
                warn!("取消任务 {} 剩余的 Pending 子任务失败: {}", task.key, e);
            }
        }
        Ok(())
    }

    async fn on_cancelling(
        &self,
        task: &Task,
        extension: &dyn SchedulerExtension,
    ) -> SchedulerResult<()> {
        self.cancel_pending_subtasks(task).await?;
        if self.has_running_subtasks(task).await? {
            debug!("任务 {} 等待运行中的子任务响应取消", task.key);
            return Ok(());
        }

        let target = if extension.supports_revert() && task.step.is_business() {
            TaskState::Reverting
        } else {
            TaskState::Cancelled
        };
        if self
            .transition(task, target, |t| t.with_error("cancelled by user"))
            .await?
        {
            info!("任务 {} 取消完成，进入 {}", task.key, target);
            if target == TaskState::Cancelled {
                counter!("disttask_tasks_finished_total", "state" => "CANCELLED").increment(1);
            }
        }
        Ok(())
    }

    /// 从当前步骤开始倒序补偿，每完成一步就把步骤回退一格，接管后可以继续
    async fn on_reverting(
        &self,
        task: &Task,
        extension: &dyn SchedulerExtension,
    ) -> SchedulerResult<()> {
        self.cancel_pending_subtasks(task).await?;
        if self.has_running_subtasks(task).await? {
            debug!("任务 {} 等待运行中的子任务响应回滚", task.key);
            return Ok(());
        }

        if task.step.is_business() {
            if let Err(e) = extension.compensate(task, task.step).await {
                if extension.is_retryable_error(&e) {
                    warn!("任务 {} 补偿步骤 {} 失败，稍后重试: {}", task.key, task.step, e);
                    return Ok(());
                }
                let reason = format!("补偿步骤 {} 失败: {}", task.step, e);
                if self
                    .transition(task, TaskState::Failed, |t| t.with_error(reason.clone()))
                    .await?
                {
                    error!("任务 {} {}", task.key, reason);
                    counter!("disttask_tasks_finished_total", "state" => "FAILED").increment(1);
                }
                return Ok(());
            }
            info!("任务 {} 已补偿步骤 {}", task.key, task.step);

            if task.step.value() > Step::ONE.value() {
                let previous = Step(task.step.value() - 1);
                self.store
                    .update_task_state(
                        task.id,
                        &TaskTransition::advance_step(TaskState::Reverting, previous)
                            .with_epoch(self.epoch),
                    )
                    .await?;
                return Ok(());
            }
        }

        if self.transition(task, TaskState::Reverted, |t| t).await? {
            info!("任务 {} 回滚完成", task.key);
            counter!("disttask_tasks_finished_total", "state" => "REVERTED").increment(1);
        }
        Ok(())
    }

    async fn notify_terminal(
        &mut self,
        task: &Task,
        subtask: &Subtask,
        extension: &dyn SchedulerExtension,
    ) {
        if self.notified.contains(&subtask.id) {
            return;
        }
        match extension.on_subtask_terminal(task, subtask).await {
            Ok(()) => {
                self.notified.insert(subtask.id);
            }
            Err(e) => warn!("{} 终态回调失败: {}", subtask.entity_description(), e),
        }
    }

    async fn cancel_pending_subtasks(&self, task: &Task) -> SchedulerResult<()> {
        let subtasks = self.store.get_subtasks_by_task(task.id).await?;
        for subtask in subtasks.iter().filter(|s| s.state == SubtaskState::Pending) {
            self.store
                .update_subtask_state(subtask.id, SubtaskState::Pending, SubtaskState::Cancelled)
                .await?;
        }
        Ok(())
    }

    async fn has_running_subtasks(&self, task: &Task) -> SchedulerResult<bool> {
        let subtasks = self.store.get_subtasks_by_task(task.id).await?;
        Ok(subtasks.iter().any(|s| s.state == SubtaskState::Running))
    }

    async fn transition<F>(&self, task: &Task, to: TaskState, build: F) -> SchedulerResult<bool>
    where
        F: FnOnce(TaskTransition) -> TaskTransition,
    {
        let transition = build(TaskTransition::new(task.state, to).with_epoch(self.epoch));
        let applied = self.store.update_task_state(task.id, &transition).await?;
        if applied {
            debug!("任务 {} 状态 {} -> {}", task.key, task.state, to);
        } else {
            debug!("任务 {} 状态 {} -> {} 未生效，状态已被修改", task.key, task.state, to);
        }
        Ok(applied)
    }
}
