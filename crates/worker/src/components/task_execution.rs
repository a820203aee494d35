use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use disttask_core::{
    models::{CancelReason, Subtask, SubtaskOutcome, Task},
    retry_transient,
    traits::{StepExecutor, TaskStore},
    LivenessGuard, RetryConfig, SchedulerError, SchedulerResult, SubtaskContext, TaskTypeRegistry,
};

/// 子任务开始执行前的回调：(exec_id, 任务, 子任务)
pub type BeforeSubtaskRunHook = Arc<dyn Fn(&str, &Task, &Subtask) + Send + Sync>;

struct RunningSubtask {
    task_id: i64,
    abort_tx: watch::Sender<Option<CancelReason>>,
    handle: JoinHandle<()>,
}

/// 执行结束后对存储的处理
enum Completion {
    Finish(SubtaskOutcome),
    Release,
    Discard,
}

/// 子任务执行管理
///
/// 用信号量限制本节点同时运行的子任务数；每个运行中的子任务持有一个中止通道，
/// 取消、暂停、节点退出、隔离与被重新分配都通过它通知执行器。
pub struct SubtaskExecutionManager {
    exec_id: String,
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    liveness: LivenessGuard,
    retry: RetryConfig,
    progress_interval: Duration,
    slots: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<i64, RunningSubtask>>>,
    before_run: Option<BeforeSubtaskRunHook>,
}

impl SubtaskExecutionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exec_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        liveness: LivenessGuard,
        retry: RetryConfig,
        max_concurrent_subtasks: usize,
        progress_interval: Duration,
        before_run: Option<BeforeSubtaskRunHook>,
    ) -> Self {
        Self {
            exec_id: exec_id.into(),
            store,
            registry,
            liveness,
            retry,
            progress_interval,
            slots: Arc::new(Semaphore::new(max_concurrent_subtasks)),
            running: Arc::new(Mutex::new(HashMap::new())),
            before_run,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// 预留一个执行槽位，槽位已满时返回 `None`
    pub fn try_reserve_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub async fn is_running(&self, subtask_id: i64) -> bool {
        self.running.lock().await.contains_key(&subtask_id)
    }

    pub async fn running_subtasks(&self) -> Vec<(i64, i64)> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(id, running)| (*id, running.task_id))
            .collect()
    }

    pub async fn running_count_for_task(&self, task_id: i64) -> usize {
        self.running
            .lock()
            .await
            .values()
            .filter(|running| running.task_id == task_id)
            .count()
    }

    /// 在后台执行已认领的子任务
    pub async fn spawn(&self, task: Task, subtask: Subtask, permit: OwnedSemaphorePermit) {
        let executor = match self.registry.executor(&task.task_type, subtask.step) {
            Ok(executor) => executor,
            Err(e) => {
                error!("{} 没有可用的执行器: {}", subtask.entity_description(), e);
                let outcome = SubtaskOutcome::Failed {
                    error: e.to_string(),
                };
                if let Err(e) = self
                    .store
                    .finish_subtask(subtask.id, &self.exec_id, subtask.claim_token, &outcome)
                    .await
                {
                    error!("写入 {} 的失败结果出错: {}", subtask.entity_description(), e);
                }
                return;
            }
        };

        let (abort_tx, abort_rx) = watch::channel(None);
        let ctx = SubtaskContext::new(task, self.exec_id.clone(), abort_rx);
        let runner = SubtaskRunner {
            exec_id: self.exec_id.clone(),
            store: Arc::clone(&self.store),
            liveness: self.liveness.clone(),
            retry: self.retry.clone(),
            progress_interval: self.progress_interval,
            running: Arc::clone(&self.running),
            before_run: self.before_run.clone(),
        };

        let subtask_id = subtask.id;
        let task_id = subtask.task_id;
        let mut running = self.running.lock().await;
        let handle = tokio::spawn(runner.run(ctx, subtask, executor, permit));
        running.insert(
            subtask_id,
            RunningSubtask {
                task_id,
                abort_tx,
                handle,
            },
        );
    }

    /// 通知单个子任务中止
    pub async fn abort(&self, subtask_id: i64, reason: CancelReason) -> bool {
        match self.running.lock().await.get(&subtask_id) {
            Some(running) => {
                debug!("中止子任务 {}: {}", subtask_id, reason);
                running.abort_tx.send_replace(Some(reason));
                true
            }
            None => false,
        }
    }

    pub async fn abort_all(&self, reason: CancelReason) -> usize {
        let running = self.running.lock().await;
        for running in running.values() {
            running.abort_tx.send_replace(Some(reason));
        }
        running.len()
    }

    /// 等待所有子任务结束
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.running.lock().await.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.running.lock().await.is_empty()
    }

    /// 直接终止所有执行，不写入任何结果
    pub async fn kill_all(&self) {
        let mut running = self.running.lock().await;
        for (_, running) in running.drain() {
            running.handle.abort();
        }
    }
}

/// 单个子任务的执行过程
struct SubtaskRunner {
    exec_id: String,
    store: Arc<dyn TaskStore>,
    liveness: LivenessGuard,
    retry: RetryConfig,
    progress_interval: Duration,
    running: Arc<Mutex<HashMap<i64, RunningSubtask>>>,
    before_run: Option<BeforeSubtaskRunHook>,
}

impl SubtaskRunner {
    async fn run(
        self,
        ctx: SubtaskContext,
        subtask: Subtask,
        executor: Arc<dyn StepExecutor>,
        _permit: OwnedSemaphorePermit,
    ) {
        if let Some(hook) = &self.before_run {
            hook(&self.exec_id, &ctx.task, &subtask);
        }
        debug!("开始执行 {} (token {})", subtask.entity_description(), subtask.claim_token);

        let started = Instant::now();
        let result = self.execute(&ctx, &subtask, executor.as_ref()).await;
        histogram!("disttask_subtask_duration_seconds").record(started.elapsed().as_secs_f64());

        let completion = match (result, ctx.abort_reason()) {
            (_, Some(CancelReason::Fenced | CancelReason::Reassigned)) => Completion::Discard,
            (Ok(result), _) => Completion::Finish(SubtaskOutcome::Succeeded {
                summary: result.summary,
                row_count: result.row_count.max(ctx.row_count()),
            }),
            (Err(SchedulerError::Cancelled(reason)), _) => match reason {
                CancelReason::Cancel => Completion::Finish(SubtaskOutcome::Cancelled),
                CancelReason::Pause | CancelReason::Shutdown => Completion::Release,
                CancelReason::Fenced | CancelReason::Reassigned => Completion::Discard,
            },
            (Err(e), _) => Completion::Finish(SubtaskOutcome::Failed {
                error: e.to_string(),
            }),
        };

        if let Err(e) = self.complete(&subtask, completion).await {
            error!("写回 {} 的执行结果失败: {}", subtask.entity_description(), e);
        }
        self.running.lock().await.remove(&subtask.id);
    }

    /// 运行执行器，同时监听中止信号并周期性上报进度
    async fn execute(
        &self,
        ctx: &SubtaskContext,
        subtask: &Subtask,
        executor: &dyn StepExecutor,
    ) -> SchedulerResult<disttask_core::models::SubtaskResult> {
        let run = executor.run_subtask(ctx, subtask);
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.tick().await;
        let mut reported_rows = 0;

        loop {
            tokio::select! {
                result = &mut run => return result,
                reason = ctx.cancelled() => return Err(SchedulerError::Cancelled(reason)),
                _ = ticker.tick() => {
                    let rows = ctx.row_count();
                    if rows == reported_rows || !self.liveness.is_live() {
                        continue;
                    }
                    match self
                        .store
                        .update_subtask_progress(subtask.id, &self.exec_id, subtask.claim_token, rows)
                        .await
                    {
                        Ok(true) => reported_rows = rows,
                        Ok(false) => {
                            warn!("{} 已不属于本节点，停止执行", subtask.entity_description());
                            return Err(SchedulerError::Cancelled(CancelReason::Reassigned));
                        }
                        Err(e) => debug!("上报 {} 进度失败: {}", subtask.entity_description(), e),
                    }
                }
            }
        }
    }

    async fn complete(&self, subtask: &Subtask, completion: Completion) -> SchedulerResult<()> {
        if matches!(completion, Completion::Discard) {
            debug!("{} 的结果被丢弃", subtask.entity_description());
            return Ok(());
        }
        if !self.liveness.is_live() {
            warn!(
                "节点 {} 已失去存活资格，不写回 {} 的结果",
                self.exec_id,
                subtask.entity_description()
            );
            return Ok(());
        }

        match completion {
            Completion::Finish(outcome) => {
                let written = retry_transient(&self.retry, "finish_subtask", || {
                    self.store.finish_subtask(
                        subtask.id,
                        &self.exec_id,
                        subtask.claim_token,
                        &outcome,
                    )
                })
                .await?;
                let state = outcome.state();
                if written {
                    info!("{} 执行结束: {}", subtask.entity_description(), state);
                    counter!("disttask_subtasks_finished_total", "state" => state.as_str())
                        .increment(1);
                } else {
                    warn!(
                        "{} 已被重新分配，丢弃本次结果 {}",
                        subtask.entity_description(),
                        state
                    );
                }
            }
            Completion::Release => {
                let released = retry_transient(&self.retry, "release_subtask", || {
                    self.store
                        .release_subtask(subtask.id, &self.exec_id, subtask.claim_token)
                })
                .await?;
                if released {
                    info!("{} 已释放回 Pending", subtask.entity_description());
                }
            }
            Completion::Discard => {}
        }
        Ok(())
    }
}
