//! 测试用的任务类型实现
//!
//! `HaTestExtension` 与 `RecordingStepExecutor` 记录所有调用，集群测试中各节点共享同一个实例，
//! 以便断言子任务不会被重复执行或重复生成。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use disttask_core::{
    models::{Step, Subtask, SubtaskResult, SubtaskSpec, Task},
    traits::{SchedulerExtension, StepExecutor},
    SchedulerError, SchedulerResult, SubtaskContext, TaskTypeRegistry,
};

pub const HA_TEST_TASK_TYPE: &str = "ha_test";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 可配置步骤和子任务数量的调度扩展
pub struct HaTestExtension {
    subtasks_per_step: Vec<usize>,
    supports_revert: bool,
    transient_generate_failures: AtomicU32,
    fail_generate: AtomicBool,
    generate_calls: Mutex<Vec<(i64, Step)>>,
    terminal_notifications: Mutex<Vec<i64>>,
    compensations: Mutex<Vec<(i64, Step)>>,
}

impl HaTestExtension {
    /// `subtasks_per_step[i]` 为第 i+1 个步骤的子任务数
    pub fn new(subtasks_per_step: Vec<usize>) -> Self {
        Self {
            subtasks_per_step,
            supports_revert: false,
            transient_generate_failures: AtomicU32::new(0),
            fail_generate: AtomicBool::new(false),
            generate_calls: Mutex::new(Vec::new()),
            terminal_notifications: Mutex::new(Vec::new()),
            compensations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_revert(mut self) -> Self {
        self.supports_revert = true;
        self
    }

    /// 之后的 `count` 次生成返回瞬时错误
    pub fn with_transient_generate_failures(self, count: u32) -> Self {
        self.transient_generate_failures.store(count, Ordering::SeqCst);
        self
    }

    /// 生成子任务总是返回不可重试的错误
    pub fn with_failing_generate(self) -> Self {
        self.fail_generate.store(true, Ordering::SeqCst);
        self
    }

    pub fn step_count(&self) -> usize {
        self.subtasks_per_step.len()
    }

    pub fn total_subtasks(&self) -> usize {
        self.subtasks_per_step.iter().sum()
    }

    pub fn generate_calls(&self) -> Vec<(i64, Step)> {
        lock(&self.generate_calls).clone()
    }

    pub fn terminal_notifications(&self) -> Vec<i64> {
        lock(&self.terminal_notifications).clone()
    }

    pub fn compensations(&self) -> Vec<(i64, Step)> {
        lock(&self.compensations).clone()
    }
}

#[async_trait]
impl SchedulerExtension for HaTestExtension {
    async fn generate_subtasks(&self, task: &Task, step: Step) -> SchedulerResult<Vec<SubtaskSpec>> {
        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(SchedulerError::StepExecution(format!(
                "任务 {} 无法生成步骤 {} 的子任务",
                task.key, step
            )));
        }
        let injected = self
            .transient_generate_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(SchedulerError::StoreUnavailable("注入的生成失败".to_string()));
        }

        lock(&self.generate_calls).push((task.id, step));
        let count = usize::try_from(step.value() - 1)
            .ok()
            .and_then(|index| self.subtasks_per_step.get(index))
            .copied()
            .unwrap_or(0);
        Ok((0..count)
            .map(|i| SubtaskSpec::new(serde_json::json!({ "task": task.key, "step": step.value(), "index": i })))
            .collect())
    }

    fn get_next_step(&self, task: &Task) -> Step {
        let next = if task.step.is_init() { 1 } else { task.step.value() + 1 };
        if next as usize > self.subtasks_per_step.len() {
            Step::DONE
        } else {
            Step(next)
        }
    }

    async fn on_subtask_terminal(&self, _task: &Task, subtask: &Subtask) -> SchedulerResult<()> {
        lock(&self.terminal_notifications).push(subtask.id);
        Ok(())
    }

    fn supports_revert(&self) -> bool {
        self.supports_revert
    }

    async fn compensate(&self, task: &Task, step: Step) -> SchedulerResult<()> {
        lock(&self.compensations).push((task.id, step));
        Ok(())
    }
}

/// 一次子任务执行的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskRun {
    pub task_id: i64,
    pub subtask_id: i64,
    pub step: Step,
    pub ordinal: i32,
    pub exec_id: String,
}

/// 按固定时长运行并记录执行情况的步骤执行器
pub struct RecordingStepExecutor {
    run_duration: Duration,
    fail_first_attempts: AtomicU32,
    always_fail: bool,
    started: Mutex<Vec<SubtaskRun>>,
    completed: Mutex<Vec<SubtaskRun>>,
}

impl RecordingStepExecutor {
    pub fn new(run_duration: Duration) -> Self {
        Self {
            run_duration,
            fail_first_attempts: AtomicU32::new(0),
            always_fail: false,
            started: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// 前 `count` 次执行返回错误
    pub fn with_failures(self, count: u32) -> Self {
        self.fail_first_attempts.store(count, Ordering::SeqCst);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn started(&self) -> Vec<SubtaskRun> {
        lock(&self.started).clone()
    }

    pub fn completed(&self) -> Vec<SubtaskRun> {
        lock(&self.completed).clone()
    }

    /// 每个子任务被成功执行的次数
    pub fn completion_counts(&self) -> HashMap<i64, usize> {
        let mut counts = HashMap::new();
        for run in lock(&self.completed).iter() {
            *counts.entry(run.subtask_id).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl StepExecutor for RecordingStepExecutor {
    async fn run_subtask(
        &self,
        ctx: &SubtaskContext,
        subtask: &Subtask,
    ) -> SchedulerResult<SubtaskResult> {
        let run = SubtaskRun {
            task_id: subtask.task_id,
            subtask_id: subtask.id,
            step: subtask.step,
            ordinal: subtask.ordinal,
            exec_id: ctx.exec_id.clone(),
        };
        lock(&self.started).push(run.clone());

        let slice = Duration::from_millis(10);
        let mut elapsed = Duration::ZERO;
        while elapsed < self.run_duration {
            ctx.checkpoint()?;
            tokio::time::sleep(slice).await;
            elapsed += slice;
        }
        ctx.checkpoint()?;

        let injected = self
            .fail_first_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if self.always_fail || injected.is_ok() {
            return Err(SchedulerError::StepExecution(format!(
                "子任务 {} 执行失败",
                subtask.id
            )));
        }

        ctx.report_rows(1);
        lock(&self.completed).push(run);
        Ok(SubtaskResult {
            summary: Some(serde_json::json!({ "ordinal": subtask.ordinal })),
            row_count: ctx.row_count(),
        })
    }
}

/// 注册 `ha_test` 任务类型，所有步骤共用同一个执行器
pub fn ha_test_registry(
    extension: Arc<HaTestExtension>,
    executor: Arc<RecordingStepExecutor>,
) -> TaskTypeRegistry {
    let executors = (1..=extension.step_count() as i64)
        .map(|n| (Step(n), Arc::clone(&executor) as Arc<dyn StepExecutor>))
        .collect();
    let mut registry = TaskTypeRegistry::new();
    registry.register(HA_TEST_TASK_TYPE, extension, executors);
    registry
}
