//! 内置的 `example` 任务类型
//!
//! 两个步骤，每步的子任务数量取自任务元数据，例如 `{"step_one": 10, "step_two": 5}`。
//! 子任务只按 `subtask_sleep_ms` 休眠并报告处理行数，用于命令行演示与集成测试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use disttask_core::{
    models::{Step, Subtask, SubtaskResult, SubtaskSpec, Task},
    traits::{SchedulerExtension, StepExecutor},
    SchedulerError, SchedulerResult, SubtaskContext, TaskTypeRegistry,
};

pub const EXAMPLE_TASK_TYPE: &str = "example";

const STEP_COUNT: i64 = 2;

/// `example` 任务的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleTaskParams {
    #[serde(default = "default_step_one")]
    pub step_one: usize,
    #[serde(default = "default_step_two")]
    pub step_two: usize,
    #[serde(default = "default_subtask_sleep_ms")]
    pub subtask_sleep_ms: u64,
}

fn default_step_one() -> usize {
    10
}

fn default_step_two() -> usize {
    5
}

fn default_subtask_sleep_ms() -> u64 {
    100
}

impl Default for ExampleTaskParams {
    fn default() -> Self {
        Self {
            step_one: default_step_one(),
            step_two: default_step_two(),
            subtask_sleep_ms: default_subtask_sleep_ms(),
        }
    }
}

impl ExampleTaskParams {
    pub fn from_task(task: &Task) -> SchedulerResult<Self> {
        if task.meta.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(task.meta.clone()).map_err(|e| {
            SchedulerError::InvalidTaskParams(format!("解析 example 任务参数失败: {e}"))
        })
    }

    pub fn subtask_count(&self, step: Step) -> usize {
        match step.value() {
            1 => self.step_one,
            2 => self.step_two,
            _ => 0,
        }
    }

    pub fn to_meta(&self) -> serde_json::Value {
        serde_json::json!({
            "step_one": self.step_one,
            "step_two": self.step_two,
            "subtask_sleep_ms": self.subtask_sleep_ms,
        })
    }
}

/// `example` 任务的调度扩展
#[derive(Debug, Default)]
pub struct ExampleExtension;

#[async_trait]
impl SchedulerExtension for ExampleExtension {
    async fn generate_subtasks(&self, task: &Task, step: Step) -> SchedulerResult<Vec<SubtaskSpec>> {
        let params = ExampleTaskParams::from_task(task)?;
        let count = params.subtask_count(step);
        debug!("任务 {} 步骤 {} 生成 {} 个子任务", task.key, step, count);
        Ok((0..count)
            .map(|index| {
                SubtaskSpec::new(serde_json::json!({
                    "index": index,
                    "sleep_ms": params.subtask_sleep_ms,
                }))
            })
            .collect())
    }

    fn get_next_step(&self, task: &Task) -> Step {
        if task.step.is_init() {
            Step::ONE
        } else if task.step.value() < STEP_COUNT {
            Step(task.step.value() + 1)
        } else {
            Step::DONE
        }
    }
}

/// `example` 任务的步骤执行器
#[derive(Debug, Default)]
pub struct ExampleStepExecutor;

#[async_trait]
impl StepExecutor for ExampleStepExecutor {
    async fn run_subtask(
        &self,
        ctx: &SubtaskContext,
        subtask: &Subtask,
    ) -> SchedulerResult<SubtaskResult> {
        let sleep_ms = subtask
            .meta
            .get("sleep_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(default_subtask_sleep_ms);

        // 分片休眠，每片之间检查一次中止信号
        let slice = Duration::from_millis(sleep_ms.clamp(1, 20));
        let deadline = tokio::time::Instant::now() + Duration::from_millis(sleep_ms);
        while tokio::time::Instant::now() < deadline {
            ctx.checkpoint()?;
            tokio::time::sleep(slice).await;
        }
        ctx.checkpoint()?;
        ctx.report_rows(1);

        Ok(SubtaskResult {
            summary: Some(serde_json::json!({
                "step": subtask.step.value(),
                "ordinal": subtask.ordinal,
                "exec_id": ctx.exec_id,
            })),
            row_count: ctx.row_count(),
        })
    }
}

/// 注册所有内置任务类型
pub fn builtin_registry() -> TaskTypeRegistry {
    let mut registry = TaskTypeRegistry::new();
    register_example(&mut registry);
    registry
}

pub fn register_example(registry: &mut TaskTypeRegistry) {
    let executor: Arc<dyn StepExecutor> = Arc::new(ExampleStepExecutor);
    let executors = (1..=STEP_COUNT)
        .map(|n| (Step(n), Arc::clone(&executor)))
        .collect();
    registry.register(EXAMPLE_TASK_TYPE, Arc::new(ExampleExtension), executors);
}
