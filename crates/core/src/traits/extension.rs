use async_trait::async_trait;

use crate::{
    context::SubtaskContext,
    models::{Step, Subtask, SubtaskResult, SubtaskSpec, Task},
    SchedulerError, SchedulerResult,
};

/// 任务类型的调度扩展，由 owner 节点上的调度器调用
#[async_trait]
pub trait SchedulerExtension: Send + Sync {
    /// 为任务的某个步骤生成子任务
    async fn generate_subtasks(&self, task: &Task, step: Step) -> SchedulerResult<Vec<SubtaskSpec>>;

    /// 当前步骤完成后的下一个步骤，所有步骤完成时返回 `Step::DONE`
    fn get_next_step(&self, task: &Task) -> Step;

    /// 子任务进入 Succeeded / Failed 时通知一次
    async fn on_subtask_terminal(&self, _task: &Task, _subtask: &Subtask) -> SchedulerResult<()> {
        Ok(())
    }

    /// 是否支持补偿回滚；支持时失败和取消会经过 Reverting
    fn supports_revert(&self) -> bool {
        false
    }

    /// 回滚某个已完成步骤，按步骤倒序调用
    async fn compensate(&self, _task: &Task, _step: Step) -> SchedulerResult<()> {
        Ok(())
    }

    /// 生成子任务或补偿时的错误是否可在下一轮重试
    fn is_retryable_error(&self, err: &SchedulerError) -> bool {
        err.is_transient()
    }
}

/// 步骤执行器：在执行节点上运行单个子任务
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// 执行子任务；长时间运行的实现应定期调用 `ctx.checkpoint()`
    async fn run_subtask(
        &self,
        ctx: &SubtaskContext,
        subtask: &Subtask,
    ) -> SchedulerResult<SubtaskResult>;
}
