use serde::{Deserialize, Serialize};

use super::{Step, Subtask, SubtaskState, Task, TaskState};

/// 提交方查询到的任务状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: i64,
    pub key: String,
    pub task_type: String,
    pub state: TaskState,
    pub step: Step,
    pub owner: Option<String>,
    pub error: Option<String>,
    pub progress: TaskProgress,
}

impl TaskStatus {
    pub fn new(task: &Task, progress: TaskProgress) -> Self {
        Self {
            id: task.id,
            key: task.key.clone(),
            task_type: task.task_type.clone(),
            state: task.state,
            step: task.step,
            owner: task.owner.clone(),
            error: task.error.clone(),
            progress,
        }
    }
}

/// 子任务统计
///
/// 各状态计数只统计当前步骤（任务不在业务步骤时统计全部子任务），`row_count` 为所有步骤累计的行数。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub row_count: i64,
}

impl TaskProgress {
    pub fn from_subtasks<'a>(subtasks: impl IntoIterator<Item = &'a Subtask>) -> Self {
        let mut progress = TaskProgress::default();
        for subtask in subtasks {
            progress.total += 1;
            progress.row_count += subtask.row_count;
            match subtask.state {
                SubtaskState::Pending => progress.pending += 1,
                SubtaskState::Running => progress.running += 1,
                SubtaskState::Succeeded => progress.succeeded += 1,
                SubtaskState::Failed => progress.failed += 1,
                SubtaskState::Cancelled => progress.cancelled += 1,
            }
        }
        progress
    }

    /// 按任务当前步骤统计
    pub fn for_step(step: Step, subtasks: &[Subtask]) -> Self {
        let mut progress = if step.is_business() {
            Self::from_subtasks(subtasks.iter().filter(|s| s.step == step))
        } else {
            Self::from_subtasks(subtasks)
        };
        progress.row_count = subtasks.iter().map(|s| s.row_count).sum();
        progress
    }

    pub fn all_succeeded(&self) -> bool {
        self.total > 0 && self.succeeded == self.total
    }
}
