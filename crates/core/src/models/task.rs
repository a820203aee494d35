use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{impl_sqlite_text_enum, Step};

/// 分布式任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// 提交时指定的唯一 key
    pub key: String,
    /// 任务类型，决定使用哪个调度扩展与步骤执行器
    pub task_type: String,
    pub state: TaskState,
    pub step: Step,
    /// 单个节点上该任务可同时运行的子任务数
    pub concurrency: i32,
    /// 当前驱动该任务的节点 exec_id
    pub owner: Option<String>,
    /// owner 变更计数，每次 owner 被 CAS 更新时加一
    pub owner_epoch: i64,
    pub meta: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub state_update_time: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 检查给定节点是否以给定 epoch 持有该任务
    pub fn is_owned_by(&self, exec_id: &str, epoch: i64) -> bool {
        self.owner.as_deref() == Some(exec_id) && self.owner_epoch == epoch
    }

    pub fn entity_description(&self) -> String {
        format!("任务 '{}' (ID: {}, 类型: {})", self.key, self.id, self.task_type)
    }
}

/// 任务提交请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub key: String,
    pub task_type: String,
    pub concurrency: i32,
    pub meta: serde_json::Value,
}

impl NewTask {
    pub fn new(key: impl Into<String>, task_type: impl Into<String>, concurrency: i32) -> Self {
        Self {
            key: key.into(),
            task_type: task_type.into(),
            concurrency,
            meta: serde_json::json!({}),
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "CANCELLING")]
    Cancelling,
    #[serde(rename = "PAUSING")]
    Pausing,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "RESUMING")]
    Resuming,
    #[serde(rename = "REVERTING")]
    Reverting,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "REVERTED")]
    Reverted,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 11] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Cancelling,
        TaskState::Pausing,
        TaskState::Paused,
        TaskState::Resuming,
        TaskState::Reverting,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Reverted,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Cancelling => "CANCELLING",
            TaskState::Pausing => "PAUSING",
            TaskState::Paused => "PAUSED",
            TaskState::Resuming => "RESUMING",
            TaskState::Reverting => "REVERTING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Reverted => "REVERTED",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    /// 终态：Succeeded / Failed / Reverted / Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Reverted | TaskState::Cancelled
        )
    }

    /// 子任务执行器是否应继续运行该任务的子任务
    pub fn accepts_subtask_execution(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    /// 状态格是否允许 `self -> next`
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Running | Cancelling | Pausing | Failed) => true,
            (Running, Succeeded | Failed | Reverting | Cancelling | Pausing) => true,
            (Pausing, Paused | Cancelling) => true,
            (Paused, Resuming | Cancelling) => true,
            (Resuming, Running | Cancelling) => true,
            (Cancelling, Reverting | Cancelled) => true,
            (Reverting, Reverted | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid task state: {s}"))
    }
}

impl_sqlite_text_enum!(TaskState);

/// 任务状态的条件更新请求
///
/// 只有当存储中的状态等于 `expected_state`（且给定 `expected_epoch` 时 owner_epoch
/// 也相等）才会生效。`new_state == expected_state` 且带 `step` 时表示同状态内推进步骤。
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub expected_state: TaskState,
    pub new_state: TaskState,
    pub expected_epoch: Option<i64>,
    pub step: Option<Step>,
    pub error: Option<String>,
}

impl TaskTransition {
    pub fn new(expected_state: TaskState, new_state: TaskState) -> Self {
        Self {
            expected_state,
            new_state,
            expected_epoch: None,
            step: None,
            error: None,
        }
    }

    /// 同状态内推进到下一个步骤
    pub fn advance_step(state: TaskState, step: Step) -> Self {
        Self::new(state, state).with_step(step)
    }

    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.expected_epoch = Some(epoch);
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// 检查请求本身是否满足状态格
    pub fn is_valid(&self) -> bool {
        if self.expected_state == self.new_state {
            return self.step.is_some();
        }
        self.expected_state.can_transition_to(self.new_state)
    }
}
