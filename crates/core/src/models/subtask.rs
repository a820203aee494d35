use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{impl_sqlite_text_enum, Step};

/// 子任务：分配给单个节点执行的最小可重试单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    pub task_id: i64,
    pub step: Step,
    /// 在所属步骤内的序号，`(task_id, step, ordinal)` 唯一
    pub ordinal: i32,
    /// Pending 时为空，被 claim 后为执行节点
    pub exec_id: Option<String>,
    pub state: SubtaskState,
    /// 每次 claim 递增，完成写入必须携带匹配的 token
    pub claim_token: i64,
    pub retry_count: i32,
    pub meta: serde_json::Value,
    pub summary: Option<serde_json::Value>,
    pub row_count: i64,
    pub error: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
}

impl Subtask {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn entity_description(&self) -> String {
        format!(
            "子任务 {} (任务: {}, 步骤: {}, 序号: {})",
            self.id, self.task_id, self.step, self.ordinal
        )
    }
}

/// 调度扩展生成的子任务描述，序号由其在列表中的位置决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub meta: serde_json::Value,
}

impl SubtaskSpec {
    pub fn new(meta: serde_json::Value) -> Self {
        Self { meta }
    }
}

/// 子任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubtaskState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl SubtaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskState::Pending => "PENDING",
            SubtaskState::Running => "RUNNING",
            SubtaskState::Succeeded => "SUCCEEDED",
            SubtaskState::Failed => "FAILED",
            SubtaskState::Cancelled => "CANCELLED",
        }
    }

    /// Failed 在重试预算内仍会被调度器拉回 Pending，这里只看状态本身
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskState::Succeeded | SubtaskState::Failed | SubtaskState::Cancelled
        )
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SubtaskState::Pending),
            "RUNNING" => Ok(SubtaskState::Running),
            "SUCCEEDED" => Ok(SubtaskState::Succeeded),
            "FAILED" => Ok(SubtaskState::Failed),
            "CANCELLED" => Ok(SubtaskState::Cancelled),
            _ => Err(format!("Invalid subtask state: {s}")),
        }
    }
}

impl_sqlite_text_enum!(SubtaskState);

/// 子任务执行结束时写回的结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubtaskOutcome {
    Succeeded {
        summary: Option<serde_json::Value>,
        row_count: i64,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl SubtaskOutcome {
    pub fn state(&self) -> SubtaskState {
        match self {
            SubtaskOutcome::Succeeded { .. } => SubtaskState::Succeeded,
            SubtaskOutcome::Failed { .. } => SubtaskState::Failed,
            SubtaskOutcome::Cancelled => SubtaskState::Cancelled,
        }
    }
}

/// 子任务被中止的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// 任务被取消或失败，写入 Cancelled
    Cancel,
    /// 任务暂停，释放回 Pending 且不计重试
    Pause,
    /// 节点优雅退出，释放回 Pending 且不计重试
    Shutdown,
    /// 本节点已失去存活资格，不再写入任何结果
    Fenced,
    /// 子任务已被重新分配给其他节点，不再写入任何结果
    Reassigned,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Cancel => "cancel",
            CancelReason::Pause => "pause",
            CancelReason::Shutdown => "shutdown",
            CancelReason::Fenced => "fenced",
            CancelReason::Reassigned => "reassigned",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 子任务执行结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubtaskResult {
    pub summary: Option<serde_json::Value>,
    pub row_count: i64,
}
