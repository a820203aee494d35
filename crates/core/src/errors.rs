use thiserror::Error;

use crate::models::CancelReason;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务存储暂不可用: {0}")]
    StoreUnavailable(String),

    #[error("任务未找到: {key}")]
    TaskNotFound { key: String },

    #[error("任务未找到: id={id}")]
    TaskIdNotFound { id: i64 },

    #[error("子任务未找到: {id}")]
    SubtaskNotFound { id: i64 },

    #[error("任务已存在: {key}")]
    TaskAlreadyExists { key: String },

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("任务类型未注册: {task_type}")]
    HandlerNotRegistered { task_type: String },

    #[error("步骤执行错误: {0}")]
    StepExecution(String),

    #[error("子任务被中止: {0}")]
    Cancelled(CancelReason),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 是否为可重试的瞬时错误（存储抖动、连接池耗尽、SQLite 锁冲突等）
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::StoreUnavailable(_) => true,
            SchedulerError::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => {
                    let msg = db.message();
                    msg.contains("locked") || msg.contains("busy")
                }
                _ => false,
            },
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedulerError::Cancelled(_))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
