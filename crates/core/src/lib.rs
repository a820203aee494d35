//! # disttask-core
//!
//! 分布式任务框架的核心定义：数据模型、存储与任务类型接口、配置以及错误类型。
//! 调度（dispatcher）与执行（worker）两侧都只依赖本 crate 中的抽象。

pub mod config;
pub mod context;
pub mod errors;
pub mod liveness;
pub mod models;
pub mod retry;
pub mod task_type_registry;
pub mod traits;

pub use config::AppConfig;
pub use context::SubtaskContext;
pub use errors::{SchedulerError, SchedulerResult};
pub use liveness::LivenessGuard;
pub use retry::{retry_transient, RetryConfig};
pub use task_type_registry::TaskTypeRegistry;
