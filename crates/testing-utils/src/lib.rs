//! # disttask-testing-utils
//!
//! 工作区内共享的测试工具：
//!
//! - **Builders**: 任务、子任务、节点的测试数据构造器
//! - **Mocks**: 可配置步骤数、可注入失败并记录调用的任务类型实现
//! - **Helpers**: 条件等待、测试日志、缩短各类间隔的测试配置

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;

pub use disttask_infrastructure::InMemoryTaskStore;
