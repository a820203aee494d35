//! 执行侧组件：节点心跳与自我隔离、子任务认领与执行。

pub mod components;

pub use components::{
    BeforeSubtaskRunHook, HeartbeatManager, SubtaskExecutionManager, TaskManager,
};
