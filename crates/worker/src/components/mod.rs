pub mod heartbeat_manager;
pub mod task_execution;
pub mod task_manager;

pub use heartbeat_manager::HeartbeatManager;
pub use task_execution::{BeforeSubtaskRunHook, SubtaskExecutionManager};
pub use task_manager::TaskManager;
