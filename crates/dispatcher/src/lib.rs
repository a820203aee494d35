//! 调度侧组件：owner 仲裁、单任务调度器、节点失效检测与子任务重新分配，以及任务提交接口。

pub mod node_failure_detector;
pub mod owner;
pub mod reassignment;
pub mod scheduler;
pub mod scheduler_manager;
pub mod task_service;

pub use node_failure_detector::{
    NodeFailureDetector, NodeFailureDetectorConfig, NodeFailureDetectorService,
};
pub use owner::OwnerArbiter;
pub use reassignment::{ReassignmentService, SubtaskReassigner};
pub use scheduler::{SchedulerExit, SchedulerHooks, StepSubtasksCreatedHook, TaskScheduler};
pub use scheduler_manager::SchedulerManager;
pub use task_service::{TaskControlService, TaskService};
