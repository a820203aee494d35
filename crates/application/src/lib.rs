//! 节点组合根：把存储、心跳、子任务执行、任务调度与失效检测组装为一个可启动、
//! 可优雅退出、也可模拟崩溃的节点，并提供内置的 `example` 任务类型。

pub mod builtin;
pub mod node;

pub use builtin::{
    builtin_registry, register_example, ExampleExtension, ExampleStepExecutor, ExampleTaskParams,
    EXAMPLE_TASK_TYPE,
};
pub use node::{Node, NodeHooks};
