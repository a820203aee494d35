pub mod extension;
pub mod store;

pub use extension::{SchedulerExtension, StepExecutor};
pub use store::TaskStore;
