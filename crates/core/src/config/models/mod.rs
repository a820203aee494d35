pub mod app_config;
pub mod node_scheduler;
pub mod observability;
pub mod store;

pub use app_config::AppConfig;
pub use node_scheduler::{NodeConfig, SchedulerConfig, SlowSubtaskPolicy};
pub use observability::ObservabilityConfig;
pub use store::StoreConfig;
