//! 任务存储实现：内存版（测试与单进程）与 SQLite 版（多进程共享）

pub mod database;
pub mod in_memory_store;
pub mod store_factory;

pub use database::{SqliteDatabaseManager, SqliteTaskStore};
pub use in_memory_store::InMemoryTaskStore;
pub use store_factory::create_task_store;
