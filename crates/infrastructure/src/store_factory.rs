use std::sync::Arc;

use disttask_core::{config::StoreConfig, traits::TaskStore, SchedulerResult};
use tracing::info;

use crate::{database::SqliteDatabaseManager, InMemoryTaskStore, SqliteTaskStore};

/// 根据存储 URL 创建任务存储
pub async fn create_task_store(config: &StoreConfig) -> SchedulerResult<Arc<dyn TaskStore>> {
    if config.is_memory() {
        info!("使用内存任务存储");
        return Ok(Arc::new(InMemoryTaskStore::new()));
    }

    let manager = SqliteDatabaseManager::new(config).await?;
    manager.migrate().await?;
    Ok(Arc::new(SqliteTaskStore::new(manager.pool().clone())))
}
