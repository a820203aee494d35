pub mod schema;
pub mod sqlite_task_store;

pub use sqlite_task_store::SqliteTaskStore;

use std::str::FromStr;
use std::time::Duration;

use disttask_core::{config::StoreConfig, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// SQLite 连接池管理
pub struct SqliteDatabaseManager {
    pool: SqlitePool,
}

impl SqliteDatabaseManager {
    pub async fn new(config: &StoreConfig) -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await?;

        info!("已连接SQLite任务存储: {}", config.url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建任务、子任务、节点三张表及其唯一索引
    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in schema::SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
