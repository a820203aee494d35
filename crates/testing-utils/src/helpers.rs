//! 测试辅助工具

use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::Utc;
use disttask_core::{config::SlowSubtaskPolicy, traits::TaskStore, AppConfig, RetryConfig};
use disttask_infrastructure::InMemoryTaskStore;
use tokio::time::sleep;

static INIT_LOGGING: Once = Once::new();

/// 初始化测试日志，`RUST_LOG` 未设置时只输出 warn 及以上
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub struct TestEnv;

impl TestEnv {
    /// 轮询直到条件成立或超时
    pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(20)).await
    }

    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(poll_interval).await;
        }
        condition().await
    }

    /// 基于时间戳生成不重复的名字
    pub fn unique_name(prefix: &str) -> String {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        format!("{prefix}_{timestamp}")
    }

    pub fn memory_store() -> Arc<dyn TaskStore> {
        Arc::new(InMemoryTaskStore::new())
    }
}

/// 所有间隔缩短到毫秒级的配置，用于多节点集成测试
pub fn fast_test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.url = "memory://".to_string();
    config.node.heartbeat_interval_ms = 50;
    config.node.poll_interval_ms = 20;
    config.node.max_concurrent_subtasks = 4;
    config.scheduler.dead_node_timeout_ms = 400;
    config.scheduler.check_interval_ms = 20;
    config.scheduler.detection_interval_ms = 50;
    config.scheduler.max_subtask_retries = 3;
    config.scheduler.slow_subtask_policy = SlowSubtaskPolicy::Disabled;
    config.scheduler.retry = RetryConfig {
        base_interval_ms: 5,
        max_interval_ms: 50,
        backoff_multiplier: 2.0,
        jitter_factor: 0.1,
        max_attempts: 5,
    };
    config
}
