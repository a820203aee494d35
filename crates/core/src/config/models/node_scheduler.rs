use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 为空时使用 `hostname:pid`
    pub exec_id: String,
    /// 是否参与 owner 竞争
    pub can_be_owner: bool,
    /// 本节点同时运行的子任务上限
    pub max_concurrent_subtasks: usize,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            exec_id: String::new(),
            can_be_owner: true,
            max_concurrent_subtasks: 8,
            heartbeat_interval_ms: 1000,
            poll_interval_ms: 500,
        }
    }
}

impl NodeConfig {
    pub fn resolve_exec_id(&self) -> String {
        if !self.exec_id.is_empty() {
            return self.exec_id.clone();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        format!("{}:{}", host, std::process::id())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_subtasks == 0 {
            return Err(anyhow::anyhow!("最大并发子任务数必须大于0"));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        Ok(())
    }
}

/// 慢子任务处理策略
///
/// 默认只在节点失效时重新分配子任务；`Reassign` 会把运行超过 `max_run_ms`
/// 的子任务也重新分配，即使执行节点仍然存活。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SlowSubtaskPolicy {
    #[default]
    Disabled,
    Reassign { max_run_ms: u64 },
}

/// 调度与高可用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 心跳超过该时长未刷新的节点视为失效
    pub dead_node_timeout_ms: u64,
    /// 调度器推进步骤与 owner 竞争的间隔
    pub check_interval_ms: u64,
    /// 失效检测间隔
    pub detection_interval_ms: u64,
    /// 单个子任务最多重试次数
    pub max_subtask_retries: i32,
    /// 单个节点最多同时驱动的任务数
    pub max_running_schedulers: usize,
    pub slow_subtask_policy: SlowSubtaskPolicy,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dead_node_timeout_ms: 10_000,
            check_interval_ms: 500,
            detection_interval_ms: 2000,
            max_subtask_retries: 3,
            max_running_schedulers: 16,
            slow_subtask_policy: SlowSubtaskPolicy::Disabled,
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn dead_node_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_node_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dead_node_timeout_ms == 0 {
            return Err(anyhow::anyhow!("节点失效超时必须大于0"));
        }

        if self.check_interval_ms == 0 || self.detection_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度与检测间隔必须大于0"));
        }

        if self.max_subtask_retries < 0 {
            return Err(anyhow::anyhow!("子任务最大重试次数不能为负数"));
        }

        if self.max_running_schedulers == 0 {
            return Err(anyhow::anyhow!("最大调度任务数必须大于0"));
        }

        if let SlowSubtaskPolicy::Reassign { max_run_ms } = self.slow_subtask_policy {
            if max_run_ms == 0 {
                return Err(anyhow::anyhow!("慢子任务阈值必须大于0"));
            }
        }

        self.retry.validate()
    }
}
