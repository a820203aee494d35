use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use disttask_core::{
    config::{SchedulerConfig, SlowSubtaskPolicy},
    models::NodeInfo,
    traits::TaskStore,
    LivenessGuard, SchedulerResult,
};

use crate::reassignment::ReassignmentService;

/// 节点失效检测配置
#[derive(Debug, Clone)]
pub struct NodeFailureDetectorConfig {
    /// 心跳超时，超过即视为节点失效
    pub heartbeat_timeout: Duration,
    /// 检测间隔
    pub detection_interval: Duration,
    /// 慢子任务处理策略
    pub slow_subtask_policy: SlowSubtaskPolicy,
}

impl Default for NodeFailureDetectorConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for NodeFailureDetectorConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            heartbeat_timeout: config.dead_node_timeout(),
            detection_interval: config.detection_interval(),
            slow_subtask_policy: config.slow_subtask_policy,
        }
    }
}

/// 节点失效检测服务接口
#[async_trait]
pub trait NodeFailureDetectorService: Send + Sync {
    /// 启动检测循环，直到 `stop_detection`
    async fn start_detection(&self) -> SchedulerResult<()>;

    async fn stop_detection(&self) -> SchedulerResult<()>;

    /// 找出心跳超时的节点
    async fn detect_dead_nodes(&self) -> SchedulerResult<Vec<NodeInfo>>;

    /// 移除失效节点并重新分配其子任务，返回被重新分配的子任务数
    async fn handle_dead_node(&self, node: &NodeInfo) -> SchedulerResult<usize>;

    /// 重新分配执行节点已不存在的运行中子任务
    async fn sweep_orphaned_subtasks(&self) -> SchedulerResult<usize>;

    /// 按慢子任务策略处理运行过久的子任务
    async fn enforce_slow_subtask_policy(&self) -> SchedulerResult<usize>;
}

/// 节点失效检测实现
///
/// 每个节点都运行检测器；移除节点与重新分配都是条件更新，多个检测器并发时只有一个生效。
pub struct NodeFailureDetector {
    exec_id: String,
    store: Arc<dyn TaskStore>,
    reassigner: Arc<dyn ReassignmentService>,
    liveness: LivenessGuard,
    config: NodeFailureDetectorConfig,
    running: Arc<RwLock<bool>>,
}

impl NodeFailureDetector {
    pub fn new(
        exec_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        reassigner: Arc<dyn ReassignmentService>,
        liveness: LivenessGuard,
        config: Option<NodeFailureDetectorConfig>,
    ) -> Self {
        Self {
            exec_id: exec_id.into(),
            store,
            reassigner,
            liveness,
            config: config.unwrap_or_default(),
            running: Arc::new(RwLock::new(false)),
        }
    }

    fn is_node_dead(&self, node: &NodeInfo, now: DateTime<Utc>) -> bool {
        node.exec_id != self.exec_id && node.is_heartbeat_expired(now, self.config.heartbeat_timeout)
    }

    /// 执行一轮检测
    pub async fn detect_once(&self) -> SchedulerResult<usize> {
        if !self.liveness.is_live() {
            debug!("节点 {} 不具备存活资格，跳过本轮检测", self.exec_id);
            return Ok(0);
        }

        let mut reassigned = 0;
        for node in self.detect_dead_nodes().await? {
            match self.handle_dead_node(&node).await {
                Ok(count) => reassigned += count,
                Err(e) => error!("处理失效节点 {} 时出错: {}", node.exec_id, e),
            }
        }

        reassigned += self.sweep_orphaned_subtasks().await?;
        reassigned += self.enforce_slow_subtask_policy().await?;
        Ok(reassigned)
    }

    async fn detection_loop(&self) -> SchedulerResult<()> {
        info!("启动节点失效检测循环");

        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出节点失效检测循环");
                break;
            }

            match self.detect_once().await {
                Ok(count) if count > 0 => info!("本轮检测重新分配了 {} 个子任务", count),
                Ok(_) => {}
                Err(e) => error!("节点失效检测时出错: {}", e),
            }

            tokio::time::sleep(self.config.detection_interval).await;
        }

        Ok(())
    }
}

#[async_trait]
impl NodeFailureDetectorService for NodeFailureDetector {
    async fn start_detection(&self) -> SchedulerResult<()> {
        info!("启动节点失效检测服务");
        *self.running.write().await = true;
        self.detection_loop().await
    }

    async fn stop_detection(&self) -> SchedulerResult<()> {
        info!("停止节点失效检测服务");
        *self.running.write().await = false;
        Ok(())
    }

    async fn detect_dead_nodes(&self) -> SchedulerResult<Vec<NodeInfo>> {
        let now = Utc::now();
        let dead: Vec<NodeInfo> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| self.is_node_dead(node, now))
            .collect();

        for node in &dead {
            warn!(
                "检测到失效节点: {} (epoch {}, 上次心跳: {})",
                node.exec_id,
                node.epoch,
                node.last_heartbeat.format("%Y-%m-%d %H:%M:%S%.3f UTC")
            );
        }
        Ok(dead)
    }

    async fn handle_dead_node(&self, node: &NodeInfo) -> SchedulerResult<usize> {
        // 移除之后同名节点才能重新注册，它的认领都晚于这个时刻
        let removal_started = Utc::now();
        let removed = self
            .store
            .remove_dead_node(&node.exec_id, node.epoch, node.last_heartbeat)
            .await?;
        if !removed {
            debug!("节点 {} 已被其他检测器移除或心跳已恢复", node.exec_id);
            return Ok(0);
        }

        info!("已移除失效节点 {} (epoch {})", node.exec_id, node.epoch);
        counter!("disttask_dead_nodes_total").increment(1);
        let reassigned = self
            .reassigner
            .reassign_node(&node.exec_id, removal_started)
            .await?;
        Ok(reassigned.len())
    }

    async fn sweep_orphaned_subtasks(&self) -> SchedulerResult<usize> {
        // 先读子任务再读节点，保证读到的节点集合不早于子任务的认领
        let running = self.store.get_running_subtasks().await?;
        if running.is_empty() {
            return Ok(0);
        }
        let registered: HashSet<String> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .map(|node| node.exec_id)
            .collect();

        let mut reassigned = 0;
        for subtask in &running {
            let orphaned = subtask
                .exec_id
                .as_deref()
                .map(|exec_id| !registered.contains(exec_id))
                .unwrap_or(false);
            if orphaned
                && self
                    .reassigner
                    .reassign_subtask(subtask, "执行节点已注销")
                    .await?
                    .is_some()
            {
                reassigned += 1;
            }
        }
        Ok(reassigned)
    }

    async fn enforce_slow_subtask_policy(&self) -> SchedulerResult<usize> {
        let max_run_ms = match &self.config.slow_subtask_policy {
            SlowSubtaskPolicy::Disabled => return Ok(0),
            SlowSubtaskPolicy::Reassign { max_run_ms } => {
                i64::try_from(*max_run_ms).unwrap_or(i64::MAX)
            }
        };

        let now = Utc::now();
        let mut reassigned = 0;
        for subtask in self.store.get_running_subtasks().await? {
            let too_slow = subtask
                .start_time
                .map(|start| (now - start).num_milliseconds() > max_run_ms)
                .unwrap_or(false);
            if too_slow
                && self
                    .reassigner
                    .reassign_subtask(&subtask, "运行时间超过上限")
                    .await?
                    .is_some()
            {
                counter!("disttask_slow_subtasks_total").increment(1);
                reassigned += 1;
            }
        }
        Ok(reassigned)
    }
}
