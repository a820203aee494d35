use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use disttask_core::{models::NodeInfo, traits::TaskStore, LivenessGuard, SchedulerResult};

/// 节点心跳管理
///
/// 负责注册节点、周期性写入心跳并维护 `LivenessGuard`。心跳被拒绝说明节点已被其他
/// 节点判定失效，此时立即自我隔离并以新的 epoch 重新注册。
pub struct HeartbeatManager {
    exec_id: String,
    can_be_owner: bool,
    store: Arc<dyn TaskStore>,
    liveness: LivenessGuard,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(
        exec_id: impl Into<String>,
        can_be_owner: bool,
        store: Arc<dyn TaskStore>,
        liveness: LivenessGuard,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            exec_id: exec_id.into(),
            can_be_owner,
            store,
            liveness,
            heartbeat_interval,
        }
    }

    pub fn liveness(&self) -> &LivenessGuard {
        &self.liveness
    }

    pub async fn register(&self) -> SchedulerResult<NodeInfo> {
        let node = self
            .store
            .register_node(&self.exec_id, self.can_be_owner, Utc::now())
            .await?;
        self.liveness.mark_registered(node.epoch, node.last_heartbeat);
        info!(
            "节点 {} 已注册 (epoch {}, 可担任 owner: {})",
            node.exec_id, node.epoch, node.can_be_owner
        );
        counter!("disttask_node_registrations_total").increment(1);
        Ok(node)
    }

    /// 发送一次心跳，返回心跳是否被接受
    pub async fn beat(&self) -> SchedulerResult<bool> {
        if self.liveness.is_fenced() {
            self.register().await?;
            return Ok(true);
        }

        let now = Utc::now();
        match self.store.heartbeat(&self.exec_id, self.liveness.epoch(), now).await {
            Ok(true) => {
                self.liveness.record_heartbeat(now);
                debug!("节点 {} 心跳成功", self.exec_id);
                Ok(true)
            }
            Ok(false) => {
                self.liveness.fence("心跳被拒绝，节点已被判定失效");
                counter!("disttask_node_fenced_total", "reason" => "rejected").increment(1);
                self.register().await?;
                Ok(false)
            }
            Err(e) => {
                if !self.liveness.is_live() {
                    self.liveness.fence("心跳持续失败超过隔离时限");
                    counter!("disttask_node_fenced_total", "reason" => "lapsed").increment(1);
                }
                Err(e)
            }
        }
    }

    /// 心跳循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!("节点 {} 心跳失败: {}", self.exec_id, e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("节点 {} 心跳循环退出", self.exec_id);
                    break;
                }
            }
        }
    }

    /// 优雅退出时注销节点
    pub async fn deregister(&self) -> SchedulerResult<bool> {
        let epoch = self.liveness.epoch();
        self.liveness.fence("节点退出");
        match self.store.deregister_node(&self.exec_id, epoch).await {
            Ok(removed) => {
                info!("节点 {} 已注销 (epoch {})", self.exec_id, epoch);
                Ok(removed)
            }
            Err(e) => {
                error!("节点 {} 注销失败: {}", self.exec_id, e);
                Err(e)
            }
        }
    }
}
