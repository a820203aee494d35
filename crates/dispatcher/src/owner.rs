use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info};

use disttask_core::{
    models::{NodeInfo, Task},
    traits::TaskStore,
    SchedulerResult,
};

/// 任务 owner 仲裁
///
/// 通过存储上的条件更新争夺任务的调度权，同一时刻至多一个节点成功。
pub struct OwnerArbiter {
    store: Arc<dyn TaskStore>,
    exec_id: String,
}

impl OwnerArbiter {
    pub fn new(store: Arc<dyn TaskStore>, exec_id: impl Into<String>) -> Self {
        Self {
            store,
            exec_id: exec_id.into(),
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// 心跳未超时且可担任 owner 的节点
    pub fn owner_candidates(
        nodes: &[NodeInfo],
        heartbeat_timeout: Duration,
        now: DateTime<Utc>,
    ) -> HashSet<String> {
        nodes
            .iter()
            .filter(|node| node.can_be_owner && !node.is_heartbeat_expired(now, heartbeat_timeout))
            .map(|node| node.exec_id.clone())
            .collect()
    }

    /// 任务无主、owner 已不是存活的候选节点，或 owner 是本节点但本地没有对应调度器时，值得尝试认领
    pub fn should_claim(
        &self,
        task: &Task,
        owner_candidates: &HashSet<String>,
        has_local_scheduler: bool,
    ) -> bool {
        if task.is_terminal() {
            return false;
        }
        match task.owner.as_deref() {
            None => true,
            Some(owner) if owner == self.exec_id => !has_local_scheduler,
            Some(owner) => !owner_candidates.contains(owner),
        }
    }

    /// 尝试成为任务 owner，成功时返回带新 epoch 的任务
    pub async fn try_claim(
        &self,
        task: &Task,
        owner_candidates: &HashSet<String>,
        has_local_scheduler: bool,
    ) -> SchedulerResult<Option<Task>> {
        if !self.should_claim(task, owner_candidates, has_local_scheduler) {
            return Ok(None);
        }

        let claimed = self
            .store
            .claim_task_owner(
                task.id,
                task.owner.as_deref(),
                task.owner_epoch,
                &self.exec_id,
            )
            .await?;

        match &claimed {
            Some(claimed_task) => {
                let kind = if task.owner.is_some() { "takeover" } else { "fresh" };
                info!(
                    "节点 {} 成为任务 {} 的 owner (epoch {}, 原 owner: {:?})",
                    self.exec_id,
                    task.key,
                    claimed_task.owner_epoch,
                    task.owner
                );
                counter!("disttask_owner_claims_total", "kind" => kind).increment(1);
            }
            None => debug!("认领任务 {} 失败，已被其他节点抢先", task.key),
        }

        Ok(claimed)
    }
}
