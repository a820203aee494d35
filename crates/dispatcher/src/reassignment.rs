use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, warn};

use disttask_core::{
    models::{Subtask, SubtaskState},
    retry_transient,
    traits::TaskStore,
    RetryConfig, SchedulerResult,
};

/// 子任务重新分配服务接口
#[async_trait]
pub trait ReassignmentService: Send + Sync {
    /// 重新分配失效节点在 `claimed_before` 之前认领、仍在运行的子任务，返回被处理的子任务及其新状态
    ///
    /// 更晚的认领属于同名节点重新注册后的新实例，由它自己接管。
    async fn reassign_node(
        &self,
        exec_id: &str,
        claimed_before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(i64, SubtaskState)>>;

    /// 重新分配单个运行中的子任务；子任务已不在期望的执行者手中时返回 `None`
    async fn reassign_subtask(
        &self,
        subtask: &Subtask,
        reason: &str,
    ) -> SchedulerResult<Option<SubtaskState>>;
}

/// 基于存储条件更新的重新分配实现
///
/// 重置为 Pending 时累加重试次数，超过上限直接置为 Failed，避免毒丸子任务无限轮转。
pub struct SubtaskReassigner {
    store: Arc<dyn TaskStore>,
    max_retries: i32,
    retry: RetryConfig,
}

impl SubtaskReassigner {
    pub fn new(store: Arc<dyn TaskStore>, max_retries: i32, retry: RetryConfig) -> Self {
        Self {
            store,
            max_retries,
            retry,
        }
    }
}

#[async_trait]
impl ReassignmentService for SubtaskReassigner {
    async fn reassign_node(
        &self,
        exec_id: &str,
        claimed_before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(i64, SubtaskState)>> {
        let subtasks = retry_transient(&self.retry, "get_subtasks_for_exec", || {
            self.store.get_subtasks_for_exec(exec_id)
        })
        .await?;

        let mut reassigned = Vec::new();
        for subtask in &subtasks {
            if subtask.start_time.is_some_and(|start| start > claimed_before) {
                debug!("{} 由重新注册的节点认领，跳过", subtask.entity_description());
                continue;
            }
            match self.reassign_subtask(subtask, "执行节点失效").await {
                Ok(Some(state)) => reassigned.push((subtask.id, state)),
                Ok(None) => {}
                Err(e) => warn!("重新分配子任务 {} 失败: {}", subtask.id, e),
            }
        }

        if !reassigned.is_empty() {
            info!(
                "已重新分配失效节点 {} 上的 {} 个子任务",
                exec_id,
                reassigned.len()
            );
        }
        Ok(reassigned)
    }

    async fn reassign_subtask(
        &self,
        subtask: &Subtask,
        reason: &str,
    ) -> SchedulerResult<Option<SubtaskState>> {
        let Some(exec_id) = subtask.exec_id.as_deref() else {
            return Ok(None);
        };
        if subtask.state != SubtaskState::Running {
            return Ok(None);
        }

        let result = retry_transient(&self.retry, "reassign_subtask", || {
            self.store
                .reassign_subtask(subtask.id, exec_id, subtask.claim_token, self.max_retries)
        })
        .await?;

        match result {
            Some(state) => {
                info!(
                    "{} ({})，重新分配为 {} (已重试 {} 次)",
                    subtask.entity_description(),
                    reason,
                    state,
                    subtask.retry_count
                );
                counter!("disttask_subtasks_reassigned_total", "outcome" => state.as_str())
                    .increment(1);
            }
            None => debug!("{} 已被其他节点处理，跳过", subtask.entity_description()),
        }
        Ok(result)
    }
}
