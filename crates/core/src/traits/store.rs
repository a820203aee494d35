//! 任务存储接口
//!
//! 调度核心只依赖这一组条件更新（CAS）操作，不假设存在全局锁：
//!
//! - 任务：创建（key 唯一）、按 id/key 查询、owner 认领、状态条件更新
//! - 子任务：按步骤幂等创建、claim、带 token 的完成写入、重新分配
//! - 节点：注册、单调心跳、按观测到的心跳移除失效节点
//!
//! 返回 `Ok(false)` / `Ok(None)` 表示条件不满足（竞争失败），这不是错误，
//! 调用方应重新读取状态后决定下一步。只有存储本身的故障才返回 `Err`。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{
        NewTask, NodeInfo, Step, Subtask, SubtaskOutcome, SubtaskSpec, SubtaskState, Task,
        TaskTransition,
    },
    SchedulerResult,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 创建任务，key 已存在时返回 `TaskAlreadyExists`
    async fn create_task(&self, task: &NewTask) -> SchedulerResult<i64>;

    /// 按 ID 查询，不存在时返回 `TaskIdNotFound`
    async fn get_task_by_id(&self, id: i64) -> SchedulerResult<Task>;

    /// 按 key 查询，不存在时返回 `TaskNotFound`
    async fn get_task_by_key(&self, key: &str) -> SchedulerResult<Task>;

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>>;

    /// 所有未进入终态的任务
    async fn list_active_tasks(&self) -> SchedulerResult<Vec<Task>>;

    /// 认领 owner：仅当 owner 与 owner_epoch 都等于读取时的值才成功，成功后 epoch 加一
    async fn claim_task_owner(
        &self,
        task_id: i64,
        expected_owner: Option<&str>,
        expected_epoch: i64,
        new_owner: &str,
    ) -> SchedulerResult<Option<Task>>;

    /// 主动释放 owner（优雅退出），epoch 加一使旧调度器的写入全部失效
    async fn release_task_owner(&self, task_id: i64, owner: &str, epoch: i64)
        -> SchedulerResult<bool>;

    /// 任务状态条件更新，请求不满足状态格时返回 `InvalidStateTransition`
    async fn update_task_state(
        &self,
        task_id: i64,
        transition: &TaskTransition,
    ) -> SchedulerResult<bool>;

    /// 为任务当前步骤创建子任务
    ///
    /// 仅当任务 owner_epoch 与当前步骤都匹配、且该步骤尚无子任务时写入；
    /// 否则返回 `false` 且不做任何修改。
    async fn create_subtasks(
        &self,
        task_id: i64,
        step: Step,
        expected_epoch: i64,
        specs: &[SubtaskSpec],
    ) -> SchedulerResult<bool>;

    async fn get_subtasks_by_step(&self, task_id: i64, step: Step)
        -> SchedulerResult<Vec<Subtask>>;

    async fn get_subtasks_by_task(&self, task_id: i64) -> SchedulerResult<Vec<Subtask>>;

    /// 分配给指定节点且仍在运行的子任务
    async fn get_subtasks_for_exec(&self, exec_id: &str) -> SchedulerResult<Vec<Subtask>>;

    /// 所有 Running 子任务，供失效检测扫描孤儿子任务
    async fn get_running_subtasks(&self) -> SchedulerResult<Vec<Subtask>>;

    /// Pending -> Running，写入 exec_id 并递增 claim_token
    async fn claim_subtask(&self, subtask_id: i64, exec_id: &str)
        -> SchedulerResult<Option<Subtask>>;

    /// Running -> Succeeded/Failed/Cancelled，要求 exec_id 与 claim_token 都匹配
    async fn finish_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
        outcome: &SubtaskOutcome,
    ) -> SchedulerResult<bool>;

    /// 更新运行中子任务的进度
    async fn update_subtask_progress(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
        row_count: i64,
    ) -> SchedulerResult<bool>;

    /// Running -> Pending，清空 exec_id，不计重试（暂停、优雅退出）
    async fn release_subtask(
        &self,
        subtask_id: i64,
        exec_id: &str,
        claim_token: i64,
    ) -> SchedulerResult<bool>;

    /// 节点失效后的重新分配
    ///
    /// Running -> Pending 并清空 exec_id、重试次数加一；重试次数已达 `max_retries`
    /// 时改为 Failed。返回写入后的状态，条件不满足时返回 `None`。
    async fn reassign_subtask(
        &self,
        subtask_id: i64,
        expected_exec_id: &str,
        expected_claim_token: i64,
        max_retries: i32,
    ) -> SchedulerResult<Option<SubtaskState>>;

    /// 通用子任务状态条件更新
    ///
    /// 支持 Failed -> Pending（重试，重试次数加一）与 Pending -> Cancelled。
    async fn update_subtask_state(
        &self,
        subtask_id: i64,
        expected: SubtaskState,
        new_state: SubtaskState,
    ) -> SchedulerResult<bool>;

    /// 注册节点，返回带新 epoch 的节点记录
    async fn register_node(
        &self,
        exec_id: &str,
        can_be_owner: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<NodeInfo>;

    /// 刷新心跳，时间戳只增不减；记录不存在或 epoch 不符时返回 `false`
    async fn heartbeat(&self, exec_id: &str, epoch: i64, now: DateTime<Utc>)
        -> SchedulerResult<bool>;

    async fn deregister_node(&self, exec_id: &str, epoch: i64) -> SchedulerResult<bool>;

    async fn list_nodes(&self) -> SchedulerResult<Vec<NodeInfo>>;

    /// 移除失效节点：仅当 epoch 与心跳时间仍等于观测值时成功
    async fn remove_dead_node(
        &self,
        exec_id: &str,
        epoch: i64,
        observed_heartbeat: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 心跳未超时的节点 exec_id
    async fn list_live_exec_ids(
        &self,
        heartbeat_timeout: Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<String>> {
        let nodes = self.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|node| !node.is_heartbeat_expired(now, heartbeat_timeout))
            .map(|node| node.exec_id)
            .collect())
    }
}
