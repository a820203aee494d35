use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info};

use disttask_core::{
    models::{NewTask, Task, TaskProgress, TaskState, TaskStatus, TaskTransition},
    traits::TaskStore,
    SchedulerError, SchedulerResult, TaskTypeRegistry,
};

/// 用户操作与调度器并发修改状态时的最大重试次数
const MAX_CONTROL_ATTEMPTS: usize = 16;

/// 任务提交与控制接口
#[async_trait]
pub trait TaskControlService: Send + Sync {
    /// 提交任务，返回任务 ID；key 已存在时返回 `TaskAlreadyExists`
    async fn submit_task(&self, task: NewTask) -> SchedulerResult<i64>;

    /// 查询任务状态以及当前步骤的子任务进度
    async fn get_task_status(&self, key: &str) -> SchedulerResult<TaskStatus>;

    /// 请求取消；任务已终态时返回 `false`
    async fn cancel_task(&self, key: &str) -> SchedulerResult<bool>;

    /// 请求暂停运行中的任务
    async fn pause_task(&self, key: &str) -> SchedulerResult<bool>;

    /// 恢复已暂停的任务
    async fn resume_task(&self, key: &str) -> SchedulerResult<bool>;

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>>;
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<TaskTypeRegistry>) -> Self {
        Self { store, registry }
    }

    fn validate(&self, task: &NewTask) -> SchedulerResult<()> {
        if task.key.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams("任务 key 不能为空".to_string()));
        }
        if task.concurrency <= 0 {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "并发度必须大于0: {}",
                task.concurrency
            )));
        }
        if !self.registry.contains(&task.task_type) {
            return Err(SchedulerError::HandlerNotRegistered {
                task_type: task.task_type.clone(),
            });
        }
        Ok(())
    }

    /// 在状态变化的竞争下反复尝试 `decide` 给出的转换
    ///
    /// `decide` 根据当前状态返回 `Ok(Some(target))` 执行转换，`Ok(None)` 表示无需操作。
    async fn control<F>(&self, key: &str, action: &str, decide: F) -> SchedulerResult<bool>
    where
        F: Fn(TaskState) -> SchedulerResult<Option<TaskState>> + Send + Sync,
    {
        for _ in 0..MAX_CONTROL_ATTEMPTS {
            let task = self.store.get_task_by_key(key).await?;
            let Some(target) = decide(task.state)? else {
                debug!("任务 {} 处于 {}，{} 无需操作", key, task.state, action);
                return Ok(false);
            };

            let transition = TaskTransition::new(task.state, target);
            if self.store.update_task_state(task.id, &transition).await? {
                info!("任务 {} {}: {} -> {}", key, action, task.state, target);
                counter!("disttask_task_control_total", "action" => action.to_string()).increment(1);
                return Ok(true);
            }
        }
        Err(SchedulerError::Internal(format!(
            "任务 {key} {action} 失败: 状态持续变化"
        )))
    }
}

#[async_trait]
impl TaskControlService for TaskService {
    async fn submit_task(&self, task: NewTask) -> SchedulerResult<i64> {
        self.validate(&task)?;
        let id = self.store.create_task(&task).await?;
        info!("提交任务 {} (ID: {}, 类型: {})", task.key, id, task.task_type);
        counter!("disttask_tasks_submitted_total").increment(1);
        Ok(id)
    }

    async fn get_task_status(&self, key: &str) -> SchedulerResult<TaskStatus> {
        let task = self.store.get_task_by_key(key).await?;
        let subtasks = self.store.get_subtasks_by_task(task.id).await?;
        Ok(TaskStatus::new(&task, TaskProgress::for_step(task.step, &subtasks)))
    }

    async fn cancel_task(&self, key: &str) -> SchedulerResult<bool> {
        self.control(key, "cancel", |state| {
            Ok(match state {
                TaskState::Pending
                | TaskState::Running
                | TaskState::Pausing
                | TaskState::Paused
                | TaskState::Resuming => Some(TaskState::Cancelling),
                _ => None,
            })
        })
        .await
    }

    async fn pause_task(&self, key: &str) -> SchedulerResult<bool> {
        self.control(key, "pause", |state| match state {
            TaskState::Pending | TaskState::Running => Ok(Some(TaskState::Pausing)),
            TaskState::Pausing | TaskState::Paused => Ok(None),
            other => Err(SchedulerError::InvalidStateTransition {
                from: other.to_string(),
                to: TaskState::Pausing.to_string(),
            }),
        })
        .await
    }

    async fn resume_task(&self, key: &str) -> SchedulerResult<bool> {
        self.control(key, "resume", |state| match state {
            TaskState::Paused => Ok(Some(TaskState::Resuming)),
            TaskState::Resuming | TaskState::Running => Ok(None),
            other => Err(SchedulerError::InvalidStateTransition {
                from: other.to_string(),
                to: TaskState::Resuming.to_string(),
            }),
        })
        .await
    }

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>> {
        self.store.list_tasks().await
    }
}
