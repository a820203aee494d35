//! 测试数据构造器

use chrono::{DateTime, Utc};
use disttask_core::models::{NodeInfo, Step, Subtask, SubtaskState, Task, TaskState};

/// 构造 `Task`
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            task: Task {
                id: 1,
                key: "test_task".to_string(),
                task_type: "ha_test".to_string(),
                state: TaskState::Pending,
                step: Step::INIT,
                concurrency: 4,
                owner: None,
                owner_epoch: 0,
                meta: serde_json::json!({}),
                error: None,
                created_at: now,
                start_time: None,
                end_time: None,
                state_update_time: now,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.task.key = key.to_string();
        self
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.task.step = step;
        self
    }

    pub fn with_concurrency(mut self, concurrency: i32) -> Self {
        self.task.concurrency = concurrency;
        self
    }

    pub fn with_owner(mut self, owner: &str, epoch: i64) -> Self {
        self.task.owner = Some(owner.to_string());
        self.task.owner_epoch = epoch;
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.task.meta = meta;
        self
    }

    pub fn running(self) -> Self {
        self.with_state(TaskState::Running).with_step(Step::ONE)
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 构造 `Subtask`
pub struct SubtaskBuilder {
    subtask: Subtask,
}

impl SubtaskBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            subtask: Subtask {
                id: 1,
                task_id: 1,
                step: Step::ONE,
                ordinal: 0,
                exec_id: None,
                state: SubtaskState::Pending,
                claim_token: 0,
                retry_count: 0,
                meta: serde_json::json!({}),
                summary: None,
                row_count: 0,
                error: None,
                create_time: now,
                start_time: None,
                update_time: now,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.subtask.id = id;
        self
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.subtask.task_id = task_id;
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.subtask.step = step;
        self
    }

    pub fn with_ordinal(mut self, ordinal: i32) -> Self {
        self.subtask.ordinal = ordinal;
        self
    }

    pub fn with_state(mut self, state: SubtaskState) -> Self {
        self.subtask.state = state;
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.subtask.retry_count = retry_count;
        self
    }

    /// 已被 `exec_id` 认领并处于运行中
    pub fn running_on(mut self, exec_id: &str, claim_token: i64) -> Self {
        let now = Utc::now();
        self.subtask.state = SubtaskState::Running;
        self.subtask.exec_id = Some(exec_id.to_string());
        self.subtask.claim_token = claim_token;
        self.subtask.start_time = Some(now);
        self.subtask.update_time = now;
        self
    }

    pub fn started_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.subtask.start_time = Some(start_time);
        self
    }

    pub fn build(self) -> Subtask {
        self.subtask
    }
}

impl Default for SubtaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 构造 `NodeInfo`
pub struct NodeInfoBuilder {
    node: NodeInfo,
}

impl NodeInfoBuilder {
    pub fn new(exec_id: &str) -> Self {
        let now = Utc::now();
        Self {
            node: NodeInfo {
                exec_id: exec_id.to_string(),
                epoch: 1,
                can_be_owner: true,
                last_heartbeat: now,
                registered_at: now,
            },
        }
    }

    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.node.epoch = epoch;
        self
    }

    pub fn with_last_heartbeat(mut self, last_heartbeat: DateTime<Utc>) -> Self {
        self.node.last_heartbeat = last_heartbeat;
        self
    }

    pub fn executor_only(mut self) -> Self {
        self.node.can_be_owner = false;
        self
    }

    pub fn build(self) -> NodeInfo {
        self.node
    }
}
