use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    models::Step,
    traits::{SchedulerExtension, StepExecutor},
    SchedulerError, SchedulerResult,
};

struct TaskTypeEntry {
    extension: Arc<dyn SchedulerExtension>,
    executors: HashMap<Step, Arc<dyn StepExecutor>>,
}

/// 任务类型注册表
///
/// 节点启动时构建，之后只读，通过 `Arc` 在调度器与执行器之间共享。
#[derive(Default)]
pub struct TaskTypeRegistry {
    types: HashMap<String, TaskTypeEntry>,
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任务类型的调度扩展以及各步骤的执行器，重复注册会覆盖
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        extension: Arc<dyn SchedulerExtension>,
        executors: Vec<(Step, Arc<dyn StepExecutor>)>,
    ) -> &mut Self {
        self.types.insert(
            task_type.into(),
            TaskTypeEntry {
                extension,
                executors: executors.into_iter().collect(),
            },
        );
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.types.contains_key(task_type)
    }

    pub fn extension(&self, task_type: &str) -> SchedulerResult<Arc<dyn SchedulerExtension>> {
        self.types
            .get(task_type)
            .map(|entry| Arc::clone(&entry.extension))
            .ok_or_else(|| SchedulerError::HandlerNotRegistered {
                task_type: task_type.to_string(),
            })
    }

    pub fn executor(&self, task_type: &str, step: Step) -> SchedulerResult<Arc<dyn StepExecutor>> {
        self.types
            .get(task_type)
            .and_then(|entry| entry.executors.get(&step))
            .map(Arc::clone)
            .ok_or_else(|| SchedulerError::HandlerNotRegistered {
                task_type: format!("{task_type}/{step}"),
            })
    }

    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.keys().cloned().collect();
        types.sort();
        types
    }
}
