use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use metrics::gauge;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use disttask_core::{
    config::SchedulerConfig, traits::TaskStore, LivenessGuard, SchedulerResult, TaskTypeRegistry,
};

use crate::owner::OwnerArbiter;
use crate::scheduler::{SchedulerExit, SchedulerHooks, TaskScheduler};

struct RunningScheduler {
    epoch: i64,
    handle: JoinHandle<SchedulerExit>,
}

/// 调度器管理器
///
/// 在可担任 owner 的节点上周期性扫描活跃任务，认领无主或 owner 失效的任务，
/// 并为每个认领成功的任务启动一个 `TaskScheduler`。仅执行子任务的节点上不认领任何任务。
pub struct SchedulerManager {
    can_be_owner: bool,
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    config: SchedulerConfig,
    liveness: LivenessGuard,
    hooks: SchedulerHooks,
    arbiter: OwnerArbiter,
    schedulers: Mutex<HashMap<i64, RunningScheduler>>,
    stop_tx: broadcast::Sender<()>,
    running: Arc<RwLock<bool>>,
}

impl SchedulerManager {
    pub fn new(
        exec_id: impl Into<String>,
        can_be_owner: bool,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        config: SchedulerConfig,
        liveness: LivenessGuard,
        hooks: SchedulerHooks,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            arbiter: OwnerArbiter::new(Arc::clone(&store), exec_id),
            can_be_owner,
            store,
            registry,
            config,
            liveness,
            hooks,
            schedulers: Mutex::new(HashMap::new()),
            stop_tx,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 按检查间隔循环，直到 `stop` 或收到关闭信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("节点 {} 的调度器管理器启动", self.arbiter.exec_id());
        *self.running.write().await = true;

        loop {
            if !*self.running.read().await {
                break;
            }
            match self.tick().await {
                Ok(claimed) if claimed > 0 => debug!("本轮认领了 {} 个任务", claimed),
                Ok(_) => {}
                Err(e) => warn!("调度器管理器本轮扫描失败: {}", e),
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.config.check_interval()) => {}
            }
        }
        info!("节点 {} 的调度器管理器退出", self.arbiter.exec_id());
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// 扫描一轮，返回新认领的任务数
    pub async fn tick(&self) -> SchedulerResult<usize> {
        self.reap_finished().await;

        if !self.liveness.is_live() {
            let stopped = self.abort_all().await;
            if stopped > 0 {
                warn!("节点已失去存活资格，停止了 {} 个调度器", stopped);
            }
            return Ok(0);
        }

        if !self.can_be_owner {
            return Ok(0);
        }

        let candidates: HashSet<String> = OwnerArbiter::owner_candidates(
            &self.store.list_nodes().await?,
            self.config.dead_node_timeout(),
            Utc::now(),
        );
        let tasks = self.store.list_active_tasks().await?;

        let mut claimed = 0;
        let mut schedulers = self.schedulers.lock().await;
        for task in tasks {
            if schedulers.len() >= self.config.max_running_schedulers {
                debug!("调度器数量已达上限 {}", self.config.max_running_schedulers);
                break;
            }
            let has_local = schedulers.contains_key(&task.id);
            let owned = match self.arbiter.try_claim(&task, &candidates, has_local).await {
                Ok(Some(owned)) => owned,
                Ok(None) => continue,
                Err(e) => {
                    warn!("认领任务 {} 失败: {}", task.key, e);
                    continue;
                }
            };

            let scheduler = TaskScheduler::new(
                &owned,
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.config.clone(),
                self.hooks.clone(),
            );
            let epoch = scheduler.epoch();
            let handle = tokio::spawn(scheduler.run(self.stop_tx.subscribe()));
            if let Some(previous) = schedulers.insert(owned.id, RunningScheduler { epoch, handle }) {
                previous.handle.abort();
            }
            claimed += 1;
        }
        gauge!("disttask_running_schedulers").set(schedulers.len() as f64);
        Ok(claimed)
    }

    /// 回收已退出的调度器
    async fn reap_finished(&self) {
        let mut schedulers = self.schedulers.lock().await;
        let finished: Vec<i64> = schedulers
            .iter()
            .filter(|(_, s)| s.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for task_id in finished {
            if let Some(scheduler) = schedulers.remove(&task_id) {
                match scheduler.handle.await {
                    Ok(exit) => debug!("任务 {} 的调度器已回收: {:?}", task_id, exit),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!("任务 {} 的调度器异常退出: {}", task_id, e),
                }
            }
        }
    }

    pub async fn running_task_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.schedulers.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// 优雅停止：通知所有调度器退出，并释放仍持有的 owner 身份
    pub async fn release_all(&self) -> usize {
        self.stop().await;
        let _ = self.stop_tx.send(());

        let drained: Vec<(i64, RunningScheduler)> = self.schedulers.lock().await.drain().collect();
        let mut released = 0;
        for (task_id, scheduler) in drained {
            let _ = scheduler.handle.await;
            match self
                .store
                .release_task_owner(task_id, self.arbiter.exec_id(), scheduler.epoch)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!("释放任务 {} 的 owner 身份失败: {}", task_id, e),
            }
        }
        if released > 0 {
            info!("节点 {} 释放了 {} 个任务的 owner 身份", self.arbiter.exec_id(), released);
        }
        released
    }

    /// 立即终止所有调度器，不做任何存储写入
    pub async fn abort_all(&self) -> usize {
        let drained: Vec<(i64, RunningScheduler)> = self.schedulers.lock().await.drain().collect();
        for (_, scheduler) in &drained {
            scheduler.handle.abort();
        }
        drained.len()
    }
}
