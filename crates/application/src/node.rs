use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use disttask_core::{
    models::CancelReason, traits::TaskStore, AppConfig, LivenessGuard, SchedulerResult,
    TaskTypeRegistry,
};
use disttask_dispatcher::{
    NodeFailureDetector, NodeFailureDetectorConfig, NodeFailureDetectorService, ReassignmentService,
    SchedulerHooks, SchedulerManager, SubtaskReassigner, TaskService,
};
use disttask_infrastructure::create_task_store;
use disttask_worker::{BeforeSubtaskRunHook, HeartbeatManager, SubtaskExecutionManager, TaskManager};

/// 注入到节点各组件的回调
#[derive(Clone, Default)]
pub struct NodeHooks {
    /// 子任务开始执行前调用
    pub before_subtask_run: Option<BeforeSubtaskRunHook>,
    pub scheduler: SchedulerHooks,
}

/// 运行中的后台循环
struct NodeLoops {
    shutdown_tx: broadcast::Sender<()>,
    heartbeat_tx: broadcast::Sender<()>,
    heartbeat: JoinHandle<()>,
    task_manager: JoinHandle<()>,
    scheduler_manager: JoinHandle<()>,
    detector: JoinHandle<()>,
}

/// 一个框架节点
///
/// 每个节点同时承担执行（心跳、子任务认领与执行）与调度（owner 认领、步骤推进、失效检测）两类职责，
/// `can_be_owner = false` 的节点只执行子任务。
pub struct Node {
    exec_id: String,
    config: AppConfig,
    store: Arc<dyn TaskStore>,
    liveness: LivenessGuard,
    heartbeat: Arc<HeartbeatManager>,
    task_manager: Arc<TaskManager>,
    scheduler_manager: Arc<SchedulerManager>,
    detector: Arc<NodeFailureDetector>,
    task_service: Arc<TaskService>,
    loops: Mutex<Option<NodeLoops>>,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl Node {
    /// 按配置创建存储后组装节点
    pub async fn from_config(
        config: AppConfig,
        registry: Arc<TaskTypeRegistry>,
        hooks: NodeHooks,
    ) -> SchedulerResult<Self> {
        let store = create_task_store(&config.store).await?;
        Ok(Self::new(config, store, registry, hooks))
    }

    /// 使用已有的存储组装节点，集群内的节点共享同一个存储
    pub fn new(
        config: AppConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        hooks: NodeHooks,
    ) -> Self {
        let exec_id = config.node.resolve_exec_id();
        let liveness = LivenessGuard::new(config.scheduler.dead_node_timeout());

        let heartbeat = Arc::new(HeartbeatManager::new(
            exec_id.clone(),
            config.node.can_be_owner,
            Arc::clone(&store),
            liveness.clone(),
            config.node.heartbeat_interval(),
        ));

        let execution = Arc::new(SubtaskExecutionManager::new(
            exec_id.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
            liveness.clone(),
            config.scheduler.retry.clone(),
            config.node.max_concurrent_subtasks,
            config.node.poll_interval(),
            hooks.before_subtask_run.clone(),
        ));
        let task_manager = Arc::new(TaskManager::new(
            exec_id.clone(),
            Arc::clone(&store),
            execution,
            liveness.clone(),
            config.node.poll_interval(),
        ));

        let scheduler_manager = Arc::new(SchedulerManager::new(
            exec_id.clone(),
            config.node.can_be_owner,
            Arc::clone(&store),
            Arc::clone(&registry),
            config.scheduler.clone(),
            liveness.clone(),
            hooks.scheduler.clone(),
        ));

        let reassigner: Arc<dyn ReassignmentService> = Arc::new(SubtaskReassigner::new(
            Arc::clone(&store),
            config.scheduler.max_subtask_retries,
            config.scheduler.retry.clone(),
        ));
        let detector = Arc::new(NodeFailureDetector::new(
            exec_id.clone(),
            Arc::clone(&store),
            reassigner,
            liveness.clone(),
            Some(NodeFailureDetectorConfig::from(&config.scheduler)),
        ));

        let task_service = Arc::new(TaskService::new(Arc::clone(&store), registry));

        Self {
            exec_id,
            config,
            store,
            liveness,
            heartbeat,
            task_manager,
            scheduler_manager,
            detector,
            task_service,
            loops: Mutex::new(None),
            aborts: Mutex::new(Vec::new()),
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn liveness(&self) -> &LivenessGuard {
        &self.liveness
    }

    pub fn task_service(&self) -> Arc<TaskService> {
        Arc::clone(&self.task_service)
    }

    pub async fn is_running(&self) -> bool {
        self.loops.lock().await.is_some()
    }

    /// 本节点正在调度的任务
    pub async fn scheduled_task_ids(&self) -> Vec<i64> {
        self.scheduler_manager.running_task_ids().await
    }

    /// 注册节点并启动所有后台循环，重复调用无效果
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            return Ok(());
        }

        self.heartbeat.register().await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let (heartbeat_tx, _) = broadcast::channel(1);

        let heartbeat = {
            let manager = Arc::clone(&self.heartbeat);
            let shutdown = heartbeat_tx.subscribe();
            tokio::spawn(async move { manager.run(shutdown).await })
        };
        let task_manager = {
            let manager = Arc::clone(&self.task_manager);
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { manager.run(shutdown).await })
        };
        let scheduler_manager = {
            let manager = Arc::clone(&self.scheduler_manager);
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { manager.run(shutdown).await })
        };
        let detector = {
            let detector = Arc::clone(&self.detector);
            tokio::spawn(async move {
                if let Err(e) = detector.start_detection().await {
                    error!("节点失效检测异常退出: {}", e);
                }
            })
        };

        *self.aborts.lock().await = vec![
            heartbeat.abort_handle(),
            task_manager.abort_handle(),
            scheduler_manager.abort_handle(),
            detector.abort_handle(),
        ];
        *loops = Some(NodeLoops {
            shutdown_tx,
            heartbeat_tx,
            heartbeat,
            task_manager,
            scheduler_manager,
            detector,
        });
        info!(
            "节点 {} 已启动 (可担任 owner: {})",
            self.exec_id, self.config.node.can_be_owner
        );
        Ok(())
    }

    /// 优雅退出
    ///
    /// 停止认领新的子任务与任务，把本节点正在运行的子任务释放回 Pending（不计重试），
    /// 释放持有的 owner 身份，最后注销节点。
    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(loops) = self.loops.lock().await.take() else {
            return Ok(());
        };
        info!("节点 {} 开始优雅退出", self.exec_id);

        let _ = loops.shutdown_tx.send(());
        if let Err(e) = self.detector.stop_detection().await {
            warn!("停止节点失效检测失败: {}", e);
        }
        loops.detector.abort();
        let _ = loops.task_manager.await;
        let _ = loops.scheduler_manager.await;

        let released = self.scheduler_manager.release_all().await;

        let execution = self.task_manager.execution();
        let aborted = execution.abort_all(CancelReason::Shutdown).await;
        if !execution.wait_idle(self.config.scheduler.dead_node_timeout()).await {
            warn!("节点 {} 的子任务未能在时限内退出，强制终止", self.exec_id);
            execution.kill_all().await;
        }
        info!(
            "节点 {} 释放了 {} 个任务的 owner 身份与 {} 个运行中的子任务",
            self.exec_id, released, aborted
        );

        let _ = loops.heartbeat_tx.send(());
        let _ = loops.heartbeat.await;
        self.aborts.lock().await.clear();
        self.heartbeat.deregister().await?;
        info!("节点 {} 已退出", self.exec_id);
        Ok(())
    }

    /// 模拟进程崩溃：立即隔离并终止所有循环与子任务，不做任何存储写入
    ///
    /// 节点记录留在存储中，由其他节点的失效检测在心跳超时后回收。
    pub async fn kill(&self) {
        // 优雅退出进行到一半时 loops 已被取走，仍需终止剩余的循环
        self.loops.lock().await.take();
        let aborts = std::mem::take(&mut *self.aborts.lock().await);
        if aborts.is_empty() {
            return;
        }
        self.liveness.fence("节点被强制终止");

        for handle in aborts {
            handle.abort();
        }
        self.scheduler_manager.abort_all().await;
        self.task_manager.execution().kill_all().await;
        warn!("节点 {} 已被强制终止", self.exec_id);
    }
}
