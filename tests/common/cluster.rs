//! 多节点集群测试工具
//!
//! 所有节点共享一个内存存储与同一组 `ha_test` 任务类型实例。节点可以被优雅停止、
//! 直接杀死，或在子任务开始执行、步骤子任务创建时按测试设定的策略被异步杀死。

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use disttask_application::{Node, NodeHooks};
use disttask_core::{
    models::{NewTask, Step, Subtask, Task},
    traits::TaskStore,
    AppConfig, SchedulerResult, TaskTypeRegistry,
};
use disttask_dispatcher::{SchedulerHooks, StepSubtasksCreatedHook, TaskControlService};
use disttask_testing_utils::{
    fast_test_config, ha_test_registry, init_test_logging, HaTestExtension, RecordingStepExecutor,
    TestEnv, HA_TEST_TASK_TYPE,
};
use disttask_worker::BeforeSubtaskRunHook;

/// 子任务开始执行前调用，返回 `true` 时杀死当前节点
pub type SubtaskKillPolicy = Arc<dyn Fn(&str, &Task, &Subtask) -> bool + Send + Sync>;

/// 步骤子任务创建后调用，返回 `true` 时杀死该任务的 owner
pub type StepKillPolicy = Arc<dyn Fn(&Task, Step, usize) -> bool + Send + Sync>;

#[derive(Default)]
struct KillPolicies {
    subtask: Option<SubtaskKillPolicy>,
    step: Option<StepKillPolicy>,
}

struct ClusterNodes {
    live: Vec<Arc<Node>>,
    killed: Vec<String>,
    next_index: usize,
}

pub struct TestCluster {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    extension: Arc<HaTestExtension>,
    executor: Arc<RecordingStepExecutor>,
    config: AppConfig,
    nodes: Arc<Mutex<ClusterNodes>>,
    policies: Arc<StdMutex<KillPolicies>>,
    kill_tx: mpsc::UnboundedSender<String>,
    reaper: JoinHandle<()>,
}

impl TestCluster {
    pub async fn start(
        node_count: usize,
        extension: HaTestExtension,
        executor: RecordingStepExecutor,
    ) -> Self {
        Self::start_with_config(node_count, extension, executor, fast_test_config()).await
    }

    pub async fn start_with_config(
        node_count: usize,
        extension: HaTestExtension,
        executor: RecordingStepExecutor,
        config: AppConfig,
    ) -> Self {
        init_test_logging();
        let extension = Arc::new(extension);
        let executor = Arc::new(executor);
        let registry = Arc::new(ha_test_registry(Arc::clone(&extension), Arc::clone(&executor)));
        let nodes = Arc::new(Mutex::new(ClusterNodes {
            live: Vec::new(),
            killed: Vec::new(),
            next_index: 0,
        }));

        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<String>();
        let reaper = {
            let nodes = Arc::clone(&nodes);
            tokio::spawn(async move {
                while let Some(exec_id) = kill_rx.recv().await {
                    kill_node(&nodes, &exec_id).await;
                }
            })
        };

        let cluster = Self {
            store: TestEnv::memory_store(),
            registry,
            extension,
            executor,
            config,
            nodes,
            policies: Arc::new(StdMutex::new(KillPolicies::default())),
            kill_tx,
            reaper,
        };
        cluster.scale_out(node_count).await;
        cluster
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn extension(&self) -> &Arc<HaTestExtension> {
        &self.extension
    }

    pub fn executor(&self) -> &Arc<RecordingStepExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 新增并启动 `count` 个节点，返回它们的 exec_id
    pub async fn scale_out(&self, count: usize) -> Vec<String> {
        let mut added = Vec::new();
        for _ in 0..count {
            let exec_id = {
                let mut nodes = self.nodes.lock().await;
                nodes.next_index += 1;
                format!("node-{}", nodes.next_index)
            };
            let mut config = self.config.clone();
            config.node.exec_id = exec_id.clone();

            let node = Arc::new(Node::new(
                config,
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.node_hooks(),
            ));
            node.start().await.unwrap();
            self.nodes.lock().await.live.push(node);
            added.push(exec_id);
        }
        info!("集群扩容 {:?}", added);
        added
    }

    fn node_hooks(&self) -> NodeHooks {
        let subtask_hook: BeforeSubtaskRunHook = {
            let policies = Arc::clone(&self.policies);
            let kill_tx = self.kill_tx.clone();
            Arc::new(move |exec_id: &str, task: &Task, subtask: &Subtask| {
                let policy = lock_policies(&policies).subtask.clone();
                if policy.is_some_and(|policy| policy(exec_id, task, subtask)) {
                    let _ = kill_tx.send(exec_id.to_string());
                }
            })
        };
        let step_hook: StepSubtasksCreatedHook = {
            let policies = Arc::clone(&self.policies);
            let kill_tx = self.kill_tx.clone();
            Arc::new(move |task: &Task, step: Step, count: usize| {
                let policy = lock_policies(&policies).step.clone();
                if let (Some(policy), Some(owner)) = (policy, task.owner.as_ref()) {
                    if policy(task, step, count) {
                        let _ = kill_tx.send(owner.clone());
                    }
                }
            })
        };
        NodeHooks {
            before_subtask_run: Some(subtask_hook),
            scheduler: SchedulerHooks {
                on_step_subtasks_created: Some(step_hook),
            },
        }
    }

    pub fn set_subtask_kill_policy(
        &self,
        policy: impl Fn(&str, &Task, &Subtask) -> bool + Send + Sync + 'static,
    ) {
        lock_policies(&self.policies).subtask = Some(Arc::new(policy));
    }

    pub fn set_step_kill_policy(
        &self,
        policy: impl Fn(&Task, Step, usize) -> bool + Send + Sync + 'static,
    ) {
        lock_policies(&self.policies).step = Some(Arc::new(policy));
    }

    pub fn clear_kill_policies(&self) {
        *lock_policies(&self.policies) = KillPolicies::default();
    }

    pub async fn live_exec_ids(&self) -> Vec<String> {
        self.nodes
            .lock()
            .await
            .live
            .iter()
            .map(|node| node.exec_id().to_string())
            .collect()
    }

    pub async fn killed_exec_ids(&self) -> Vec<String> {
        self.nodes.lock().await.killed.clone()
    }

    /// 杀死指定节点；集群中至少保留一个节点
    pub async fn kill(&self, exec_id: &str) -> bool {
        kill_node(&self.nodes, exec_id).await
    }

    /// 随机杀死一个节点
    pub async fn kill_random(&self) -> Option<String> {
        let exec_id = {
            let nodes = self.nodes.lock().await;
            nodes
                .live
                .choose(&mut rand::rng())
                .map(|node| node.exec_id().to_string())?
        };
        self.kill(&exec_id).await.then_some(exec_id)
    }

    /// 优雅停止指定节点
    pub async fn stop(&self, exec_id: &str) -> bool {
        let node = {
            let mut nodes = self.nodes.lock().await;
            let Some(index) = nodes.live.iter().position(|n| n.exec_id() == exec_id) else {
                return false;
            };
            nodes.live.remove(index)
        };
        node.stop().await.unwrap();
        true
    }

    async fn any_node(&self) -> Arc<Node> {
        let nodes = self.nodes.lock().await;
        Arc::clone(nodes.live.first().expect("集群中没有存活节点"))
    }

    pub async fn submit(&self, key: &str, concurrency: i32) -> SchedulerResult<i64> {
        self.any_node()
            .await
            .task_service()
            .submit_task(NewTask::new(key, HA_TEST_TASK_TYPE, concurrency))
            .await
    }

    pub async fn cancel(&self, key: &str) -> SchedulerResult<bool> {
        self.any_node().await.task_service().cancel_task(key).await
    }

    pub async fn pause(&self, key: &str) -> SchedulerResult<bool> {
        self.any_node().await.task_service().pause_task(key).await
    }

    pub async fn resume(&self, key: &str) -> SchedulerResult<bool> {
        self.any_node().await.task_service().resume_task(key).await
    }

    pub async fn task(&self, key: &str) -> Task {
        self.store.get_task_by_key(key).await.unwrap()
    }

    pub async fn subtasks(&self, key: &str) -> Vec<Subtask> {
        let task = self.task(key).await;
        self.store.get_subtasks_by_task(task.id).await.unwrap()
    }

    /// 等待任务进入终态
    pub async fn wait_for_terminal(&self, key: &str, timeout: Duration) -> Task {
        let finished = TestEnv::wait_for(
            || async { self.task(key).await.is_terminal() },
            timeout,
        )
        .await;
        let task = self.task(key).await;
        assert!(finished, "任务 {key} 未在 {timeout:?} 内结束，当前状态 {}", task.state);
        task
    }

    pub async fn submit_and_wait(&self, key: &str, concurrency: i32, timeout: Duration) -> Task {
        self.submit(key, concurrency).await.unwrap();
        self.wait_for_terminal(key, timeout).await
    }

    /// 每个逻辑子任务只对应一条记录
    pub async fn assert_no_duplicate_subtasks(&self, key: &str) {
        let subtasks = self.subtasks(key).await;
        let mut seen = HashSet::new();
        for subtask in &subtasks {
            assert!(
                seen.insert((subtask.step, subtask.ordinal)),
                "任务 {key} 的步骤 {} 序号 {} 出现重复子任务",
                subtask.step,
                subtask.ordinal
            );
        }
    }

    /// 优雅停止所有存活节点
    pub async fn shutdown(self) {
        self.clear_kill_policies();
        self.reaper.abort();
        let live: Vec<Arc<Node>> = self.nodes.lock().await.live.drain(..).collect();
        for node in live {
            node.stop().await.unwrap();
        }
    }
}

fn lock_policies(policies: &StdMutex<KillPolicies>) -> std::sync::MutexGuard<'_, KillPolicies> {
    policies.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn kill_node(nodes: &Mutex<ClusterNodes>, exec_id: &str) -> bool {
    let node = {
        let mut nodes = nodes.lock().await;
        if nodes.live.len() <= 1 {
            return false;
        }
        let Some(index) = nodes.live.iter().position(|n| n.exec_id() == exec_id) else {
            return false;
        };
        nodes.killed.push(exec_id.to_string());
        nodes.live.remove(index)
    };
    node.kill().await;
    info!("节点 {} 已被杀死", exec_id);
    true
}
