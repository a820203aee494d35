use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use disttask_application::Node;

/// 进程级关闭信号
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
        }
    }

    /// 订阅关闭信号；已关闭时返回的接收器会立即收到信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        match &*self.shutdown_tx.read().await {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                let _ = tx.send(());
                rx
            }
        }
    }

    /// 触发关闭，重复调用无效果
    pub async fn shutdown(&self) {
        let Some(tx) = self.shutdown_tx.write().await.take() else {
            debug!("关闭信号已经发送过");
            return;
        };
        debug!("发送关闭信号给 {} 个订阅者", tx.receiver_count());
        let _ = tx.send(());
        info!("关闭信号已发送");
    }

    pub async fn is_shutdown(&self) -> bool {
        self.shutdown_tx.read().await.is_none()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}

/// 收到关闭信号后优雅停止节点，超过 `grace_period` 时改为强制终止
pub async fn stop_node_on_shutdown(
    node: &Node,
    mut shutdown: broadcast::Receiver<()>,
    grace_period: Duration,
) {
    let _ = shutdown.recv().await;
    info!("节点 {} 收到关闭信号，开始优雅退出", node.exec_id());

    match tokio::time::timeout(grace_period, node.stop()).await {
        Ok(Ok(())) => info!("节点 {} 已优雅退出", node.exec_id()),
        Ok(Err(e)) => error!("节点 {} 优雅退出失败: {}", node.exec_id(), e),
        Err(_) => {
            warn!(
                "节点 {} 优雅退出超时（{}秒），强制终止",
                node.exec_id(),
                grace_period.as_secs()
            );
            node.kill().await;
        }
    }
}
