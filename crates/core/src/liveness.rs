use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::warn;

struct LivenessState {
    epoch: AtomicI64,
    last_heartbeat_ms: AtomicI64,
    fenced: AtomicBool,
    fence_timeout: Duration,
    fence_events: watch::Sender<u64>,
}

/// 节点存活资格
///
/// 心跳管理器在每次心跳成功后刷新；调度与执行两侧在写入前检查 `is_live`。
/// 心跳被拒绝（epoch 不符）或连续失败超过 `fence_timeout` 时节点自我隔离，
/// 直到以新的 epoch 重新注册。
#[derive(Clone)]
pub struct LivenessGuard {
    state: Arc<LivenessState>,
}

impl LivenessGuard {
    /// 新建时处于隔离状态，注册成功后才可写入
    pub fn new(fence_timeout: Duration) -> Self {
        let (fence_events, _) = watch::channel(0);
        Self {
            state: Arc::new(LivenessState {
                epoch: AtomicI64::new(0),
                last_heartbeat_ms: AtomicI64::new(0),
                fenced: AtomicBool::new(true),
                fence_timeout,
                fence_events,
            }),
        }
    }

    pub fn mark_registered(&self, epoch: i64, heartbeat: DateTime<Utc>) {
        self.state.epoch.store(epoch, Ordering::SeqCst);
        self.state
            .last_heartbeat_ms
            .store(heartbeat.timestamp_millis(), Ordering::SeqCst);
        self.state.fenced.store(false, Ordering::SeqCst);
    }

    /// 记录写入存储的心跳时间（而非写入完成的时间）
    pub fn record_heartbeat(&self, heartbeat: DateTime<Utc>) {
        self.state
            .last_heartbeat_ms
            .fetch_max(heartbeat.timestamp_millis(), Ordering::SeqCst);
    }

    /// 进入隔离状态并通知订阅者
    pub fn fence(&self, reason: &str) {
        if !self.state.fenced.swap(true, Ordering::SeqCst) {
            warn!("节点进入自我隔离 (epoch {}): {}", self.epoch(), reason);
            self.state.fence_events.send_modify(|generation| *generation += 1);
        }
    }

    pub fn is_fenced(&self) -> bool {
        self.state.fenced.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(Utc::now())
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_fenced() {
            return false;
        }
        let elapsed_ms = now.timestamp_millis() - self.state.last_heartbeat_ms.load(Ordering::SeqCst);
        elapsed_ms < self.state.fence_timeout.as_millis() as i64
    }

    pub fn epoch(&self) -> i64 {
        self.state.epoch.load(Ordering::SeqCst)
    }

    /// 每次进入隔离时递增
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.fence_events.subscribe()
    }
}
