use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    models::{CancelReason, Task},
    SchedulerError, SchedulerResult,
};

/// 子任务运行上下文
///
/// 执行器通过 `checkpoint` 在安全点检查中止信号，通过 `report_rows` 汇报进度。
#[derive(Clone)]
pub struct SubtaskContext {
    pub task: Task,
    pub exec_id: String,
    abort_rx: watch::Receiver<Option<CancelReason>>,
    row_count: Arc<AtomicI64>,
}

impl SubtaskContext {
    pub fn new(task: Task, exec_id: String, abort_rx: watch::Receiver<Option<CancelReason>>) -> Self {
        Self {
            task,
            exec_id,
            abort_rx,
            row_count: Arc::new(AtomicI64::new(0)),
        }
    }

    /// 不会被中止的上下文，用于单独测试执行器
    pub fn detached(task: Task, exec_id: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(None);
        Self::new(task, exec_id.into(), rx)
    }

    /// 已收到中止信号时返回 `Cancelled`
    pub fn checkpoint(&self) -> SchedulerResult<()> {
        match *self.abort_rx.borrow() {
            Some(reason) => Err(SchedulerError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    pub fn abort_reason(&self) -> Option<CancelReason> {
        *self.abort_rx.borrow()
    }

    /// 等待中止信号
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.abort_rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    pub fn report_rows(&self, rows: i64) {
        self.row_count.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn row_count(&self) -> i64 {
        self.row_count.load(Ordering::Relaxed)
    }
}
