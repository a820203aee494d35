use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 节点注册信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub exec_id: String,
    /// 注册时分配，节点记录被移除后重新注册会得到更大的 epoch
    pub epoch: i64,
    pub can_be_owner: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl NodeInfo {
    /// 心跳是否已超时
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let timeout = Duration::from_std(timeout).unwrap_or(Duration::MAX);
        now - self.last_heartbeat > timeout
    }
}
