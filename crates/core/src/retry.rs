use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::SchedulerResult;

/// 存储瞬时错误的重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 单次操作最多尝试次数
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 50,
            max_interval_ms: 2000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次重试前的等待时间（attempt 从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_interval_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_interval_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_interval_ms == 0 {
            return Err(anyhow::anyhow!("基础重试间隔必须大于0"));
        }
        if self.max_interval_ms < self.base_interval_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动范围必须在0.0到1.0之间"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("最大尝试次数必须大于0"));
        }
        Ok(())
    }
}

/// 执行存储操作，遇到瞬时错误按退避策略重试，其余错误直接返回
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts => {
                let delay = config.backoff(attempt);
                warn!(
                    "{} 遇到瞬时错误，{}ms 后第 {} 次重试: {}",
                    operation,
                    delay.as_millis(),
                    attempt + 1,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
