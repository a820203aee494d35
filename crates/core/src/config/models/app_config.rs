use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    node_scheduler::{NodeConfig, SchedulerConfig},
    observability::ObservabilityConfig,
    store::StoreConfig,
};

/// 节点配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub node: NodeConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件（TOML）
    /// 3. 环境变量覆盖（前缀 `DISTTASK_`，层级分隔符 `__`，如 `DISTTASK_NODE__EXEC_ID`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/disttask.toml", "disttask.toml", "/etc/disttask/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("DISTTASK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate().context("存储配置验证失败")?;
        self.node.validate().context("节点配置验证失败")?;
        self.scheduler.validate().context("调度配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        // 至少能容忍一次心跳丢失
        if self.scheduler.dead_node_timeout_ms <= self.node.heartbeat_interval_ms * 2 {
            return Err(anyhow::anyhow!(
                "节点失效超时 {}ms 必须大于两倍心跳间隔 {}ms",
                self.scheduler.dead_node_timeout_ms,
                self.node.heartbeat_interval_ms
            ));
        }

        Ok(())
    }
}
