use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::{
    observability::{HealthCheckConfig, ObservabilityConfig},
    publisher::PublisherConfig,
    queue::QueueSpec,
    rabbitmq::RabbitMqConfig,
};
use crate::constants::{DEFAULT_DEAD_QUEUE_TTL_MS, DEFAULT_QUEUE_NAME};
use cuniculus_errors::{CuniculusError, CuniculusResult};

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub rabbitmq: RabbitMqConfig,
    pub publisher: PublisherConfig,
    pub queues: Vec<QueueSpec>,
    /// 为true时 `cun_default` 自动加入队列集合
    pub default_queue: bool,
    pub dead_queue_ttl_ms: u64,
    pub health_check: HealthCheckConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rabbitmq: RabbitMqConfig::default(),
            publisher: PublisherConfig::default(),
            queues: Vec::new(),
            default_queue: true,
            dead_queue_ttl_ms: DEFAULT_DEAD_QUEUE_TTL_MS,
            health_check: HealthCheckConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: CUNICULUS_, nesting: `__`)
    pub fn load(config_path: Option<&str>) -> CuniculusResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(CuniculusError::config_error(format!(
                    "配置文件不存在: {path}"
                )));
            }
        } else {
            let default_paths = ["config/cuniculus.toml", "cuniculus.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CUNICULUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| CuniculusError::config_error(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| CuniculusError::config_error(format!("反序列化配置失败: {e}")))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> CuniculusResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| CuniculusError::config_error(format!("解析TOML配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> CuniculusResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CuniculusError::config_error(format!("序列化配置为TOML失败: {e}")))
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> CuniculusResult<()> {
        self.rabbitmq.validate()?;
        self.publisher.validate()?;
        self.health_check.validate()?;
        self.observability.validate()?;

        let mut seen = HashSet::new();
        for spec in &self.queues {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(CuniculusError::config_error(format!(
                    "队列名称重复: {}",
                    spec.name
                )));
            }
        }

        if self.dead_queue_ttl_ms == 0 {
            return Err(CuniculusError::config_error("死信队列TTL必须大于0"));
        }

        Ok(())
    }

    /// 实际需要声明和消费的队列集合
    pub fn effective_queues(&self) -> Vec<QueueSpec> {
        let mut queues = self.queues.clone();
        if self.default_queue && !queues.iter().any(|q| q.name == DEFAULT_QUEUE_NAME) {
            queues.push(QueueSpec::default());
        }
        queues
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.effective_queues().into_iter().find(|q| q.name == name)
    }
}
