//! 配置模型与加载
//!
//! 配置在启动时构造一次，之后以 `Arc<AppConfig>` 或引用的形式显式传给
//! Dispatcher、Supervisor 和 Consumer，不存在进程级的全局配置。
//!
//! 加载顺序：
//! 1. 结构体默认值
//! 2. TOML配置文件
//! 3. 环境变量覆盖（前缀 `CUNICULUS_`，层级分隔符 `__`，例如
//!    `CUNICULUS_PUBLISHER__POOL_SIZE=3`）

pub mod models;

pub use models::{
    AppConfig, HealthCheckConfig, ObservabilityConfig, PublisherConfig, QueueSpec,
    RabbitMqConfig, ReconnectAttempts,
};
