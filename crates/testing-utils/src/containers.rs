//! RabbitMQ test container
//!
//! 需要本地Docker，使用它的测试默认标记为 `#[ignore]`。

use anyhow::Result;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::rabbitmq::RabbitMq;
use tokio::time::{sleep, Duration};

use cuniculus_core::{AppConfig, RabbitMqConfig};

pub struct RabbitMqTestContainer {
    #[allow(dead_code)]
    container: ContainerAsync<RabbitMq>,
    pub port: u16,
}

impl RabbitMqTestContainer {
    pub async fn new() -> Result<Self> {
        let container = RabbitMq::default()
            .with_tag("3.12-management-alpine")
            .start()
            .await?;
        let port = container.get_host_port_ipv4(5672).await?;

        // 等待broker完成启动
        sleep(Duration::from_secs(2)).await;

        Ok(Self { container, port })
    }

    pub fn rabbitmq_config(&self) -> RabbitMqConfig {
        RabbitMqConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            ..Default::default()
        }
    }

    /// 指向容器、关闭默认队列的配置
    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            rabbitmq: self.rabbitmq_config(),
            default_queue: false,
            ..Default::default()
        }
    }
}
