use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use cuniculus_core::{AppConfig, Connector, JobRegistry};
use cuniculus_infrastructure::{declare_configuration, AmqpConnector, Dispatcher, Producer};
use cuniculus_worker::{LoggingErrorReporter, Supervisor};

use crate::shutdown::ShutdownManager;

/// 主应用程序
///
/// 持有配置和broker连接器，分别提供拓扑声明、提交任务和消费三种运行方式。
pub struct Application {
    config: AppConfig,
    connector: Arc<dyn Connector>,
}

impl Application {
    /// 使用RabbitMQ连接器创建应用
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate().context("配置校验失败")?;
        let connector = Arc::new(AmqpConnector::new(&config.rabbitmq));
        Ok(Self::with_connector(config, connector))
    }

    pub fn with_connector(config: AppConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 声明交换机、死信队列和配置中的全部队列
    pub async fn declare(&self) -> Result<()> {
        info!(
            "声明队列拓扑，broker: {}",
            self.config.rabbitmq.display_address()
        );
        declare_configuration(self.connector.as_ref(), &self.config)
            .await
            .context("声明队列拓扑失败")?;

        let queues: Vec<String> = self
            .config
            .effective_queues()
            .into_iter()
            .map(|q| q.name)
            .collect();
        info!("队列拓扑声明完成: {}", queues.join(", "));
        Ok(())
    }

    /// 提交一个任务，等待出站队列排空后返回
    pub async fn enqueue(&self, queue: &str, class: &str, args: Vec<Value>) -> Result<()> {
        let dispatcher = Dispatcher::new(self.config.publisher.clone(), self.connector.clone());
        let producer = Producer::new(dispatcher);

        producer
            .enqueue(queue, class, args)
            .with_context(|| format!("提交任务 {class} 到队列 {queue} 失败"))?;
        producer.shutdown().await;

        let pending = producer.dispatcher().outbound().len();
        if pending > 0 {
            anyhow::bail!("关闭前仍有 {pending} 个任务未能发布");
        }

        info!("任务 {} 已发布到队列 {}", class, queue);
        Ok(())
    }

    /// 启动Supervisor消费任务，直到收到关闭信号
    pub async fn consume(&self, registry: JobRegistry, shutdown: ShutdownManager) -> Result<()> {
        info!("可处理的任务类型: {}", registry.classes().join(", "));

        let supervisor = Supervisor::new(
            self.config.clone(),
            self.connector.clone(),
            Arc::new(registry),
            Arc::new(LoggingErrorReporter),
        )
        .await
        .context("创建Supervisor失败")?;
        supervisor.start().await.context("启动Supervisor失败")?;

        shutdown.wait_for_shutdown().await;
        info!("Supervisor收到关闭信号");

        supervisor.stop().await;
        Ok(())
    }
}

/// 内置任务处理器：`Log` 记录收到的参数
pub fn builtin_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register_fn("Log", |args: Vec<Value>| async move {
        let args = Value::Array(args);
        info!(args = %args, "Log任务执行");
        Ok::<(), anyhow::Error>(())
    });
    registry
}

/// 解析命令行中的任务参数
///
/// JSON数组按参数列表处理，其他JSON值作为唯一参数；未给出时参数为空。
pub fn parse_args(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("任务参数不是有效的JSON: {raw}"))?;
    Ok(match value {
        Value::Array(args) => args,
        other => vec![other],
    })
}
