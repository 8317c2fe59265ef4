use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cuniculus_core::{AppConfig, BrokerChannel, BrokerConnection, Connector, JobRegistry, QueueSpec};
use cuniculus_errors::{CuniculusError, CuniculusResult};

use crate::consumer::{Consumer, ConsumerEvent};
use crate::error_reporter::{ErrorReporter, LoggingErrorReporter};
use crate::health_check::{prometheus_handle, HealthCheckServer};

struct SupervisorInner {
    config: AppConfig,
    connection: Arc<dyn BrokerConnection>,
    registry: Arc<JobRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    consumers: Mutex<HashMap<String, Consumer>>,
    done: AtomicBool,
    replacements: AtomicUsize,
    events: mpsc::UnboundedSender<ConsumerEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<ConsumerEvent>>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
    health_check: Mutex<Option<HealthCheckServer>>,
}

/// 消费者监管
///
/// 为配置中的每个队列在独立通道上创建一个Consumer。Consumer的订阅异常终止时，
/// 在未关闭的情况下用新的Consumer替换它。
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// 连接broker并为每个队列声明拓扑、创建Consumer
    ///
    /// 队列声明冲突等错误直接返回，不重试。
    pub async fn new(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<JobRegistry>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> CuniculusResult<Self> {
        config.validate()?;
        let connection = connector.connect().await?;
        let (events, event_rx) = mpsc::unbounded_channel();

        let mut consumers = HashMap::new();
        for spec in config.effective_queues() {
            let channel = open_channel(connection.as_ref(), &spec).await?;
            let consumer = Consumer::new(
                channel,
                &spec,
                config.dead_queue_ttl_ms,
                registry.clone(),
                reporter.clone(),
                events.clone(),
            )
            .await?;
            consumers.insert(spec.name.clone(), consumer);
        }

        info!("Supervisor 已创建 {} 个Consumer", consumers.len());

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                config,
                connection,
                registry,
                reporter,
                consumers: Mutex::new(consumers),
                done: AtomicBool::new(false),
                replacements: AtomicUsize::new(0),
                events,
                event_rx: StdMutex::new(Some(event_rx)),
                monitor: StdMutex::new(None),
                health_check: Mutex::new(None),
            }),
        })
    }

    /// 使用默认的日志错误上报
    pub async fn with_default_reporter(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<JobRegistry>,
    ) -> CuniculusResult<Self> {
        Self::new(config, connector, registry, Arc::new(LoggingErrorReporter)).await
    }

    /// 启动健康检查（如已启用）和全部Consumer
    pub async fn start(&self) -> CuniculusResult<()> {
        let event_rx = self
            .inner
            .event_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take());
        let Some(event_rx) = event_rx else {
            warn!("Supervisor 已经启动过");
            return Ok(());
        };

        if self.inner.config.health_check.enabled {
            let server =
                HealthCheckServer::start(&self.inner.config.health_check, prometheus_handle())
                    .await?;
            *self.inner.health_check.lock().await = Some(server);
        }

        {
            let consumers = self.inner.consumers.lock().await;
            for consumer in consumers.values() {
                consumer.start().await?;
            }
        }

        let supervisor = self.clone();
        let monitor = tokio::spawn(async move {
            supervisor.monitor(event_rx).await;
        });
        if let Ok(mut slot) = self.inner.monitor.lock() {
            *slot = Some(monitor);
        }

        info!("Supervisor 已启动");
        Ok(())
    }

    /// 标记关闭，停止全部Consumer、健康检查并关闭连接
    pub async fn stop(&self) {
        self.inner.done.store(true, Ordering::SeqCst);

        let consumers: Vec<Consumer> = {
            let mut consumers = self.inner.consumers.lock().await;
            consumers.drain().map(|(_, consumer)| consumer).collect()
        };
        for consumer in &consumers {
            consumer.stop().await;
        }

        let monitor = self.inner.monitor.lock().ok().and_then(|mut m| m.take());
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        if let Some(server) = self.inner.health_check.lock().await.take() {
            server.stop().await;
        }

        if self.inner.connection.is_open() {
            if let Err(e) = self.inner.connection.close().await {
                warn!("Supervisor 关闭连接失败: {}", e);
            }
        }
        info!("Supervisor 已停止");
    }

    /// Consumer的订阅异常终止时调用
    ///
    /// 在锁内移除旧的Consumer；未关闭时创建新的Consumer并启动。旧通道仍然打开时复用，
    /// 否则在Supervisor的连接上新开一个通道。
    pub async fn consumer_exception(
        &self,
        queue: &str,
        error: &CuniculusError,
    ) -> CuniculusResult<()> {
        let mut consumers = self.inner.consumers.lock().await;
        let dead = consumers.remove(queue);

        if self.inner.done.load(Ordering::SeqCst) {
            return Ok(());
        }

        warn!("队列 {} 的Consumer异常终止，准备替换: {}", queue, error);

        let spec = self
            .inner
            .config
            .queue(queue)
            .ok_or_else(|| CuniculusError::Internal(format!("未配置的队列: {queue}")))?;

        let channel = match dead.map(|consumer| consumer.channel()) {
            Some(channel) if channel.is_open() => channel,
            _ => open_channel(self.inner.connection.as_ref(), &spec).await?,
        };

        let replacement = Consumer::new(
            channel,
            &spec,
            self.inner.config.dead_queue_ttl_ms,
            self.inner.registry.clone(),
            self.inner.reporter.clone(),
            self.inner.events.clone(),
        )
        .await?;
        replacement.start().await?;
        consumers.insert(queue.to_string(), replacement);

        self.inner.replacements.fetch_add(1, Ordering::SeqCst);
        info!("队列 {} 的Consumer已替换", queue);
        Ok(())
    }

    async fn monitor(&self, mut event_rx: mpsc::UnboundedReceiver<ConsumerEvent>) {
        while let Some(event) = event_rx.recv().await {
            if self.inner.done.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.consumer_exception(&event.queue, &event.error).await {
                error!("替换队列 {} 的Consumer失败: {}", event.queue, e);
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    /// Consumer被替换的累计次数
    pub fn replacements(&self) -> usize {
        self.inner.replacements.load(Ordering::SeqCst)
    }

    pub async fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.consumers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn consumer_tag(&self, queue: &str) -> Option<String> {
        self.inner
            .consumers
            .lock()
            .await
            .get(queue)
            .map(|consumer| consumer.tag().to_string())
    }

    /// 正在订阅的Consumer数量
    pub async fn alive_consumers(&self) -> usize {
        self.inner
            .consumers
            .lock()
            .await
            .values()
            .filter(|consumer| consumer.alive())
            .count()
    }

    /// 健康检查实际监听的地址
    pub async fn health_check_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner
            .health_check
            .lock()
            .await
            .as_ref()
            .map(HealthCheckServer::local_addr)
    }
}

async fn open_channel(
    connection: &dyn BrokerConnection,
    spec: &QueueSpec,
) -> CuniculusResult<Arc<dyn BrokerChannel>> {
    let channel = connection.create_channel().await?;
    channel.set_prefetch(spec.prefetch_count).await?;
    Ok(channel)
}
