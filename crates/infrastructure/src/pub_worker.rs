use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cuniculus_core::{BrokerChannel, BrokerConnection, OutboundItem, OutboundMessage};
use cuniculus_errors::CuniculusResult;

use crate::dispatcher::DispatcherSignal;
use crate::outbound::OutboundQueue;
use crate::topology;

/// 等待旧发布循环退出的最长时间
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 已从出站队列取出、尚未得到发布结果的消息
type InFlight = Arc<Mutex<Option<OutboundMessage>>>;

#[derive(Default)]
struct WorkerRun {
    handle: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

/// 发布者
///
/// 从共享的出站队列取消息，在自己的通道上发布到交换机。发布失败时把消息放回队列，
/// 向Dispatcher发送断线信号后退出，等待Dispatcher恢复连接后重新启动。
pub struct PublisherWorker {
    id: usize,
    queue: OutboundQueue,
    signals: mpsc::UnboundedSender<DispatcherSignal>,
    run: Mutex<WorkerRun>,
    in_flight: InFlight,
    stop_timeout: Duration,
}

impl PublisherWorker {
    pub fn new(
        id: usize,
        queue: OutboundQueue,
        signals: mpsc::UnboundedSender<DispatcherSignal>,
    ) -> Self {
        Self {
            id,
            queue,
            signals,
            run: Mutex::new(WorkerRun::default()),
            in_flight: Arc::new(Mutex::new(None)),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// 指定重启时等待旧发布循环退出的时间
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// 在连接上启动发布循环
    ///
    /// 连接未打开时直接向Dispatcher发送断线信号，不启动循环。
    pub async fn start(&self, connection: Arc<dyn BrokerConnection>) -> CuniculusResult<()> {
        self.stop_running_loop().await;

        if !connection.is_open() {
            warn!("PublisherWorker {} 启动时连接未打开，通知Dispatcher重连", self.id);
            let _ = self
                .signals
                .send(DispatcherSignal::Disconnected(Instant::now()));
            return Ok(());
        }

        let channel = connection.create_channel().await?;
        topology::declare_exchanges(channel.as_ref()).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(publish_loop(
            self.id,
            channel,
            self.queue.clone(),
            self.in_flight.clone(),
            self.signals.clone(),
            stop_rx,
        ));

        if let Ok(mut run) = self.run.lock() {
            run.handle = Some(handle);
            run.stop = Some(stop_tx);
        }

        debug!("PublisherWorker {} 已启动", self.id);
        Ok(())
    }

    /// 发布循环是否在运行
    pub fn alive(&self) -> bool {
        self.run
            .lock()
            .map(|run| {
                run.handle
                    .as_ref()
                    .is_some_and(|handle| !handle.is_finished())
            })
            .unwrap_or(false)
    }

    pub fn describe(&self) -> String {
        format!(
            "PublisherWorker {}: {}",
            self.id,
            if self.alive() { "running" } else { "stopped" }
        )
    }

    /// 停止上一次启动的发布循环，循环只在两次发布之间响应停止
    ///
    /// 超时后强制终止，终止时尚未得到结果的消息放回出站队列。
    async fn stop_running_loop(&self) {
        let (handle, stop) = match self.run.lock() {
            Ok(mut run) => (run.handle.take(), run.stop.take()),
            Err(_) => return,
        };

        let Some(mut handle) = handle else {
            return;
        };
        if handle.is_finished() {
            return;
        }

        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if tokio::time::timeout(self.stop_timeout, &mut handle).await.is_err() {
            warn!("PublisherWorker {} 旧的发布循环未在超时内退出，强制终止", self.id);
            handle.abort();
            let _ = handle.await;

            let pending = self.in_flight.lock().ok().and_then(|mut slot| slot.take());
            if let Some(message) = pending {
                warn!(
                    "PublisherWorker {} 发布未完成，消息放回队列 (routing_key={})",
                    self.id, message.routing_key
                );
                self.queue.push(message);
            }
        }
    }
}

async fn publish_loop(
    id: usize,
    channel: Arc<dyn BrokerChannel>,
    queue: OutboundQueue,
    in_flight: InFlight,
    signals: mpsc::UnboundedSender<DispatcherSignal>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = &mut stop => break,
            item = queue.pop() => item,
        };

        let message = match item {
            Some(OutboundItem::Message(message)) => message,
            Some(OutboundItem::Shutdown) | None => {
                info!("PublisherWorker {} 收到关闭信号", id);
                break;
            }
        };

        if let Ok(mut slot) = in_flight.lock() {
            *slot = Some(message.clone());
        }

        let attempted_at = Instant::now();
        let result = channel
            .publish(
                message.target.exchange_name(),
                &message.routing_key,
                &message.payload,
            )
            .await;

        if let Ok(mut slot) = in_flight.lock() {
            *slot = None;
        }

        match result {
            Ok(()) => {
                metrics::counter!("cuniculus_published_total").increment(1);
                debug!(
                    "PublisherWorker {} 已发布消息到 {} (routing_key={})",
                    id,
                    message.target.exchange_name(),
                    message.routing_key
                );
            }
            Err(e) => {
                warn!("PublisherWorker {} 发布失败，消息放回队列: {}", id, e);
                queue.push(message);
                let _ = signals.send(DispatcherSignal::Disconnected(attempted_at));
                break;
            }
        }
    }

    if channel.is_open() {
        if let Err(e) = channel.close().await {
            debug!("PublisherWorker {} 关闭通道失败: {}", id, e);
        }
    }
}
