//! Dispatcher
//!
//! 持有发布用的broker连接和PublisherWorker池。单独的控制循环串行处理所有重连：
//! PublisherWorker发布失败时发送带时间戳的断线信号，早于最近一次建连时间的信号
//! 属于已被替换的连接，直接忽略。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cuniculus_core::{BrokerConnection, Connector, OutboundMessage, PublisherConfig};
use cuniculus_errors::{CuniculusError, CuniculusResult};

use crate::outbound::OutboundQueue;
use crate::pub_worker::PublisherWorker;

/// 控制循环的输入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherSignal {
    /// 在该时刻检测到连接失败
    Disconnected(Instant),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Connecting,
    Connected,
    Draining,
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 第`attempt`次（从1开始）重连失败后的等待时间，返回None表示放弃
///
/// 正常情况下按 `min(delay * 2^(attempt-1), delay_max)` 退避；关闭过程中固定等待1秒，
/// 并且最多尝试 `delay_max` 次，保证关闭不会无限期挂起。
pub fn reconnect_backoff(
    config: &PublisherConfig,
    attempt: u32,
    shutting_down: bool,
) -> Option<Duration> {
    let delay_max = config.reconnect_delay_max();

    if shutting_down {
        if f64::from(attempt) <= delay_max.as_secs_f64() {
            return Some(Duration::from_secs(1));
        }
        return None;
    }

    if !config.reconnect_attempts.allows(attempt) {
        return None;
    }

    let exponent = attempt.saturating_sub(1).min(62) as i32;
    let seconds = config.reconnect_delay_seconds * 2f64.powi(exponent);
    let delay = Duration::try_from_secs_f64(seconds).unwrap_or(delay_max);
    Some(delay.min(delay_max))
}

struct DispatcherInner {
    config: PublisherConfig,
    connector: Arc<dyn Connector>,
    queue: OutboundQueue,
    workers: Vec<Arc<PublisherWorker>>,
    signal_tx: mpsc::UnboundedSender<DispatcherSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<DispatcherSignal>>>,
    connection: tokio::sync::Mutex<Option<Arc<dyn BrokerConnection>>>,
    control: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<DispatcherState>,
    shutting_down: AtomicBool,
    recoveries: AtomicU64,
    poll_interval: Duration,
}

/// 消息发布调度器
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(config: PublisherConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_poll_interval(config, connector, DEFAULT_POLL_INTERVAL)
    }

    /// 指定关闭过程中的轮询间隔
    pub fn with_poll_interval(
        config: PublisherConfig,
        connector: Arc<dyn Connector>,
        poll_interval: Duration,
    ) -> Self {
        let queue = OutboundQueue::new();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let workers = (0..config.pool_size)
            .map(|id| Arc::new(PublisherWorker::new(id, queue.clone(), signal_tx.clone())))
            .collect();

        Self {
            inner: Arc::new(DispatcherInner {
                config,
                connector,
                queue,
                workers,
                signal_tx,
                signal_rx: Mutex::new(Some(signal_rx)),
                connection: tokio::sync::Mutex::new(None),
                control: Mutex::new(None),
                state: Mutex::new(DispatcherState::Stopped),
                shutting_down: AtomicBool::new(false),
                recoveries: AtomicU64::new(0),
                poll_interval,
            }),
        }
    }

    /// 启动控制循环并触发首次连接
    ///
    /// 已在运行或已关闭时不做任何事。
    pub fn start(&self) {
        if self.is_shutting_down() || self.alive() {
            return;
        }

        let Some(signals) = self.inner.signal_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            warn!("Dispatcher控制循环已退出，无法再次启动");
            return;
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(control_loop(inner, signals));
        if let Ok(mut control) = self.inner.control.lock() {
            *control = Some(handle);
        }

        let _ = self
            .inner
            .signal_tx
            .send(DispatcherSignal::Disconnected(Instant::now()));
        info!(
            "Dispatcher已启动，发布者数量: {}",
            self.inner.workers.len()
        );
    }

    /// 控制循环是否在运行
    pub fn alive(&self) -> bool {
        self.inner
            .control
            .lock()
            .map(|control| {
                control
                    .as_ref()
                    .is_some_and(|handle| !handle.is_finished())
            })
            .unwrap_or(false)
    }

    pub fn state(&self) -> DispatcherState {
        self.inner.state()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// 放入出站队列，关闭过程中拒绝
    pub fn enqueue(&self, message: OutboundMessage) -> CuniculusResult<()> {
        if self.is_shutting_down() {
            return Err(CuniculusError::ShuttingDown);
        }
        self.inner.queue.push(message);
        Ok(())
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    /// 控制循环的信号入口
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<DispatcherSignal> {
        self.inner.signal_tx.clone()
    }

    /// 成功完成的连接恢复次数
    pub fn recovery_count(&self) -> u64 {
        self.inner.recoveries.load(Ordering::SeqCst)
    }

    pub fn alive_workers(&self) -> usize {
        self.inner.workers.iter().filter(|w| w.alive()).count()
    }

    /// 控制循环和各个PublisherWorker的运行状态
    pub fn describe(&self) -> String {
        let mut lines = vec![format!(
            "Dispatcher: state={:?}, control_loop={}, pending={}",
            self.state(),
            if self.alive() { "running" } else { "stopped" },
            self.inner.queue.len()
        )];
        lines.extend(self.inner.workers.iter().map(|w| w.describe()));
        lines.join("\n")
    }

    /// 优雅关闭
    ///
    /// 先在宽限期内等待出站队列清空，再向仍在运行的发布者发送关闭哨兵并在新的宽限期内
    /// 等待它们退出。超时后记录诊断信息并返回，不会无限期阻塞。
    pub async fn shutdown(&self) {
        info!("正在关闭Dispatcher");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.set_state(DispatcherState::Draining);

        let grace = self.inner.config.shutdown_grace_period();
        let poll = self.inner.poll_interval;

        let draining_started = Instant::now();
        while !self.inner.queue.is_empty() && draining_started.elapsed() < grace {
            tokio::time::sleep(poll).await;
        }

        let stopping_started = Instant::now();
        let alive = self.alive_workers();
        for _ in 0..alive {
            self.inner.queue.push_shutdown();
        }
        while self.alive_workers() > 0 && stopping_started.elapsed() < grace {
            tokio::time::sleep(poll).await;
        }

        let _ = self.inner.signal_tx.send(DispatcherSignal::Shutdown);

        if let Some(connection) = self.inner.connection.lock().await.take() {
            if let Err(e) = connection.close().await {
                warn!("关闭发布连接失败: {}", e);
            }
        }
        self.inner.set_state(DispatcherState::Stopped);

        let remaining = self.alive_workers();
        if remaining > 0 {
            warn!("强制关闭Dispatcher，仍有 {} 个发布者在运行", remaining);
            warn!("{}", self.describe());
        }
        info!("Dispatcher已关闭");
    }
}

impl DispatcherInner {
    fn state(&self) -> DispatcherState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(DispatcherState::Stopped)
    }

    fn set_state(&self, next: DispatcherState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 重新建立连接并启动所有发布者，失败时按退避策略重试
    async fn recover_from_net_error(&self) {
        let mut attempt = 0u32;
        loop {
            if !self.is_shutting_down() {
                self.set_state(DispatcherState::Connecting);
            }

            match self.connect_and_start().await {
                Ok(()) => {
                    self.recoveries.fetch_add(1, Ordering::SeqCst);
                    if !self.is_shutting_down() {
                        self.set_state(DispatcherState::Connected);
                    }
                    info!("发布连接已建立，{} 个发布者已启动", self.workers.len());
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    metrics::counter!("cuniculus_reconnects_total").increment(1);
                    error!("[{}] 第 {} 次建立发布连接失败: {}", e.kind(), attempt, e);

                    match reconnect_backoff(&self.config, attempt, self.is_shutting_down()) {
                        Some(delay) => {
                            debug!("{:?} 后重试连接", delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!("重连次数已用尽，放弃重连 (attempts={})", attempt);
                            if !self.is_shutting_down() {
                                self.set_state(DispatcherState::Stopped);
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_start(&self) -> CuniculusResult<()> {
        let connection = {
            let mut current = self.connection.lock().await;
            match current.as_ref() {
                Some(connection) if connection.is_open() => connection.clone(),
                _ => {
                    let connection = self.connector.connect().await?;
                    *current = Some(connection.clone());
                    connection
                }
            }
        };

        for worker in &self.workers {
            worker.start(connection.clone()).await?;
        }

        if !connection.is_open() {
            return Err(CuniculusError::connection_error("启动发布者期间连接已断开"));
        }
        Ok(())
    }
}

async fn control_loop(
    inner: Arc<DispatcherInner>,
    mut signals: mpsc::UnboundedReceiver<DispatcherSignal>,
) {
    let mut last_connect: Option<Instant> = None;

    while let Some(signal) = signals.recv().await {
        match signal {
            DispatcherSignal::Shutdown => break,
            DispatcherSignal::Disconnected(at) => {
                if last_connect.is_some_and(|last| at <= last) {
                    debug!("忽略过期的断线信号");
                    continue;
                }
                inner.recover_from_net_error().await;
                last_connect = Some(Instant::now());
            }
        }
    }

    debug!("Dispatcher控制循环已退出");
}
