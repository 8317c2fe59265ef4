//! 队列消费者
//!
//! 每个Consumer在自己的通道上以手动确认模式订阅一个基础队列。单条消息的处理：
//!
//! 1. 解析失败：`nack(requeue=false)`，经基础队列的死信参数进入 `cun_dead`，不重试
//! 2. 执行成功：`ack`
//! 3. 执行失败：先上报错误；重试链还有位置时把 `_cun_retries + 1` 的消息发布到
//!    对应的重试队列并 `ack` 原消息，否则 `nack(requeue=false)`

use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cuniculus_core::{
    BrokerChannel, DeliveryStream, IncomingDelivery, JobEnvelope, JobRegistry, QueueSpec,
    CUNICULUS_EXCHANGE,
};
use cuniculus_errors::{CuniculusError, CuniculusResult};
use cuniculus_infrastructure::{topology, JobQueue};

use crate::error_reporter::{ErrorContext, ErrorReporter};

/// 停止时等待进行中任务完成的最长时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// 订阅本身失败时发给Supervisor的事件
#[derive(Debug)]
pub struct ConsumerEvent {
    pub queue: String,
    pub consumer_tag: String,
    pub error: CuniculusError,
}

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Acked,
    Retried,
    /// 发布重试消息失败，原消息放回基础队列
    Requeued,
    DeadLettered,
}

impl JobOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Acked => "succeeded",
            JobOutcome::Retried => "retried",
            JobOutcome::Requeued => "requeued",
            JobOutcome::DeadLettered => "dead_lettered",
        }
    }
}

struct JobRunner {
    job_queue: JobQueue,
    registry: Arc<JobRegistry>,
    reporter: Arc<dyn ErrorReporter>,
}

#[derive(Default)]
struct ConsumerRun {
    handle: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

pub struct Consumer {
    tag: String,
    runner: Arc<JobRunner>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    events: mpsc::UnboundedSender<ConsumerEvent>,
    stopping: Arc<AtomicBool>,
    run: Mutex<ConsumerRun>,
}

impl Consumer {
    /// 在通道上声明队列拓扑并创建消费者，此时还未订阅
    pub async fn new(
        channel: Arc<dyn BrokerChannel>,
        spec: &QueueSpec,
        dead_queue_ttl_ms: u64,
        registry: Arc<JobRegistry>,
        reporter: Arc<dyn ErrorReporter>,
        events: mpsc::UnboundedSender<ConsumerEvent>,
    ) -> CuniculusResult<Self> {
        let job_queue = topology::declare(channel, spec, dead_queue_ttl_ms).await?;
        let concurrency = spec.concurrency.max(1);

        Ok(Self {
            tag: consumer_tag(&spec.name),
            runner: Arc::new(JobRunner {
                job_queue,
                registry,
                reporter,
            }),
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            events,
            stopping: Arc::new(AtomicBool::new(false)),
            run: Mutex::new(ConsumerRun::default()),
        })
    }

    pub fn queue_name(&self) -> &str {
        self.runner.job_queue.name()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn job_queue(&self) -> &JobQueue {
        &self.runner.job_queue
    }

    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.runner.job_queue.channel().clone()
    }

    /// 订阅循环是否在运行
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

    /// 正在执行的任务数量
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    /// 开始订阅
    pub async fn start(&self) -> CuniculusResult<()> {
        if self.alive() {
            return Ok(());
        }

        let stream = self
            .runner
            .job_queue
            .channel()
            .subscribe(self.queue_name(), &self.tag)
            .await?;
        self.stopping.store(false, Ordering::SeqCst);

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(consume_loop(
            stream,
            self.runner.clone(),
            self.permits.clone(),
            self.tag.clone(),
            self.events.clone(),
            self.stopping.clone(),
            stop_rx,
        ));

        if let Ok(mut run) = self.run.lock() {
            run.handle = Some(handle);
            run.stop = Some(stop_tx);
        }

        info!(
            "Consumer {} 开始消费队列 {} (concurrency={})",
            self.tag,
            self.queue_name(),
            self.concurrency
        );
        Ok(())
    }

    /// 取消订阅，等待进行中的任务结束后关闭通道
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let channel = self.runner.job_queue.channel();

        if channel.is_open() {
            if let Err(e) = channel.cancel(&self.tag).await {
                debug!("Consumer {} 取消订阅失败: {}", self.tag, e);
            }
        }

        let (handle, stop) = match self.run.lock() {
            Ok(mut run) => (run.handle.take(), run.stop.take()),
            Err(_) => (None, None),
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let all = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(DRAIN_TIMEOUT, self.permits.acquire_many(all)).await {
            Ok(_) => {}
            Err(_) => warn!(
                "Consumer {} 停止时仍有 {} 个任务未完成",
                self.tag,
                self.in_flight()
            ),
        }

        if channel.is_open() {
            if let Err(e) = channel.close().await {
                debug!("Consumer {} 关闭通道失败: {}", self.tag, e);
            }
        }
        info!("Consumer {} 已停止", self.tag);
    }

    /// 处理一条投递，返回处理结果
    pub async fn run_job(&self, delivery: IncomingDelivery) -> JobOutcome {
        self.runner.run_job(delivery).await
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue_name())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

fn consumer_tag(queue: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("cun-{host}-{queue}-{}", uuid::Uuid::new_v4().simple())
}

async fn consume_loop(
    mut stream: DeliveryStream,
    runner: Arc<JobRunner>,
    permits: Arc<Semaphore>,
    tag: String,
    events: mpsc::UnboundedSender<ConsumerEvent>,
    stopping: Arc<AtomicBool>,
    mut stop: oneshot::Receiver<()>,
) {
    let failure = loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => return,
            next = stream.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => break e,
            None => break CuniculusError::broker_error(format!("消费者 {tag} 的订阅已结束")),
        };

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let runner = runner.clone();
        tokio::spawn(async move {
            runner.run_job(delivery).await;
            drop(permit);
        });
    };

    if stopping.load(Ordering::SeqCst) {
        return;
    }

    let queue = runner.job_queue.name().to_string();
    error!("Consumer {} 订阅异常终止: {}", tag, failure);
    let _ = events.send(ConsumerEvent {
        queue,
        consumer_tag: tag,
        error: failure,
    });
}

impl JobRunner {
    fn queue(&self) -> &str {
        self.job_queue.name()
    }

    fn channel(&self) -> &Arc<dyn BrokerChannel> {
        self.job_queue.channel()
    }

    async fn run_job(&self, delivery: IncomingDelivery) -> JobOutcome {
        let envelope = match JobEnvelope::parse(&delivery.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reporter.report(
                    &e,
                    &ErrorContext {
                        queue: self.queue(),
                        class: None,
                        retries: 0,
                        payload: &delivery.data,
                    },
                );
                self.nack(delivery.delivery_tag).await;
                return self.record(JobOutcome::DeadLettered);
            }
        };

        match self.perform(&envelope).await {
            Ok(()) => {
                if let Err(e) = self.channel().ack(delivery.delivery_tag).await {
                    warn!("队列 {} 确认消息 {} 失败: {}", self.queue(), delivery.delivery_tag, e);
                }
                debug!("队列 {} 任务 {} 执行成功", self.queue(), envelope.class);
                self.record(JobOutcome::Acked)
            }
            Err(e) => {
                let outcome = self.handle_work_error(&delivery, &envelope, e).await;
                self.record(outcome)
            }
        }
    }

    /// 解析处理器并执行，处理器的panic转换为执行错误
    async fn perform(&self, envelope: &JobEnvelope) -> CuniculusResult<()> {
        let handler = self.registry.resolve(&envelope.class)?;

        match AssertUnwindSafe(handler.perform(&envelope.args))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CuniculusError::execution(&envelope.class, e)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "处理器panic".to_string());
                Err(CuniculusError::execution_message(
                    &envelope.class,
                    format!("panic: {message}"),
                ))
            }
        }
    }

    async fn handle_work_error(
        &self,
        delivery: &IncomingDelivery,
        envelope: &JobEnvelope,
        error: CuniculusError,
    ) -> JobOutcome {
        self.reporter.report(
            &error,
            &ErrorContext {
                queue: self.queue(),
                class: Some(&envelope.class),
                retries: envelope.retries,
                payload: &delivery.data,
            },
        );

        let Some(retry_queue) = self.job_queue.retry_queue(envelope.retries) else {
            info!(
                "队列 {} 任务 {} 重试次数已用尽 ({})，转入死信队列",
                self.queue(),
                envelope.class,
                envelope.retries
            );
            self.nack(delivery.delivery_tag).await;
            return JobOutcome::DeadLettered;
        };

        let published = match envelope.next_attempt().to_bytes() {
            Ok(payload) => {
                self.channel()
                    .publish(CUNICULUS_EXCHANGE, retry_queue, &payload)
                    .await
            }
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                if let Err(e) = self.channel().ack(delivery.delivery_tag).await {
                    warn!("队列 {} 确认消息 {} 失败: {}", self.queue(), delivery.delivery_tag, e);
                }
                debug!(
                    "队列 {} 任务 {} 已转入重试队列 {}",
                    self.queue(),
                    envelope.class,
                    retry_queue
                );
                JobOutcome::Retried
            }
            Err(e) => {
                error!(
                    "队列 {} 任务 {} 发布到重试队列 {} 失败: {}",
                    self.queue(),
                    envelope.class,
                    retry_queue,
                    e
                );
                if let Err(e) = self.channel().nack(delivery.delivery_tag, true).await {
                    warn!("队列 {} 消息 {} 重新入队失败: {}", self.queue(), delivery.delivery_tag, e);
                }
                JobOutcome::Requeued
            }
        }
    }

    async fn nack(&self, delivery_tag: u64) {
        if let Err(e) = self.channel().nack(delivery_tag, false).await {
            warn!("队列 {} 拒绝消息 {} 失败: {}", self.queue(), delivery_tag, e);
        }
    }

    fn record(&self, outcome: JobOutcome) -> JobOutcome {
        metrics::counter!(
            "cuniculus_jobs_total",
            "queue" => self.queue().to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        outcome
    }
}
