//! broker抽象
//!
//! Dispatcher、Consumer和Supervisor只通过这里的trait访问broker。
//! 生产实现基于lapin，测试使用内存实现。

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use cuniculus_errors::CuniculusResult;

/// 交换机类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeDeclaration {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// 队列的 `x-` 参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// 一次投递
#[derive(Debug, Clone)]
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

/// 订阅产生的投递流，`Err` 表示订阅本身失败
pub type DeliveryStream = BoxStream<'static, CuniculusResult<IncomingDelivery>>;

/// 建立broker连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> CuniculusResult<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> CuniculusResult<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> CuniculusResult<()>;
}

/// AMQP通道上的操作
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> CuniculusResult<()>;

    /// 声明队列，返回队列中的消息数量。参数冲突时返回 `QueueConflict`
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> CuniculusResult<u32>;

    async fn bind_queue(&self, binding: &QueueBinding) -> CuniculusResult<()>;

    async fn set_prefetch(&self, prefetch_count: u16) -> CuniculusResult<()>;

    /// 持久化发布
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8])
        -> CuniculusResult<()>;

    /// 手动确认模式订阅
    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> CuniculusResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> CuniculusResult<()>;

    async fn ack(&self, delivery_tag: u64) -> CuniculusResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CuniculusResult<()>;

    async fn close(&self) -> CuniculusResult<()>;
}
