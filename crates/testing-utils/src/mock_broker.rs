//! 内存broker
//!
//! 行为尽量贴近RabbitMQ：direct/fanout路由、默认交换机、nack(requeue=false)
//! 与TTL到期走队列的死信参数、参数不一致的重复声明返回冲突并关闭通道、
//! 断线时订阅流收到错误且未确认的消息回到队列。

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use cuniculus_core::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, ExchangeDeclaration, ExchangeKind,
    IncomingDelivery, JobEnvelope, QueueBinding, QueueDeclaration,
};
use cuniculus_errors::{CuniculusError, CuniculusResult};

/// 一次发布记录
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct MockQueue {
    declaration: QueueDeclaration,
    messages: VecDeque<StoredMessage>,
}

struct Subscriber {
    tag: String,
    channel_id: u64,
    sender: mpsc::UnboundedSender<CuniculusResult<IncomingDelivery>>,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    online: bool,
    connect_attempts: usize,
    fail_next_connects: usize,
    fail_next_publishes: usize,
    hang_next_publishes: usize,
    connections: Vec<Arc<AtomicBool>>,
    channels_created: usize,
    next_channel_id: u64,
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, MockQueue>,
    bindings: Vec<QueueBinding>,
    published: Vec<PublishedMessage>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    next_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    prefetch: HashMap<u64, u16>,
}

impl BrokerState {
    /// 按交换机类型和绑定计算目标队列
    fn route(&self, exchange: &str, routing_key: &str) -> CuniculusResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let declaration = self.exchanges.get(exchange).ok_or_else(|| {
            CuniculusError::broker_error(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| declaration.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        targets.dedup();
        Ok(targets)
    }

    fn deliver(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> CuniculusResult<()> {
        for queue in self.route(exchange, routing_key)? {
            self.enqueue(
                &queue,
                StoredMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                },
                false,
            );
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, front: bool) {
        if let Some(q) = self.queues.get_mut(queue) {
            if front {
                q.messages.push_front(message);
            } else {
                q.messages.push_back(message);
            }
        }
        self.dispatch(queue);
    }

    /// 把就绪消息推给订阅者
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(subscribers) = self.subscribers.get_mut(queue) else {
                return;
            };
            subscribers.retain(|s| !s.sender.is_closed());
            if subscribers.is_empty() {
                return;
            }
            let Some(message) = self
                .queues
                .get_mut(queue)
                .and_then(|q| q.messages.pop_front())
            else {
                return;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let subscriber = &subscribers[(delivery_tag as usize) % subscribers.len()];
            let delivery = IncomingDelivery {
                delivery_tag,
                data: message.payload.clone(),
                redelivered: message.redelivered,
            };

            if subscriber.sender.send(Ok(delivery)).is_ok() {
                let channel_id = subscriber.channel_id;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue.to_string(),
                        channel_id,
                        message,
                    },
                );
            } else if let Some(q) = self.queues.get_mut(queue) {
                q.messages.push_front(message);
            }
        }
    }

    /// 按队列的死信参数转发消息
    fn dead_letter(&mut self, queue: &str, message: StoredMessage) {
        let Some(arguments) = self.queues.get(queue).map(|q| q.declaration.arguments.clone())
        else {
            return;
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            return;
        };
        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or(message.routing_key);
        let _ = self.deliver(&exchange, &routing_key, &message.payload);
    }

    fn requeue_channel(&mut self, channel_id: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut tags = tags;
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.enqueue(&unacked.queue, message, true);
            }
        }
    }

    fn drop_channel_subscribers(&mut self, channel_id: u64) {
        for subscribers in self.subscribers.values_mut() {
            subscribers.retain(|s| s.channel_id != channel_id);
        }
    }
}

/// 内存broker，克隆后共享状态
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 作为 `Arc<dyn Connector>` 使用
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// 直接打开一个连接
    pub async fn open_connection(&self) -> Arc<dyn BrokerConnection> {
        match self.connect().await {
            Ok(connection) => connection,
            Err(e) => panic!("MockBroker离线，无法打开连接: {e}"),
        }
    }

    /// 断开所有连接并拒绝新连接，直到 `set_online(true)`
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.online = false;
        for connection in state.connections.drain(..) {
            connection.store(false, Ordering::SeqCst);
        }
        for (_, subscribers) in state.subscribers.drain() {
            for subscriber in subscribers {
                let _ = subscriber
                    .sender
                    .send(Err(CuniculusError::connection_error("连接已断开")));
            }
        }
        let tags: Vec<u64> = state.unacked.keys().copied().collect();
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.messages.push_front(message);
                }
            }
        }
    }

    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().fail_next_connects = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_next_publishes = count;
    }

    /// 接下来的`count`次发布永远不返回，模拟半开的连接
    pub fn hang_next_publishes(&self, count: usize) {
        self.lock().hang_next_publishes = count;
    }

    /// 模拟队列中所有消息TTL到期，按死信参数转发
    pub fn expire_queue(&self, queue: &str) -> usize {
        let mut state = self.lock();
        let messages: Vec<StoredMessage> = match state.queues.get_mut(queue) {
            Some(q) => q.messages.drain(..).collect(),
            None => return 0,
        };
        let count = messages.len();
        for message in messages {
            state.dead_letter(queue, message);
        }
        count
    }

    /// 让队列上的订阅流返回错误并结束
    pub fn fail_subscription(&self, queue: &str) -> usize {
        let mut state = self.lock();
        let subscribers = state.subscribers.remove(queue).unwrap_or_default();
        let count = subscribers.len();
        for subscriber in subscribers {
            let _ = subscriber
                .sender
                .send(Err(CuniculusError::broker_error(format!(
                    "消费者 {} 被broker取消",
                    subscriber.tag
                ))));
        }
        count
    }

    /// 通过交换机发布，不经过任何通道
    pub fn publish_direct(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let mut state = self.lock();
        let _ = state.deliver(exchange, routing_key, payload);
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.load(Ordering::SeqCst))
            .count()
    }

    pub fn channels_created(&self) -> usize {
        self.lock().channels_created
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        self.lock().queues.get(queue).map(|q| q.declaration.clone())
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDeclaration> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.lock().bindings.clone()
    }

    /// 队列中就绪（未投递）的消息数
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// 队列中可解析的任务消息
    pub fn envelopes(&self, queue: &str) -> Vec<JobEnvelope> {
        self.messages(queue)
            .iter()
            .filter_map(|payload| JobEnvelope::parse(payload).ok())
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.lock().nacks.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.lock()
            .subscribers
            .get(queue)
            .map(|s| s.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn prefetch(&self, channel_id: u64) -> Option<u16> {
        self.lock().prefetch.get(&channel_id).copied()
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(&self) -> CuniculusResult<Arc<dyn BrokerConnection>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if !state.online {
            return Err(CuniculusError::connection_error("Connection refused (MockBroker离线)"));
        }
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(CuniculusError::connection_error("Connection reset by peer"));
        }

        let open = Arc::new(AtomicBool::new(true));
        state.connections.push(open.clone());
        Ok(Arc::new(MockConnection {
            broker: self.clone(),
            open,
        }))
    }
}

pub struct MockConnection {
    broker: MockBroker,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> CuniculusResult<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(CuniculusError::connection_error("连接已关闭，无法创建通道"));
        }
        let mut state = self.broker.lock();
        state.channels_created += 1;
        state.next_channel_id += 1;
        Ok(Arc::new(MockChannel {
            id: state.next_channel_id,
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> CuniculusResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockChannel {
    id: u64,
    broker: MockBroker,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MockChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> CuniculusResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CuniculusError::broker_error(format!("通道 {} 已关闭", self.id)))
        }
    }

    /// broker在通道级错误后关闭通道
    fn close_with_error(&self, state: &mut BrokerState) {
        self.open.store(false, Ordering::SeqCst);
        state.drop_channel_subscribers(self.id);
        state.requeue_channel(self.id);
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> CuniculusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if let Some(existing) = state.exchanges.get(&declaration.name) {
            if existing != declaration {
                self.close_with_error(&mut state);
                return Err(CuniculusError::broker_error(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    declaration.name
                )));
            }
            return Ok(());
        }
        state
            .exchanges
            .insert(declaration.name.clone(), declaration.clone());
        Ok(())
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> CuniculusResult<u32> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if let Some(existing) = state.queues.get(&declaration.name) {
            if existing.declaration != *declaration {
                let message = if existing.declaration.durable != declaration.durable {
                    "inequivalent arg 'durable'"
                } else {
                    "inequivalent queue arguments"
                };
                self.close_with_error(&mut state);
                return Err(CuniculusError::queue_conflict(
                    &declaration.name,
                    format!("PRECONDITION_FAILED - {message} for queue '{}'", declaration.name),
                ));
            }
            return Ok(existing.messages.len() as u32);
        }
        state.queues.insert(
            declaration.name.clone(),
            MockQueue {
                declaration: declaration.clone(),
                messages: VecDeque::new(),
            },
        );
        Ok(0)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> CuniculusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(&binding.queue) {
            self.close_with_error(&mut state);
            return Err(CuniculusError::broker_error(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            self.close_with_error(&mut state);
            return Err(CuniculusError::broker_error(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> CuniculusResult<()> {
        self.ensure_open()?;
        self.broker.lock().prefetch.insert(self.id, prefetch_count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> CuniculusResult<()> {
        self.ensure_open()?;
        let hang = {
            let mut state = self.broker.lock();
            let hang = state.hang_next_publishes > 0;
            if hang {
                state.hang_next_publishes -= 1;
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.broker.lock();
        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(CuniculusError::broker_error("Connection reset by peer"));
        }
        if let Err(e) = state.deliver(exchange, routing_key, payload) {
            self.close_with_error(&mut state);
            return Err(e);
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> CuniculusResult<DeliveryStream> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            self.close_with_error(&mut state);
            return Err(CuniculusError::broker_error(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry(queue.to_string())
            .or_default()
            .push(Subscriber {
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                sender,
            });
        state.dispatch(queue);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> CuniculusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for subscribers in state.subscribers.values_mut() {
            subscribers.retain(|s| s.tag != consumer_tag);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> CuniculusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(CuniculusError::broker_error(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }
        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CuniculusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(CuniculusError::broker_error(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };
        state.nacks.push((delivery_tag, requeue));

        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            state.enqueue(&unacked.queue, message, true);
        } else {
            state.dead_letter(&unacked.queue, unacked.message);
        }
        Ok(())
    }

    async fn close(&self) -> CuniculusResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.lock();
        state.drop_channel_subscribers(self.id);
        state.requeue_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuniculus_core::QueueArguments;

    fn queue(name: &str, arguments: QueueArguments) -> QueueDeclaration {
        QueueDeclaration {
            name: name.to_string(),
            durable: true,
            arguments,
        }
    }

    async fn setup() -> (MockBroker, Arc<dyn BrokerChannel>) {
        let broker = MockBroker::new();
        let connection = broker.open_connection().await;
        let channel = connection.create_channel().await.unwrap();
        channel
            .declare_exchange(&ExchangeDeclaration::new("main", ExchangeKind::Direct))
            .await
            .unwrap();
        channel
            .declare_exchange(&ExchangeDeclaration::new("dlx", ExchangeKind::Fanout))
            .await
            .unwrap();
        channel
            .declare_queue(&queue(
                "work",
                QueueArguments {
                    dead_letter_exchange: Some("dlx".to_string()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        channel
            .declare_queue(&queue("dead", QueueArguments::default()))
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new("work", "main", "work"))
            .await
            .unwrap();
        channel
            .bind_queue(&QueueBinding::new("dead", "dlx", ""))
            .await
            .unwrap();
        (broker, channel)
    }

    #[tokio::test]
    async fn test_direct_routing_and_dead_letter_on_reject() {
        let (broker, channel) = setup().await;
        channel.publish("main", "work", b"job").await.unwrap();
        channel.publish("main", "other", b"lost").await.unwrap();
        assert_eq!(broker.messages("work"), vec![b"job".to_vec()]);

        let mut stream = channel.subscribe("work", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.data, b"job".to_vec());
        assert_eq!(broker.unacked_count(), 1);

        channel.nack(delivery.delivery_tag, false).await.unwrap();
        assert_eq!(broker.messages("dead"), vec![b"job".to_vec()]);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_conflicting_declaration_closes_channel() {
        let (broker, channel) = setup().await;
        let err = channel
            .declare_queue(&queue("work", QueueArguments::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, CuniculusError::QueueConflict { ref queue, .. } if queue == "work"));
        assert!(!channel.is_open());
        assert!(broker.queue_declaration("work").is_some());
    }

    #[tokio::test]
    async fn test_disconnect_fails_streams_and_requeues() {
        let (broker, channel) = setup().await;
        channel.publish("main", "work", b"job").await.unwrap();
        let mut stream = channel.subscribe("work", "c1").await.unwrap();
        stream.next().await.unwrap().unwrap();

        broker.disconnect();
        assert!(stream.next().await.unwrap().is_err());
        assert!(!channel.is_open());
        assert_eq!(broker.queue_len("work"), 1);
        assert!(broker.connect().await.is_err());

        broker.set_online(true);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }
}
