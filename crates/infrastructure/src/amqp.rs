//! 基于lapin的RabbitMQ实现

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ErrorKind,
    ExchangeKind as AmqpExchangeKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use cuniculus_core::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, ExchangeDeclaration, ExchangeKind,
    IncomingDelivery, QueueArguments, QueueBinding, QueueDeclaration, RabbitMqConfig,
};
use cuniculus_errors::{CuniculusError, CuniculusResult};

/// 按配置建立RabbitMQ连接
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    address: String,
    timeout: Duration,
}

impl AmqpConnector {
    pub fn new(config: &RabbitMqConfig) -> Self {
        Self {
            url: config.build_url(),
            address: config.display_address(),
            timeout: Duration::from_secs(config.connection_timeout_seconds),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> CuniculusResult<Arc<dyn BrokerConnection>> {
        let connecting = Connection::connect(&self.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(self.timeout, connecting)
            .await
            .map_err(|_| {
                CuniculusError::connection_error(format!(
                    "连接RabbitMQ超时: {} ({:?})",
                    self.address, self.timeout
                ))
            })?
            .map_err(|e| CuniculusError::connection_error(format!("连接RabbitMQ失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", self.address);
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> CuniculusResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| CuniculusError::connection_error(format!("创建通道失败: {e}")))?;

        debug!("通道 {} 已创建", channel.id());
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> CuniculusResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| CuniculusError::connection_error(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    if let Some(ttl) = arguments.message_ttl_ms {
        let value = match i32::try_from(ttl) {
            Ok(ttl) => AMQPValue::LongInt(ttl),
            Err(_) => AMQPValue::LongLongInt(ttl.min(i64::MAX as u64) as i64),
        };
        table.insert("x-message-ttl".into(), value);
    }
    table
}

/// broker以 PRECONDITION_FAILED (406) 关闭通道表示已存在的队列参数不一致
fn is_precondition_failed(error: &lapin::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ProtocolError(amqp_error)
            if matches!(
                amqp_error.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            )
    )
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> CuniculusResult<()> {
        let kind = match declaration.kind {
            ExchangeKind::Direct => AmqpExchangeKind::Direct,
            ExchangeKind::Fanout => AmqpExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                &declaration.name,
                kind,
                ExchangeDeclareOptions {
                    durable: declaration.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                CuniculusError::broker_error(format!("声明交换机 {} 失败: {e}", declaration.name))
            })?;

        debug!("交换机 {} 声明成功", declaration.name);
        Ok(())
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> CuniculusResult<u32> {
        let queue = self
            .channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    durable: declaration.durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                queue_arguments(&declaration.arguments),
            )
            .await
            .map_err(|e| {
                let error_msg = e.to_string();
                if is_precondition_failed(&e) {
                    CuniculusError::queue_conflict(&declaration.name, error_msg)
                } else {
                    CuniculusError::broker_error(format!(
                        "声明队列 {} 失败: {error_msg}",
                        declaration.name
                    ))
                }
            })?;

        debug!("队列 {} 声明成功", declaration.name);
        Ok(queue.message_count())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> CuniculusResult<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                CuniculusError::broker_error(format!(
                    "绑定队列 {} 到交换机 {} 失败: {e}",
                    binding.queue, binding.exchange
                ))
            })?;
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> CuniculusResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| CuniculusError::broker_error(format!("设置预取数量失败: {e}")))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> CuniculusResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| {
                CuniculusError::broker_error(format!(
                    "发布消息到交换机 {exchange} (routing_key={routing_key}) 失败: {e}"
                ))
            })?;

        confirm
            .await
            .map_err(|e| CuniculusError::broker_error(format!("消息发布确认失败: {e}")))?;

        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> CuniculusResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CuniculusError::broker_error(format!("创建消费者失败: {e}")))?;

        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| IncomingDelivery {
                    delivery_tag: delivery.delivery_tag,
                    data: delivery.data,
                    redelivered: delivery.redelivered,
                })
                .map_err(|e| CuniculusError::broker_error(format!("接收消息失败: {e}")))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> CuniculusResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| CuniculusError::broker_error(format!("取消消费者 {consumer_tag} 失败: {e}")))
    }

    async fn ack(&self, delivery_tag: u64) -> CuniculusResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| CuniculusError::broker_error(format!("确认消息失败: {e}")))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CuniculusResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CuniculusError::broker_error(format!("拒绝消息失败: {e}")))
    }

    async fn close(&self) -> CuniculusResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        if let Err(e) = self.channel.close(200, "正常关闭").await {
            warn!("关闭通道 {} 失败: {}", self.channel.id(), e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;
    use lapin::types::ShortString;

    #[test]
    fn test_queue_arguments_table() {
        let table = queue_arguments(&QueueArguments {
            dead_letter_exchange: Some("cuniculus".to_string()),
            dead_letter_routing_key: Some("emails".to_string()),
            message_ttl_ms: Some(31_000),
        });
        let inner = table.inner();
        assert_eq!(inner.len(), 3);
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongInt(31_000))
        );
    }

    #[test]
    fn test_large_ttl_uses_long_long() {
        let table = queue_arguments(&QueueArguments {
            message_ttl_ms: Some(15_552_000_000),
            ..Default::default()
        });
        assert_eq!(
            table.inner().get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(15_552_000_000))
        );
    }

    fn protocol_error(kind: AMQPSoftError, message: &str) -> lapin::Error {
        lapin::Error::from(ErrorKind::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(kind),
            message.into(),
        )))
    }

    #[test]
    fn test_precondition_failed_detection() {
        assert!(is_precondition_failed(&protocol_error(
            AMQPSoftError::PRECONDITIONFAILED,
            "PRECONDITION_FAILED - inequivalent arg 'durable' for queue 'jobs'"
        )));

        // 只看应答码，不看错误文本
        assert!(!is_precondition_failed(&protocol_error(
            AMQPSoftError::NOTFOUND,
            "NOT_FOUND - no queue 'jobs_406'"
        )));
        assert!(!is_precondition_failed(&lapin::Error::from(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "PRECONDITION_FAILED 406")
        )));
    }
}
