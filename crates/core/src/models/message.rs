use crate::constants::{CUNICULUS_DLX_EXCHANGE, CUNICULUS_EXCHANGE};
use crate::models::JobEnvelope;
use cuniculus_errors::CuniculusResult;

/// 消息发布的目标交换机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeTarget {
    /// `cuniculus`，正常投递和重试路由
    Main,
    /// `cuniculus_dlx`，最终死信
    DeadLetter,
}

impl ExchangeTarget {
    pub fn exchange_name(&self) -> &'static str {
        match self {
            ExchangeTarget::Main => CUNICULUS_EXCHANGE,
            ExchangeTarget::DeadLetter => CUNICULUS_DLX_EXCHANGE,
        }
    }
}

/// 等待发布的消息，在入队到发布成功之间由出站队列持有
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub target: ExchangeTarget,
    pub payload: Vec<u8>,
    pub routing_key: String,
}

impl OutboundMessage {
    pub fn new(target: ExchangeTarget, payload: Vec<u8>, routing_key: impl Into<String>) -> Self {
        Self {
            target,
            payload,
            routing_key: routing_key.into(),
        }
    }

    /// 发往主交换机、路由到指定队列的任务消息
    pub fn job(queue: &str, envelope: &JobEnvelope) -> CuniculusResult<Self> {
        Ok(Self::new(ExchangeTarget::Main, envelope.to_bytes()?, queue))
    }
}

/// 出站队列元素
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundItem {
    Message(OutboundMessage),
    /// 关闭哨兵，取到它的PublisherWorker退出发布循环
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exchange_names() {
        assert_eq!(ExchangeTarget::Main.exchange_name(), "cuniculus");
        assert_eq!(ExchangeTarget::DeadLetter.exchange_name(), "cuniculus_dlx");
    }

    #[test]
    fn test_job_message_targets_main_exchange() {
        let envelope = JobEnvelope::new("Ping", vec![json!(1)]);
        let message = OutboundMessage::job("emails", &envelope).unwrap();
        assert_eq!(message.target, ExchangeTarget::Main);
        assert_eq!(message.routing_key, "emails");
        assert_eq!(JobEnvelope::parse(&message.payload).unwrap(), envelope);
    }
}
