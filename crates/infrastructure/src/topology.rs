//! 队列拓扑
//!
//! 一个逻辑队列 `Q` 在broker上展开为：
//!
//! ```text
//! cuniculus (direct) --Q--> Q --(reject/expire)--> cuniculus_dlx (fanout) --> cun_dead
//! cuniculus (direct) --Q_i--> Q_i --(ttl)--> cuniculus (routing_key=Q) --> Q
//! ```
//!
//! 重试队列 `Q_i` 没有消费者，消息在TTL到期后经由主交换机回到 `Q`。

use std::sync::Arc;
use tracing::{debug, info};

use cuniculus_core::{
    AppConfig, BrokerChannel, Connector, ExchangeDeclaration, ExchangeKind, QueueArguments,
    QueueBinding, QueueDeclaration, QueueSpec, CUNICULUS_DLX_EXCHANGE, CUNICULUS_EXCHANGE,
    DEAD_QUEUE_NAME,
};
use cuniculus_errors::CuniculusResult;

/// 第`index`个重试队列的TTL（毫秒），`index`从1开始，溢出时取 `u64::MAX`
pub fn retry_ttl_ms(index: u32) -> u64 {
    let i = u64::from(index);
    i.checked_pow(4)
        .and_then(|quartic| quartic.checked_add(15 * (i + 1)))
        .and_then(|seconds| seconds.checked_mul(1000))
        .unwrap_or(u64::MAX)
}

/// 两个交换机的声明
pub fn exchange_declarations() -> Vec<ExchangeDeclaration> {
    vec![
        ExchangeDeclaration::new(CUNICULUS_EXCHANGE, ExchangeKind::Direct),
        ExchangeDeclaration::new(CUNICULUS_DLX_EXCHANGE, ExchangeKind::Fanout),
    ]
}

/// 一个队列需要的全部broker声明，不访问broker
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyPlan {
    pub exchanges: Vec<ExchangeDeclaration>,
    pub queues: Vec<QueueDeclaration>,
    pub bindings: Vec<QueueBinding>,
}

impl TopologyPlan {
    pub fn for_queue(spec: &QueueSpec, dead_queue_ttl_ms: u64) -> Self {
        let mut queues = Vec::with_capacity(spec.max_retry as usize + 2);
        let mut bindings = Vec::with_capacity(spec.max_retry as usize + 2);

        queues.push(QueueDeclaration {
            name: spec.name.clone(),
            durable: spec.durable,
            arguments: QueueArguments {
                dead_letter_exchange: Some(CUNICULUS_DLX_EXCHANGE.to_string()),
                ..Default::default()
            },
        });
        bindings.push(QueueBinding::new(&spec.name, CUNICULUS_EXCHANGE, &spec.name));

        queues.push(dead_queue_declaration(dead_queue_ttl_ms));
        bindings.push(dead_queue_binding());

        for index in 1..=spec.max_retry {
            let name = spec.retry_queue_name(index);
            queues.push(QueueDeclaration {
                name: name.clone(),
                durable: spec.durable,
                arguments: QueueArguments {
                    dead_letter_exchange: Some(CUNICULUS_EXCHANGE.to_string()),
                    dead_letter_routing_key: Some(spec.name.clone()),
                    message_ttl_ms: Some(retry_ttl_ms(index)),
                },
            });
            bindings.push(QueueBinding::new(&name, CUNICULUS_EXCHANGE, &name));
        }

        Self {
            exchanges: exchange_declarations(),
            queues,
            bindings,
        }
    }

    pub async fn apply(&self, channel: &dyn BrokerChannel) -> CuniculusResult<()> {
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            channel.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            channel.bind_queue(binding).await?;
        }
        Ok(())
    }
}

fn dead_queue_declaration(ttl_ms: u64) -> QueueDeclaration {
    QueueDeclaration {
        name: DEAD_QUEUE_NAME.to_string(),
        durable: true,
        arguments: QueueArguments {
            message_ttl_ms: Some(ttl_ms),
            ..Default::default()
        },
    }
}

fn dead_queue_binding() -> QueueBinding {
    QueueBinding::new(DEAD_QUEUE_NAME, CUNICULUS_DLX_EXCHANGE, "")
}

/// 已声明的队列及其重试链
#[derive(Clone)]
pub struct JobQueue {
    spec: QueueSpec,
    retry_queues: Vec<String>,
    channel: Arc<dyn BrokerChannel>,
}

impl JobQueue {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn retry_queues(&self) -> &[String] {
        &self.retry_queues
    }

    /// 已重试`retries`次的任务再次失败后应进入的重试队列，重试耗尽时返回None
    pub fn retry_queue(&self, retries: u32) -> Option<&str> {
        self.retry_queues
            .get(retries as usize)
            .map(String::as_str)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.spec.name)
            .field("retry_queues", &self.retry_queues)
            .finish()
    }
}

/// 在通道上声明队列拓扑，返回队列句柄
pub async fn declare(
    channel: Arc<dyn BrokerChannel>,
    spec: &QueueSpec,
    dead_queue_ttl_ms: u64,
) -> CuniculusResult<JobQueue> {
    let plan = TopologyPlan::for_queue(spec, dead_queue_ttl_ms);
    plan.apply(channel.as_ref()).await?;

    debug!(
        "队列 {} 拓扑声明完成，重试队列数量: {}",
        spec.name, spec.max_retry
    );

    Ok(JobQueue {
        spec: spec.clone(),
        retry_queues: spec.retry_queue_names(),
        channel,
    })
}

/// 只声明两个交换机
pub async fn declare_exchanges(channel: &dyn BrokerChannel) -> CuniculusResult<()> {
    for exchange in exchange_declarations() {
        channel.declare_exchange(&exchange).await?;
    }
    Ok(())
}

/// 声明交换机、死信队列以及配置中的全部队列，不依赖消费者
pub async fn declare_configuration(
    connector: &dyn Connector,
    config: &AppConfig,
) -> CuniculusResult<()> {
    let connection = connector.connect().await?;
    let channel = connection.create_channel().await?;

    let result = declare_all(channel.clone(), config).await;

    channel.close().await?;
    connection.close().await?;
    result
}

async fn declare_all(channel: Arc<dyn BrokerChannel>, config: &AppConfig) -> CuniculusResult<()> {
    declare_exchanges(channel.as_ref()).await?;
    channel
        .declare_queue(&dead_queue_declaration(config.dead_queue_ttl_ms))
        .await?;
    channel.bind_queue(&dead_queue_binding()).await?;

    for spec in config.effective_queues() {
        declare(channel.clone(), &spec, config.dead_queue_ttl_ms).await?;
        info!("队列 {} 已声明", spec.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuniculus_core::MAX_RETRY;

    #[test]
    fn test_retry_ttl_curve() {
        assert_eq!(retry_ttl_ms(1), 31_000);
        assert_eq!(retry_ttl_ms(2), 61_000);
        assert_eq!(retry_ttl_ms(3), 141_000);
        assert_eq!(retry_ttl_ms(8), 4_231_000);
    }

    #[test]
    fn test_retry_ttl_bounds() {
        assert_eq!(retry_ttl_ms(MAX_RETRY), 4_101_315_000);
        assert!(retry_ttl_ms(MAX_RETRY) <= u64::from(u32::MAX));
        assert!(retry_ttl_ms(MAX_RETRY + 1) > u64::from(u32::MAX));

        assert_eq!(retry_ttl_ms(65_536), u64::MAX);
        assert_eq!(retry_ttl_ms(u32::MAX), u64::MAX);
    }

    #[test]
    fn test_plan_for_queue() {
        let spec = QueueSpec::new("emails").with_max_retry(3);
        let plan = TopologyPlan::for_queue(&spec, 1000);

        assert_eq!(plan.exchanges.len(), 2);
        assert_eq!(plan.exchanges[0].kind, ExchangeKind::Direct);
        assert_eq!(plan.exchanges[1].kind, ExchangeKind::Fanout);

        let names: Vec<&str> = plan.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["emails", "cun_dead", "emails_1", "emails_2", "emails_3"]);

        let base = &plan.queues[0];
        assert_eq!(
            base.arguments.dead_letter_exchange.as_deref(),
            Some("cuniculus_dlx")
        );
        assert_eq!(base.arguments.message_ttl_ms, None);

        let dead = &plan.queues[1];
        assert!(dead.durable);
        assert_eq!(dead.arguments.message_ttl_ms, Some(1000));

        for (offset, queue) in plan.queues[2..].iter().enumerate() {
            let index = offset as u32 + 1;
            assert_eq!(queue.arguments.dead_letter_exchange.as_deref(), Some("cuniculus"));
            assert_eq!(queue.arguments.dead_letter_routing_key.as_deref(), Some("emails"));
            assert_eq!(queue.arguments.message_ttl_ms, Some(retry_ttl_ms(index)));
        }

        assert!(plan
            .bindings
            .contains(&QueueBinding::new("emails", "cuniculus", "emails")));
        assert!(plan
            .bindings
            .contains(&QueueBinding::new("emails_2", "cuniculus", "emails_2")));
        assert!(plan
            .bindings
            .contains(&QueueBinding::new("cun_dead", "cuniculus_dlx", "")));
    }

    #[test]
    fn test_plan_without_retries() {
        let spec = QueueSpec::new("once").with_max_retry(0).with_durable(false);
        let plan = TopologyPlan::for_queue(&spec, 1000);
        assert_eq!(plan.queues.len(), 2);
        assert!(!plan.queues[0].durable);
        assert_eq!(plan.bindings.len(), 2);
    }
}
