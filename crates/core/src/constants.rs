//! 与RabbitMQ约定的名称和默认值

/// 普通任务与重试任务使用的direct交换机
pub const CUNICULUS_EXCHANGE: &str = "cuniculus";
/// 最终死信使用的fanout交换机
pub const CUNICULUS_DLX_EXCHANGE: &str = "cuniculus_dlx";
/// 全局死信队列
pub const DEAD_QUEUE_NAME: &str = "cun_dead";
/// 未显式指定队列的任务使用的队列
pub const DEFAULT_QUEUE_NAME: &str = "cun_default";
/// 消息体中的重试计数字段
pub const RETRY_COUNT_KEY: &str = "_cun_retries";

pub const DEFAULT_MAX_RETRY: u32 = 8;
/// 重试链长度上限，第45个重试队列的TTL (4_101_315_000ms) 仍在32位范围内
pub const MAX_RETRY: u32 = 45;
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;
pub const DEFAULT_CONCURRENCY: usize = 5;
/// 180天
pub const DEFAULT_DEAD_QUEUE_TTL_MS: u64 = 1000 * 60 * 60 * 24 * 180;
