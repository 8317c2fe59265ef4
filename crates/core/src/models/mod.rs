//! # 数据模型
//!
//! - [`JobEnvelope`] - 线上传输的任务消息体 `{"class", "args", "_cun_retries"}`
//! - [`OutboundMessage`] - 等待PublisherWorker发布的消息
//! - [`OutboundItem`] - 出站队列中的元素，消息或关闭哨兵

pub mod job;
pub mod message;

pub use job::*;
pub use message::*;
