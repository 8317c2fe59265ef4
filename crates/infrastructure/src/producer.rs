use serde_json::Value;
use tracing::debug;

use cuniculus_core::{JobDescriptor, JobEnvelope, OutboundMessage};
use cuniculus_errors::{CuniculusError, CuniculusResult};

use crate::dispatcher::Dispatcher;

/// 任务提交入口
///
/// 第一次提交时启动Dispatcher。必须在tokio运行时内调用。
#[derive(Clone)]
pub struct Producer {
    dispatcher: Dispatcher,
}

impl Producer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// 序列化任务并放入出站队列
    pub fn enqueue(&self, queue: &str, class: &str, args: Vec<Value>) -> CuniculusResult<()> {
        if self.dispatcher.is_shutting_down() {
            return Err(CuniculusError::ShuttingDown);
        }

        let envelope = JobEnvelope::new(class, args);
        let message = OutboundMessage::job(queue, &envelope)?;

        self.dispatcher.start();
        self.dispatcher.enqueue(message)?;

        debug!("任务 {} 已提交到队列 {}", class, queue);
        Ok(())
    }

    pub fn perform_async(&self, descriptor: &JobDescriptor, args: Vec<Value>) -> CuniculusResult<()> {
        self.enqueue(&descriptor.queue, &descriptor.class, args)
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
