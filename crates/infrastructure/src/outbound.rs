use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use cuniculus_core::{OutboundItem, OutboundMessage};

/// 出站任务队列
///
/// 生产者和PublisherWorker共享的无界队列。`push` 不阻塞，`pop` 在队列为空时等待。
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: mpsc::UnboundedSender<OutboundItem>,
    /// 使用 Arc 包装接收端，支持多个PublisherWorker
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<OutboundItem>>>,
    size: Arc<AtomicUsize>,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            size: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, message: OutboundMessage) {
        self.push_item(OutboundItem::Message(message));
    }

    pub fn push_shutdown(&self) {
        self.push_item(OutboundItem::Shutdown);
    }

    fn push_item(&self, item: OutboundItem) {
        // 先计数再发送，避免pop先于计数完成
        self.size.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(item).is_err() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// 取出下一个元素，队列为空时等待
    ///
    /// 可以安全地在 `select!` 中取消：取消只会放弃等待锁或等待消息，不会丢失元素。
    pub async fn pop(&self) -> Option<OutboundItem> {
        let mut receiver = self.receiver.lock().await;
        let item = receiver.recv().await;
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
