//! 测试用任务处理器

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cuniculus_core::JobHandler;

/// 记录每次调用的参数
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<Vec<Value>>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<Value>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(args.to_vec());
        Ok(())
    }
}

/// 总是失败
#[derive(Debug, Clone, Default)]
pub struct FailingHandler {
    attempts: Arc<AtomicUsize>,
}

impl FailingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Err(anyhow::anyhow!("第 {attempt} 次执行失败"))
    }
}

/// 执行时panic
#[derive(Debug, Clone, Default)]
pub struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        panic!("handler panicked");
    }
}

/// 执行前等待一段时间，记录最大并发
#[derive(Debug, Clone)]
pub struct SlowHandler {
    delay: Duration,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
