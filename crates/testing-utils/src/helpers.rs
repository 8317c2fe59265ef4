//! Test helper utilities

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// 轮询直到条件成立或超时，返回条件是否成立
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for an async condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(100)).await;
        }

        false
    }

    /// 带随机后缀的队列名，避免集成测试之间互相影响
    pub fn unique_name(prefix: &str) -> String {
        format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
    }

    /// Initialize test logging
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }
}
