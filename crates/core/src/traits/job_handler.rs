//! 任务处理器接口
//!
//! 消息体中的 `class` 通过 [`crate::registry::JobRegistry`] 解析为一个处理器实例，
//! 然后以 `args` 调用。返回错误即视为执行失败，进入重试链。
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use cuniculus_core::JobHandler;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn perform(&self, args: &[serde_json::Value]) -> anyhow::Result<()> {
//!         let to = args.first().and_then(|v| v.as_str()).unwrap_or_default();
//!         mailer::send(to).await?;
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()>;
}

/// 用异步闭包实现的处理器
pub struct FnJobHandler<F> {
    func: F,
}

impl<F> FnJobHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        (self.func)(args.to_vec()).await
    }
}
