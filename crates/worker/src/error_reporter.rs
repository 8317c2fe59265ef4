use std::error::Error as _;
use tracing::{error, warn};

use cuniculus_errors::CuniculusError;

/// 错误发生时的任务上下文
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub queue: &'a str,
    /// 消息无法解析时为None
    pub class: Option<&'a str>,
    pub retries: u32,
    pub payload: &'a [u8],
}

/// 消费侧错误上报
///
/// 每个消费错误在决定重试或死信之前调用一次。闭包
/// `Fn(&CuniculusError, &ErrorContext)` 自动实现该trait。
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &CuniculusError, context: &ErrorContext<'_>);
}

impl<F> ErrorReporter for F
where
    F: Fn(&CuniculusError, &ErrorContext<'_>) + Send + Sync,
{
    fn report(&self, error: &CuniculusError, context: &ErrorContext<'_>) {
        self(error, context)
    }
}

/// 默认实现：记录错误种类、消息和完整的错误链
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    fn report(&self, error: &CuniculusError, context: &ErrorContext<'_>) {
        match error {
            CuniculusError::BadlyFormattedPayload(_) => {
                warn!(
                    queue = context.queue,
                    kind = error.kind(),
                    payload = %String::from_utf8_lossy(context.payload),
                    "任务消息格式错误: {}",
                    error
                );
            }
            _ => {
                error!(
                    queue = context.queue,
                    class = context.class.unwrap_or("<unknown>"),
                    retries = context.retries,
                    kind = error.kind(),
                    chain = %error_chain(error),
                    "{}",
                    error
                );
            }
        }
    }
}

/// 把错误及其所有source串成一行
pub fn error_chain(error: &CuniculusError) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(" <- ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_reporter_receives_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter: Arc<dyn ErrorReporter> =
            Arc::new(move |e: &CuniculusError, ctx: &ErrorContext<'_>| {
                sink.lock()
                    .unwrap()
                    .push((e.kind(), ctx.queue.to_string(), ctx.retries));
            });

        reporter.report(
            &CuniculusError::execution_message("Fail", "boom"),
            &ErrorContext {
                queue: "jobs",
                class: Some("Fail"),
                retries: 2,
                payload: b"{}",
            },
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("ExecutionError", "jobs".to_string(), 2)]
        );
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let cause = anyhow::anyhow!("disk full").context("写入失败");
        let error = CuniculusError::execution("Export", cause);
        let chain = error_chain(&error);

        assert!(chain.starts_with("任务 Export 执行失败"));
        assert!(chain.contains("写入失败"));
    }
}
