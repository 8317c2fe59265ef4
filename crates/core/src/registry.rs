//! 任务类型注册表
//!
//! 启动时把 `class` 字符串映射到处理器工厂，消费时按名称解析。
//! 未注册的名称返回 `UnknownJobClass`，按执行错误处理。

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::constants::DEFAULT_QUEUE_NAME;
use crate::traits::{FnJobHandler, JobHandler};
use cuniculus_errors::{CuniculusError, CuniculusResult};

/// 每次执行时构造处理器实例
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册共享的处理器实例
    pub fn register(&mut self, class: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.factories
            .insert(class.into(), Arc::new(move || handler.clone()));
    }

    pub fn register_factory<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn JobHandler> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Arc::new(factory));
    }

    pub fn register_fn<F, Fut>(&mut self, class: impl Into<String>, func: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(class, Arc::new(FnJobHandler::new(func)));
    }

    pub fn resolve(&self, class: &str) -> CuniculusResult<Arc<dyn JobHandler>> {
        self.factories
            .get(class)
            .map(|factory| factory())
            .ok_or_else(|| CuniculusError::UnknownJobClass(class.to_string()))
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.factories.keys().cloned().collect();
        classes.sort();
        classes
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

/// 任务类型描述：任务名称以及投递的队列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub class: String,
    pub queue: String,
}

impl JobDescriptor {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            queue: DEFAULT_QUEUE_NAME.to_string(),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for Counting {
        async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
            self.0.fetch_add(args.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();
        registry.register("Counting", Arc::new(Counting(counter.clone())));

        let handler = registry.resolve("Counting").unwrap();
        handler.perform(&[json!(1), json!(2)]).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = JobRegistry::new();
        registry.register_fn("Fail", |_args| async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        registry.register_fn("Ok", |_args| async { Ok::<(), anyhow::Error>(()) });

        assert!(registry.resolve("Ok").unwrap().perform(&[]).await.is_ok());
        let err = registry.resolve("Fail").unwrap().perform(&[]).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(registry.classes(), vec!["Fail", "Ok"]);
    }

    #[test]
    fn test_factory_builds_new_instances() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();
        let counter = built.clone();
        registry.register_factory("Fresh", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Counting(Arc::new(AtomicUsize::new(0)))) as Arc<dyn JobHandler>
        });

        registry.resolve("Fresh").unwrap();
        registry.resolve("Fresh").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_class() {
        let registry = JobRegistry::new();
        let err = registry.resolve("Missing").err().unwrap();
        assert!(matches!(err, CuniculusError::UnknownJobClass(ref c) if c == "Missing"));
        assert!(err.is_execution_error());
    }

    #[test]
    fn test_descriptor_defaults_to_default_queue() {
        let descriptor = JobDescriptor::new("Report");
        assert_eq!(descriptor.queue, "cun_default");
        assert_eq!(descriptor.on_queue("reports").queue, "reports");
    }
}
