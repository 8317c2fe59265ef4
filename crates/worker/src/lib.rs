//! # Cuniculus Worker
//!
//! 消费侧：[`Consumer`] 执行任务并维护重试链，[`Supervisor`] 管理全部Consumer并在
//! 订阅异常终止时替换它们，[`HealthCheckServer`] 提供可选的HTTP探针。
//!
//! ```rust,ignore
//! let mut registry = JobRegistry::new();
//! registry.register("SendEmail", Arc::new(SendEmail));
//!
//! let supervisor = Supervisor::with_default_reporter(
//!     config,
//!     Arc::new(AmqpConnector::new(&config.rabbitmq)),
//!     Arc::new(registry),
//! )
//! .await?;
//! supervisor.start().await?;
//! ```

pub mod consumer;
pub mod error_reporter;
pub mod health_check;
pub mod supervisor;

pub use consumer::{Consumer, ConsumerEvent, JobOutcome};
pub use error_reporter::{error_chain, ErrorContext, ErrorReporter, LoggingErrorReporter};
pub use health_check::{prometheus_handle, HealthCheckServer};
pub use supervisor::Supervisor;
