//! # Cuniculus Testing Utils
//!
//! 测试用的broker替身、任务处理器和等待工具。
//!
//! - [`MockBroker`] - 实现broker trait的内存broker，支持direct/fanout路由、死信、
//!   TTL到期模拟、队列参数冲突、断线与订阅失败注入
//! - [`handlers`] - 记录调用、固定失败、panic、慢任务等处理器
//! - [`containers::RabbitMqTestContainer`] - 基于testcontainers的真实RabbitMQ
//!
//! ```toml
//! [dev-dependencies]
//! cuniculus-testing-utils = { path = "../testing-utils" }
//! ```

pub mod containers;
pub mod handlers;
pub mod helpers;
pub mod mock_broker;

pub use containers::*;
pub use handlers::*;
pub use helpers::*;
pub use mock_broker::*;
