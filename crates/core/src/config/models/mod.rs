pub mod app_config;
pub mod observability;
pub mod publisher;
pub mod queue;
pub mod rabbitmq;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use observability::{HealthCheckConfig, ObservabilityConfig};
pub use publisher::{PublisherConfig, ReconnectAttempts};
pub use queue::QueueSpec;
pub use rabbitmq::RabbitMqConfig;
