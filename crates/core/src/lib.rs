pub mod config;
pub mod constants;
pub mod logging;
pub mod models;
pub mod registry;
pub mod traits;

pub use crate::config::{
    AppConfig, HealthCheckConfig, ObservabilityConfig, PublisherConfig, QueueSpec,
    RabbitMqConfig, ReconnectAttempts,
};
pub use constants::*;
pub use models::{ExchangeTarget, JobEnvelope, OutboundItem, OutboundMessage};
pub use registry::{HandlerFactory, JobDescriptor, JobRegistry};
pub use traits::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, ExchangeDeclaration,
    ExchangeKind, FnJobHandler, IncomingDelivery, JobHandler, QueueArguments, QueueBinding,
    QueueDeclaration,
};

pub use cuniculus_errors::{CuniculusError, CuniculusResult};
