pub mod amqp;
pub mod dispatcher;
pub mod outbound;
pub mod producer;
pub mod pub_worker;
pub mod topology;

pub use amqp::{AmqpChannel, AmqpConnection, AmqpConnector};
pub use dispatcher::{reconnect_backoff, Dispatcher, DispatcherSignal, DispatcherState};
pub use outbound::OutboundQueue;
pub use producer::Producer;
pub use pub_worker::PublisherWorker;
pub use topology::{declare, declare_configuration, declare_exchanges, JobQueue, TopologyPlan};
