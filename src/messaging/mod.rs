pub mod broker;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod event;
pub mod handler;
pub mod headers;
pub mod republish;
pub mod signal;

#[cfg(test)]
mod testing;

pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerError};
pub use connection::{LapinBroker, RabbitMqConnection};
pub use consumer::{ConsumerError, ConsumerHandle, LinkState, LoopState, RequestConsumer};
pub use handler::{ProcessingError, ProcessingTask, RequestProcessor};
pub use republish::{LapinRepublisher, RepublishError, RepublishMessage, Republisher};
pub use signal::Signal;
