//! Seams between the consumer state machine and the broker client.
//!
//! The consumer only talks to these traits. `connection.rs` and `channel.rs`
//! implement them on top of lapin.

use std::sync::Arc;

use async_trait::async_trait;

use super::event::{EventSink, Generation};
use crate::config::ConnectionInfo;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens one connection. Unexpected closes are reported by posting
    /// `Event::ConnectionClosed` tagged with `generation` into `events`.
    async fn connect(
        &self,
        info: &ConnectionInfo,
        url: &str,
        generation: Generation,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Subscribes to `queue` and returns the broker-assigned consumer tag.
    /// Deliveries, broker-side cancellation and channel loss are posted to
    /// `events` tagged with `generation`.
    async fn consume(
        &self,
        queue: &str,
        generation: Generation,
        events: EventSink,
    ) -> Result<String, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    ConnectionFailed(String),

    #[error("Failed to create channel: {0}")]
    ChannelFailed(String),

    #[error("Failed to configure channel QoS: {0}")]
    QosFailed(String),

    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(String),

    #[error("Failed to cancel consumer: {0}")]
    CancelFailed(String),

    #[error("Failed to ack delivery {delivery_tag}: {reason}")]
    AckFailed { delivery_tag: u64, reason: String },

    #[error("Failed to nack delivery {delivery_tag}: {reason}")]
    NackFailed { delivery_tag: u64, reason: String },

    #[error("Failed to close: {0}")]
    CloseFailed(String),

    #[error("Failed to publish: {0}")]
    PublishFailed(String),

    #[error("No open channel")]
    NoChannel,
}

impl BrokerError {
    /// Connection refusals and unreachable brokers, the only errors worth retrying on open.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::ConnectionFailed(_))
    }
}
