use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::broker::{BrokerChannel, BrokerError};
use super::republish::RepublishError;
use crate::contracts::{Delivery, DeliveryInfo, ProcessingOutcome};

/// Identifies which connection an event belongs to. Bumped on every (re)connect.
pub type Generation = u64;

/// Reply code the broker uses when it forcibly closes a connection.
pub const CLOSED_BY_SERVER: u16 = 320;

/// Reply code for a clean, locally requested close.
pub const NORMAL_SHUTDOWN: u16 = 200;

/// Work items for the consumer's event loop.
pub enum Event {
    ConnectionClosed {
        generation: Generation,
        code: u16,
        reason: String,
    },
    ChannelOpened {
        generation: Generation,
        channel: Arc<dyn BrokerChannel>,
    },
    ChannelOpenFailed {
        generation: Generation,
        error: BrokerError,
    },
    ChannelClosed {
        generation: Generation,
        code: u16,
        reason: String,
    },
    ConsumerCancelled {
        generation: Generation,
        consumer_tag: String,
    },
    CancelOk {
        consumer_tag: String,
    },
    Delivery {
        generation: Generation,
        delivery: Delivery,
    },
    TaskCompleted {
        generation: Generation,
        info: DeliveryInfo,
        outcome: ProcessingOutcome,
    },
    Republished {
        request_id: String,
        result: Result<(), RepublishError>,
    },
    Reconnect,
    Stop,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ConnectionClosed { .. } => "connection_closed",
            Event::ChannelOpened { .. } => "channel_opened",
            Event::ChannelOpenFailed { .. } => "channel_open_failed",
            Event::ChannelClosed { .. } => "channel_closed",
            Event::ConsumerCancelled { .. } => "consumer_cancelled",
            Event::CancelOk { .. } => "cancel_ok",
            Event::Delivery { .. } => "delivery",
            Event::TaskCompleted { .. } => "task_completed",
            Event::Republished { .. } => "republished",
            Event::Reconnect => "reconnect",
            Event::Stop => "stop",
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Posting side of the event loop, cheap to clone into callbacks and tasks.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, event: Event) {
        if let Err(err) = self.tx.send(event) {
            debug!(event = err.0.name(), "Event loop gone, dropping event");
        }
    }
}
