//! The request consumer: one broker connection, one channel, one subscription.
//!
//! All connection, channel and subscription state lives in [`RequestConsumer`]
//! and is only touched from its event loop ([`RequestConsumer::run`]). Broker
//! callbacks, processing tasks and the host communicate with it by posting
//! [`Event`]s, so acks and nacks are always issued from the loop no matter
//! which worker finished the processing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError};
use super::event::{CLOSED_BY_SERVER, Event, EventSink, Generation, NORMAL_SHUTDOWN};
use super::handler::RequestProcessor;
use super::republish::Republisher;
use super::signal::Signal;
use crate::config::{ConfigError, ConnectionInfo, ConsumerConfig};
use crate::metrics::Metrics;

mod completion;

/// Lifecycle of the connection and of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

pub struct RequestConsumer {
    broker: Arc<dyn Broker>,
    republisher: Arc<dyn Republisher>,
    processor: Arc<dyn RequestProcessor>,
    connection_info: ConnectionInfo,
    amqp_url: String,
    config: ConsumerConfig,
    shutdown: Signal,
    panic: Signal,
    metrics: Arc<Metrics>,
    /// Set once the loop has stopped; completions after that cannot be settled.
    finished: Signal,

    events: EventSink,
    inbox: mpsc::UnboundedReceiver<Event>,

    generation: Generation,
    connection: Option<Arc<dyn BrokerConnection>>,
    connection_state: LinkState,
    channel: Option<Arc<dyn BrokerChannel>>,
    channel_state: LinkState,
    consumer_tag: Option<String>,
    /// Tag of the subscription this consumer cancelled itself.
    cancelled_tag: Option<String>,
    loop_state: LoopState,
    reconnect_scheduled: bool,
}

/// Cloneable control surface for the host process.
#[derive(Clone)]
pub struct ConsumerHandle {
    shutdown: Signal,
    panic: Signal,
    events: EventSink,
}

impl ConsumerHandle {
    /// Requests a graceful stop: the channel closes, then the connection, then the loop.
    pub fn stop(&self) {
        self.shutdown.set();
        self.events.post(Event::Stop);
    }

    pub fn is_panicked(&self) -> bool {
        self.panic.is_set()
    }

    pub async fn wait_for_panic(&self) {
        self.panic.wait().await
    }
}

pub struct RequestConsumerBuilder {
    connection_info: ConnectionInfo,
    amqp_url: Option<String>,
    config: ConsumerConfig,
    broker: Option<Arc<dyn Broker>>,
    republisher: Option<Arc<dyn Republisher>>,
    processor: Option<Arc<dyn RequestProcessor>>,
    shutdown: Signal,
    panic: Signal,
    metrics: Option<Arc<Metrics>>,
}

impl RequestConsumerBuilder {
    /// Defaults to the URL derived from the connection info.
    pub fn amqp_url(mut self, url: impl Into<String>) -> Self {
        self.amqp_url = Some(url.into());
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn republisher(mut self, republisher: Arc<dyn Republisher>) -> Self {
        self.republisher = Some(republisher);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn RequestProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn shutdown_signal(mut self, shutdown: Signal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn panic_signal(mut self, panic: Signal) -> Self {
        self.panic = panic;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<RequestConsumer, ConsumerError> {
        let (events, inbox) = EventSink::channel();
        let amqp_url = match self.amqp_url {
            Some(url) => url,
            None => self.connection_info.amqp_url()?,
        };

        Ok(RequestConsumer {
            broker: self.broker.ok_or(ConsumerError::Incomplete("broker"))?,
            republisher: self
                .republisher
                .ok_or(ConsumerError::Incomplete("republisher"))?,
            processor: self.processor.ok_or(ConsumerError::Incomplete("processor"))?,
            metrics: self.metrics.ok_or(ConsumerError::Incomplete("metrics"))?,
            connection_info: self.connection_info,
            amqp_url,
            config: self.config,
            shutdown: self.shutdown,
            panic: self.panic,
            finished: Signal::new(),
            events,
            inbox,
            generation: 0,
            connection: None,
            connection_state: LinkState::Closed,
            channel: None,
            channel_state: LinkState::Closed,
            consumer_tag: None,
            cancelled_tag: None,
            loop_state: LoopState::Idle,
            reconnect_scheduled: false,
        })
    }
}

impl RequestConsumer {
    pub fn builder(connection_info: ConnectionInfo, config: ConsumerConfig) -> RequestConsumerBuilder {
        RequestConsumerBuilder {
            connection_info,
            amqp_url: None,
            config,
            broker: None,
            republisher: None,
            processor: None,
            shutdown: Signal::new(),
            panic: Signal::new(),
            metrics: None,
        }
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            shutdown: self.shutdown.clone(),
            panic: self.panic.clone(),
            events: self.events.clone(),
        }
    }

    pub fn connection_state(&self) -> LinkState {
        self.connection_state
    }

    pub fn channel_state(&self) -> LinkState {
        self.channel_state
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    /// Connects and drives the event loop until it stops.
    ///
    /// Returns an error only when a connection cannot be (re)established
    /// within the configured retries. Everything else is reported through
    /// the panic signal.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        info!(queue = %self.config.queue_name, "Starting request consumer");

        let result = self.drive().await;
        self.settle_after_stop().await;

        info!(queue = %self.config.queue_name, "Request consumer stopped");
        result
    }

    async fn drive(&mut self) -> Result<(), ConsumerError> {
        match self.open_connection().await? {
            Some(connection) => self.start_loop(connection),
            None => {
                info!("Shutdown requested before connecting, consumer not started");
                return Ok(());
            }
        }

        while self.loop_state == LoopState::Running {
            let Some(event) = self.inbox.recv().await else {
                break;
            };
            self.handle_event(event).await?;
        }
        Ok(())
    }

    /// Completions still queued when the loop stops, or arriving later, have
    /// no channel left to settle on and escalate to the panic flag.
    async fn settle_after_stop(&mut self) {
        self.finished.set();
        self.channel = None;

        while let Ok(event) = self.inbox.try_recv() {
            if let Event::TaskCompleted {
                generation,
                info,
                outcome,
            } = event
            {
                self.on_message_complete(generation, info, outcome).await;
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), ConsumerError> {
        match event {
            Event::ConnectionClosed {
                generation,
                code,
                reason,
            } if self.is_current(generation) => self.on_connection_closed(code, &reason),
            Event::ChannelOpened {
                generation,
                channel,
            } if self.is_current(generation) => self.on_channel_open(channel).await,
            Event::ChannelOpenFailed { generation, error } if self.is_current(generation) => {
                error!(error = %error, generation, "Channel could not be opened");
                self.on_channel_closed(0, &error.to_string()).await
            }
            Event::ChannelClosed {
                generation,
                code,
                reason,
            } if self.is_current(generation) => self.on_channel_closed(code, &reason).await,
            Event::ConsumerCancelled {
                generation,
                consumer_tag,
            } if self.is_current(generation) => self.on_consumer_cancelled(&consumer_tag).await,
            Event::CancelOk { consumer_tag } => self.on_cancel_ok(&consumer_tag),
            Event::Delivery {
                generation,
                delivery,
            } if self.is_current(generation) => self.on_message(delivery).await,
            Event::TaskCompleted {
                generation,
                info,
                outcome,
            } => self.on_message_complete(generation, info, outcome).await,
            Event::Republished { request_id, result } => self.on_republished(&request_id, result),
            Event::Reconnect => self.reconnect().await?,
            Event::Stop => self.stop().await,
            stale => debug!(event = stale.name(), "Dropping event from a replaced connection"),
        }
        Ok(())
    }

    fn is_current(&self, generation: Generation) -> bool {
        generation == self.generation
    }

    // Connection supervision

    /// Opens a broker connection, retrying refused or unreachable brokers.
    ///
    /// Returns `None` without touching the network when shutdown is already
    /// requested. Once `max_connect_retries` retries are spent the last
    /// error is returned.
    pub async fn open_connection(
        &mut self,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, ConsumerError> {
        let mut retries = 0;

        while !self.shutdown.is_set() {
            self.generation += 1;
            let generation = self.generation;
            self.connection_state = LinkState::Opening;
            self.metrics.connection_attempts_total.inc();

            match self
                .broker
                .connect(
                    &self.connection_info,
                    &self.amqp_url,
                    generation,
                    self.events.clone(),
                )
                .await
            {
                Ok(connection) => {
                    self.connection_state = LinkState::Open;
                    info!(generation, "Broker connection established");
                    return Ok(Some(connection));
                }
                Err(err) if err.is_transient() && retries < self.config.max_connect_retries => {
                    retries += 1;
                    warn!(
                        error = %err,
                        attempt = retries,
                        max_retries = self.config.max_connect_retries,
                        "Broker connection failed, retrying"
                    );
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
                Err(err) => {
                    self.connection_state = LinkState::Closed;
                    error!(
                        error = %err,
                        attempts = retries + 1,
                        "Giving up on broker connection"
                    );
                    return Err(ConsumerError::Connect {
                        attempts: retries + 1,
                        source: err,
                    });
                }
            }
        }

        self.connection_state = LinkState::Closed;
        Ok(None)
    }

    pub(crate) fn start_loop(&mut self, connection: Arc<dyn BrokerConnection>) {
        self.connection = Some(connection);
        self.loop_state = LoopState::Running;
        debug!(generation = self.generation, "Event loop started");
        self.on_connection_open();
    }

    fn stop_loop(&mut self) {
        if self.loop_state == LoopState::Running {
            debug!(generation = self.generation, "Event loop stopped");
        }
        self.loop_state = LoopState::Stopped;
    }

    fn on_connection_open(&mut self) {
        self.open_channel();
    }

    pub fn on_connection_closed(&mut self, code: u16, reason: &str) {
        if self.connection_state == LinkState::Closed {
            debug!(code, "Connection already closed");
            return;
        }

        self.connection_state = LinkState::Closed;
        self.channel = None;
        self.channel_state = LinkState::Closed;
        self.clear_consumer_tag();

        if self.shutdown.is_set() {
            info!(code, reason, "Connection closed after shutdown request");
            self.stop_loop();
        } else if code == CLOSED_BY_SERVER {
            warn!(code, reason, "Connection closed by server, not reconnecting");
            self.stop_loop();
        } else {
            warn!(
                code,
                reason,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Connection closed unexpectedly, scheduling reconnect"
            );
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_scheduled = true;
        let events = self.events.clone();
        let delay = self.config.reconnect_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.post(Event::Reconnect);
        });
    }

    /// Replaces the closed connection, unless a shutdown was requested meanwhile.
    pub async fn reconnect(&mut self) -> Result<(), ConsumerError> {
        self.reconnect_scheduled = false;
        self.stop_loop();

        if self.shutdown.is_set() {
            info!("Shutdown requested, not reconnecting");
            return Ok(());
        }

        self.metrics.reconnects_total.inc();
        if let Some(connection) = self.open_connection().await? {
            self.start_loop(connection);
        }
        Ok(())
    }

    pub async fn close_connection(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        if matches!(self.connection_state, LinkState::Closing | LinkState::Closed) {
            return;
        }

        self.connection_state = LinkState::Closing;
        let (code, reason) = match connection.close(NORMAL_SHUTDOWN, "Normal shutdown").await {
            Ok(()) => (NORMAL_SHUTDOWN, "Normal shutdown".to_string()),
            Err(err) => {
                warn!(error = %err, "Connection did not close cleanly");
                (NORMAL_SHUTDOWN, err.to_string())
            }
        };

        self.events.post(Event::ConnectionClosed {
            generation: self.generation,
            code,
            reason,
        });
    }

    // Channel management

    /// Requests a channel from the live connection, the result arrives as an event.
    pub fn open_channel(&mut self) {
        let Some(connection) = self.connection.clone() else {
            warn!("No connection to open a channel on");
            return;
        };

        self.channel_state = LinkState::Opening;
        let events = self.events.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            match connection.open_channel().await {
                Ok(channel) => events.post(Event::ChannelOpened {
                    generation,
                    channel,
                }),
                Err(error) => events.post(Event::ChannelOpenFailed { generation, error }),
            }
        });
    }

    async fn on_channel_open(&mut self, channel: Arc<dyn BrokerChannel>) {
        if self.connection_state != LinkState::Open {
            debug!("Channel opened on a closing connection, ignoring");
            return;
        }

        info!(generation = self.generation, "Channel opened");
        self.channel = Some(channel);
        self.channel_state = LinkState::Open;
        self.start_consuming().await;
    }

    pub async fn close_channel(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        if matches!(self.channel_state, LinkState::Closing | LinkState::Closed) {
            return;
        }

        self.channel_state = LinkState::Closing;
        let (code, reason) = match channel.close(NORMAL_SHUTDOWN, "Normal shutdown").await {
            Ok(()) => (NORMAL_SHUTDOWN, "Normal shutdown".to_string()),
            Err(err) => {
                warn!(error = %err, "Channel did not close cleanly");
                (NORMAL_SHUTDOWN, err.to_string())
            }
        };

        self.events.post(Event::ChannelClosed {
            generation: self.generation,
            code,
            reason,
        });
    }

    /// A lost channel is not recovered on its own: the connection is closed
    /// and connection supervision decides whether to reconnect.
    pub async fn on_channel_closed(&mut self, code: u16, reason: &str) {
        if self.channel_state == LinkState::Closed {
            debug!(code, "Channel already closed");
            return;
        }

        info!(code, reason, "Channel closed, closing connection");
        self.channel = None;
        self.channel_state = LinkState::Closed;
        self.clear_consumer_tag();
        self.close_connection().await;
    }

    // Subscription

    pub async fn start_consuming(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        if let Err(err) = channel.qos(self.config.max_concurrent).await {
            error!(error = %err, "Failed to set prefetch, closing channel");
            self.close_channel().await;
            return;
        }

        match channel
            .consume(&self.config.queue_name, self.generation, self.events.clone())
            .await
        {
            Ok(consumer_tag) => {
                info!(
                    queue = %self.config.queue_name,
                    consumer_tag = %consumer_tag,
                    prefetch_count = self.config.max_concurrent,
                    "Consumer started successfully"
                );
                self.consumer_tag = Some(consumer_tag);
                self.metrics.active_consumers.inc();
            }
            Err(err) => {
                error!(error = %err, queue = %self.config.queue_name, "Failed to start consumer");
                self.close_channel().await;
            }
        }
    }

    pub async fn stop_consuming(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        let Some(consumer_tag) = self.consumer_tag.clone() else {
            return;
        };
        self.clear_consumer_tag();
        self.cancelled_tag = Some(consumer_tag.clone());

        info!(consumer_tag = %consumer_tag, "Cancelling consumer");
        match channel.cancel(&consumer_tag).await {
            Ok(()) => self.events.post(Event::CancelOk { consumer_tag }),
            Err(err) => warn!(error = %err, consumer_tag = %consumer_tag, "Failed to cancel consumer"),
        }
    }

    fn on_cancel_ok(&mut self, consumer_tag: &str) {
        debug!(consumer_tag, "Broker acknowledged consumer cancellation");
    }

    /// Any broker-side cancellation closes the channel, except the echo of
    /// a cancel issued by [`stop_consuming`](Self::stop_consuming).
    async fn on_consumer_cancelled(&mut self, consumer_tag: &str) {
        if self.cancelled_tag.as_deref() == Some(consumer_tag) {
            debug!(consumer_tag, "Subscription ended after our own cancel");
            self.cancelled_tag = None;
            return;
        }

        warn!(consumer_tag, "Consumer cancelled by broker, closing channel");
        self.clear_consumer_tag();
        self.close_channel().await;
    }

    fn clear_consumer_tag(&mut self) {
        if self.consumer_tag.take().is_some() {
            self.metrics.active_consumers.dec();
        }
    }

    /// Sets the shutdown signal and closes the channel; the close cascades
    /// to the connection and then stops the event loop.
    pub async fn stop(&mut self) {
        info!("Stopping request consumer");
        self.shutdown.set();

        if self.channel.is_some() {
            self.close_channel().await;
        } else {
            self.close_connection().await;
        }
    }

    /// Processes the next queued event.
    #[cfg(test)]
    pub(crate) async fn step(&mut self) -> &'static str {
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), self.inbox.recv())
            .await
            .expect("no event within a second")
            .expect("event queue closed");
        let name = event.name();
        self.handle_event(event).await.expect("event handling failed");
        name
    }

    /// Processes events until one named `name` has been handled.
    #[cfg(test)]
    pub(crate) async fn step_until(&mut self, name: &str) {
        for _ in 0..32 {
            if self.step().await == name {
                return;
            }
        }
        panic!("event {name} never arrived");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Could not connect to broker after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("Consumer is missing its {0}")]
    Incomplete(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
