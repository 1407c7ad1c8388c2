//! Recording in-memory broker used by the consumer tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError};
use super::consumer::RequestConsumer;
use super::event::{Event, EventSink, Generation};
use super::handler::MockRequestProcessor;
use super::republish::MockRepublisher;
use super::signal::Signal;
use crate::config::{ConnectionInfo, ConsumerConfig, ConsumerConfigBuilder};
use crate::contracts::Delivery;
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect { generation: Generation },
    OpenChannel { connection: u64 },
    CloseConnection { connection: u64, code: u16 },
    Qos { prefetch_count: u16 },
    Consume { queue: String },
    Cancel { consumer_tag: String },
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, requeue: bool },
    CloseChannel { code: u16 },
}

/// Shared log of everything the consumer asked the broker to do.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    connect_failures: Mutex<u32>,
    connections: AtomicU64,
    fail_ack: AtomicBool,
    fail_nack: AtomicBool,
    fail_channel_open: AtomicBool,
    subscription: Mutex<Option<(Generation, EventSink)>>,
}

impl Recorder {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Ack { .. }))
            .collect()
    }

    pub fn nacks(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Nack { .. }))
            .collect()
    }

    pub fn connect_attempts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Connect { .. }))
            .count()
    }

    pub fn consume_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Consume { .. }))
            .count()
    }

    pub fn fail_next_connects(&self, count: u32) {
        *self.connect_failures.lock().unwrap() = count;
    }

    pub fn fail_ack(&self, fail: bool) {
        self.fail_ack.store(fail, Ordering::SeqCst);
    }

    pub fn fail_nack(&self, fail: bool) {
        self.fail_nack.store(fail, Ordering::SeqCst);
    }

    pub fn fail_channel_open(&self, fail: bool) {
        self.fail_channel_open.store(fail, Ordering::SeqCst);
    }

    /// Pushes a delivery through the active subscription, as the broker would.
    pub fn deliver(&self, delivery: Delivery) {
        let subscription = self.subscription.lock().unwrap();
        let (generation, events) = subscription.as_ref().expect("no active subscription");
        events.post(Event::Delivery {
            generation: *generation,
            delivery,
        });
    }
}

pub struct FakeBroker {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(
        &self,
        _info: &ConnectionInfo,
        _url: &str,
        generation: Generation,
        _events: EventSink,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.recorder.record(Call::Connect { generation });

        {
            let mut failures = self.recorder.connect_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BrokerError::ConnectionFailed("connection refused".to_string()));
            }
        }

        let id = self.recorder.connections.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(FakeConnection {
            id,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

struct FakeConnection {
    id: u64,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.recorder.record(Call::OpenChannel {
            connection: self.id,
        });
        if self.recorder.fail_channel_open.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelFailed("channel max reached".to_string()));
        }
        Ok(Arc::new(FakeChannel {
            recorder: Arc::clone(&self.recorder),
        }))
    }

    async fn close(&self, code: u16, _reason: &str) -> Result<(), BrokerError> {
        self.recorder.record(Call::CloseConnection {
            connection: self.id,
            code,
        });
        Ok(())
    }
}

struct FakeChannel {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.recorder.record(Call::Qos { prefetch_count });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        generation: Generation,
        events: EventSink,
    ) -> Result<String, BrokerError> {
        self.recorder.record(Call::Consume {
            queue: queue.to_string(),
        });
        *self.recorder.subscription.lock().unwrap() = Some((generation, events));
        Ok(format!("ctag-{}", generation))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.recorder.record(Call::Cancel {
            consumer_tag: consumer_tag.to_string(),
        });
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.recorder.record(Call::Ack { delivery_tag });
        if self.recorder.fail_ack.load(Ordering::SeqCst) {
            return Err(BrokerError::AckFailed {
                delivery_tag,
                reason: "channel closed".to_string(),
            });
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.recorder.record(Call::Nack {
            delivery_tag,
            requeue,
        });
        if self.recorder.fail_nack.load(Ordering::SeqCst) {
            return Err(BrokerError::NackFailed {
                delivery_tag,
                reason: "channel closed".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self, code: u16, _reason: &str) -> Result<(), BrokerError> {
        self.recorder.record(Call::CloseChannel { code });
        Ok(())
    }
}

/// A consumer wired to the fake broker, plus handles on its signals.
pub struct Harness {
    pub consumer: RequestConsumer,
    pub recorder: Arc<Recorder>,
    pub shutdown: Signal,
    pub panic: Signal,
}

impl Harness {
    pub fn config() -> ConsumerConfigBuilder {
        ConsumerConfig::builder("echo.1-0-0-dev0.default")
            .connect_retry_delay(Duration::from_millis(1))
            .reconnect_delay(Duration::from_millis(10))
    }

    pub fn new() -> Self {
        Self::with_config(Self::config().build())
    }

    pub fn with_config(config: ConsumerConfig) -> Self {
        Self::build(config, MockRequestProcessor::new(), MockRepublisher::new())
    }

    /// An unconnected consumer, for tests that drive it through `run`.
    pub fn with_components(processor: MockRequestProcessor, republisher: MockRepublisher) -> Self {
        Self::build(Self::config().build(), processor, republisher)
    }

    fn build(
        config: ConsumerConfig,
        processor: MockRequestProcessor,
        republisher: MockRepublisher,
    ) -> Self {
        let recorder = Arc::new(Recorder::default());
        let shutdown = Signal::new();
        let panic = Signal::new();

        let consumer = RequestConsumer::builder(ConnectionInfo::default(), config)
            .broker(Arc::new(FakeBroker {
                recorder: Arc::clone(&recorder),
            }))
            .processor(Arc::new(processor))
            .republisher(Arc::new(republisher))
            .shutdown_signal(shutdown.clone())
            .panic_signal(panic.clone())
            .metrics(Metrics::new().unwrap())
            .build()
            .unwrap();

        Self {
            consumer,
            recorder,
            shutdown,
            panic,
        }
    }

    /// A consumer that is connected and subscribed.
    pub async fn connected() -> Self {
        let mut harness = Self::new();
        harness.connect().await;
        harness
    }

    pub async fn connected_with(
        processor: MockRequestProcessor,
        republisher: MockRepublisher,
    ) -> Self {
        let mut harness = Self::with_components(processor, republisher);
        harness.connect().await;
        harness
    }

    pub async fn connect(&mut self) {
        self.connect_without_channel().await;
        self.consumer.step_until("channel_opened").await;
    }

    /// Connects and starts the loop without processing the channel-open result.
    pub async fn connect_without_channel(&mut self) {
        let connection = self
            .consumer
            .open_connection()
            .await
            .unwrap()
            .expect("shutdown already requested");
        self.consumer.start_loop(connection);
    }
}
