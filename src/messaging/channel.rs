use async_trait::async_trait;
use futures::StreamExt;
use lapin::{Channel, Connection, options::*, types::FieldTable};
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, BrokerError};
use super::connection::close_code;
use super::event::{Event, EventSink, Generation};
use super::headers::from_field_table;
use crate::contracts::{Body, Delivery, DeliveryInfo};

/// A lapin channel driven by the consumer's event loop.
pub struct RabbitMqChannel {
    channel: Channel,
}

impl RabbitMqChannel {
    pub async fn create(connection: &Connection) -> Result<Self, BrokerError> {
        info!("Creating RabbitMQ channel");

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            BrokerError::ChannelFailed(e.to_string())
        })?;

        info!(channel_id = channel.id(), "Channel created successfully");
        Ok(Self { channel })
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        info!(channel_id = self.channel.id(), prefetch_count, "Configuring channel QoS");

        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to configure channel QoS");
                BrokerError::QosFailed(e.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        generation: Generation,
        events: EventSink,
    ) -> Result<String, BrokerError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue, "Failed to start consumer");
                BrokerError::ConsumeFailed(e.to_string())
            })?;

        let consumer_tag = consumer.tag().as_str().to_string();
        let channel = self.channel.clone();
        let tag = consumer_tag.clone();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => events.post(Event::Delivery {
                        generation,
                        delivery: into_delivery(delivery),
                    }),
                    Err(e) => {
                        warn!(error = %e, consumer_tag = %tag, "Delivery stream failed");
                        events.post(Event::ChannelClosed {
                            generation,
                            code: close_code(&e),
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }

            if channel.status().connected() {
                debug!(consumer_tag = %tag, "Delivery stream ended on a live channel");
                events.post(Event::ConsumerCancelled {
                    generation,
                    consumer_tag: tag,
                });
            } else {
                events.post(Event::ChannelClosed {
                    generation,
                    code: 0,
                    reason: "channel closed".to_string(),
                });
            }
        });

        Ok(consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::CancelFailed(e.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckFailed {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| BrokerError::NackFailed {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), BrokerError> {
        let channel_id = self.channel.id();
        info!(channel_id, code, reason, "Closing RabbitMQ channel");

        self.channel.close(code, reason).await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            BrokerError::CloseFailed(e.to_string())
        })?;

        info!(channel_id, "Channel closed successfully");
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Delivery {
        info: DeliveryInfo {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
        },
        headers,
        body: Body::Bytes(delivery.data),
    }
}
