//! Dispatching deliveries to the processor and settling them once processed.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::RequestConsumer;
use crate::contracts::{Delivery, DeliveryInfo, Headers, ProcessingOutcome, Request};
use crate::messaging::broker::{BrokerChannel, BrokerError};
use crate::messaging::event::{Event, Generation};
use crate::messaging::handler::ProcessingTask;
use crate::messaging::republish::{RepublishError, RepublishMessage};

impl RequestConsumer {
    /// Hands one delivery to the processor and tracks the returned task.
    pub(super) async fn on_message(&mut self, delivery: Delivery) {
        let Delivery {
            info,
            headers,
            body,
        } = delivery;
        let body = body.into_text();

        debug!(
            delivery_tag = info.delivery_tag,
            routing_key = %info.routing_key,
            redelivered = info.redelivered,
            "Received message"
        );

        match self.processor.process(body, headers) {
            Ok(task) => self.track(info, task),
            Err(err) => {
                error!(
                    error = %err,
                    delivery_tag = info.delivery_tag,
                    "Processing callback failed before producing a task"
                );
                let outcome = ProcessingOutcome::failure(err.to_string());
                self.on_message_complete(self.generation, info, outcome).await;
            }
        }
    }

    fn track(&self, info: DeliveryInfo, task: ProcessingTask) {
        let events = self.events.clone();
        let metrics = Arc::clone(&self.metrics);
        let finished = self.finished.clone();
        let panic = self.panic.clone();
        let generation = self.generation;
        let delivery_tag = info.delivery_tag;

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::spawn(task).await {
                Ok(outcome) => outcome,
                Err(join_err) => ProcessingOutcome::failure(format!(
                    "Processing task aborted: {}",
                    join_err
                )),
            };
            metrics.observe_processing(outcome.kind(), started.elapsed());

            events.post(Event::TaskCompleted {
                generation,
                info,
                outcome,
            });

            // Posted first: if the loop was still running, it drains this event itself.
            if finished.is_set() {
                error!(
                    delivery_tag,
                    "Processing finished after the consumer stopped, raising panic flag"
                );
                metrics.panics_total.inc();
                panic.set();
            }
        });
    }

    /// Settles a processed delivery with the broker.
    pub(super) async fn on_message_complete(
        &mut self,
        generation: Generation,
        info: DeliveryInfo,
        outcome: ProcessingOutcome,
    ) {
        self.metrics
            .deliveries_total
            .with_label_values(&[self.config.queue_name.as_str(), outcome.kind()])
            .inc();

        let fatal = outcome.is_fatal().then(|| outcome.to_string());

        match outcome {
            ProcessingOutcome::Success => {
                if let Err(err) = self.ack(generation, info.delivery_tag).await {
                    self.raise_panic(&format!("Acknowledgment failed: {}", err));
                }
            }
            ProcessingOutcome::Discard { reason } => {
                warn!(
                    delivery_tag = info.delivery_tag,
                    reason = %reason,
                    "Discarding message"
                );
                if let Err(err) = self.nack(generation, info.delivery_tag, false).await {
                    self.raise_panic(&format!("Negative acknowledgment failed: {}", err));
                }
            }
            ProcessingOutcome::Republish { request, headers } => {
                if let Err(err) = self.ack(generation, info.delivery_tag).await {
                    self.raise_panic(&format!("Acknowledgment failed: {}", err));
                    return;
                }
                self.republish(&info, *request, headers);
            }
            ProcessingOutcome::Failure { cause } => {
                error!(
                    delivery_tag = info.delivery_tag,
                    cause = %cause,
                    "Unclassified processing failure, requeueing message"
                );
                if let Err(err) = self.nack(generation, info.delivery_tag, true).await {
                    error!(error = %err, "Negative acknowledgment failed");
                }
            }
        }

        if let Some(reason) = fatal {
            self.raise_panic(&reason);
        }
    }

    async fn ack(&self, generation: Generation, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel_for(generation)?.ack(delivery_tag).await?;
        self.metrics.acks_total.inc();
        debug!(delivery_tag, "Message acknowledged");
        Ok(())
    }

    async fn nack(
        &self,
        generation: Generation,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.channel_for(generation)?
            .nack(delivery_tag, requeue)
            .await?;
        self.metrics
            .nacks_total
            .with_label_values(&[if requeue { "true" } else { "false" }])
            .inc();
        debug!(delivery_tag, requeue, "Message negatively acknowledged");
        Ok(())
    }

    /// Delivery tags are only meaningful on the channel that issued them.
    fn channel_for(&self, generation: Generation) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if generation != self.generation {
            return Err(BrokerError::NoChannel);
        }
        self.channel.clone().ok_or(BrokerError::NoChannel)
    }

    fn republish(&mut self, original: &DeliveryInfo, request: Request, headers: Headers) {
        let message = match RepublishMessage::for_request(original, &request, headers) {
            Ok(message) => message,
            Err(err) => {
                self.raise_panic(&format!("Could not build republish message: {}", err));
                return;
            }
        };

        let republisher = Arc::clone(&self.republisher);
        let panic = self.panic.clone();
        let events = self.events.clone();
        let request_id = request.id;

        tokio::spawn(async move {
            let result = republisher.republish(message).await;
            if let Err(err) = &result {
                error!(error = %err, request_id = %request_id, "Republish failed");
                panic.set();
            }
            events.post(Event::Republished { request_id, result });
        });
    }

    pub(super) fn on_republished(&mut self, request_id: &str, result: Result<(), RepublishError>) {
        match result {
            Ok(()) => {
                self.metrics
                    .republished_total
                    .with_label_values(&["ok"])
                    .inc();
                info!(request_id, "Request re-enqueued");
            }
            Err(err) => {
                self.metrics
                    .republished_total
                    .with_label_values(&["error"])
                    .inc();
                self.raise_panic(&format!("Republish of {} failed: {}", request_id, err));
            }
        }
    }

    /// Escalates a fatal condition to the host. The flag is never cleared here.
    fn raise_panic(&self, reason: &str) {
        error!(reason, "Fatal consumer condition, raising panic flag");
        self.metrics.panics_total.inc();
        self.panic.set();
    }
}
