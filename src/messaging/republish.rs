//! Re-enqueueing of requests that asked to be retried.
//!
//! Each republish runs over its own short-lived connection so a slow or
//! failing broker round trip never touches the consumer's channel.

use async_trait::async_trait;
use lapin::{BasicProperties, Connection, options::BasicPublishOptions, types::ShortString};
use serde_json::Value;
use tracing::{info, warn};

use super::broker::BrokerError;
use super::connection::RabbitMqConnection;
use super::event::NORMAL_SHUTDOWN;
use super::headers::to_field_table;
use crate::config::ConnectionInfo;
use crate::contracts::{DeliveryInfo, Headers, Request};

/// Application id stamped on every republished request.
pub const APP_ID: &str = "beer-garden";
pub const CONTENT_TYPE: &str = "text/plain";
pub const REPUBLISH_PRIORITY: u8 = 1;
pub const REQUEST_ID_HEADER: &str = "request_id";

#[derive(Debug, Clone, PartialEq)]
pub struct RepublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: String,
    pub app_id: String,
    pub content_type: String,
    pub priority: u8,
    pub headers: Headers,
}

impl RepublishMessage {
    /// Builds the retry message for `request`, addressed like the original delivery.
    pub fn for_request(
        original: &DeliveryInfo,
        request: &Request,
        mut headers: Headers,
    ) -> Result<Self, RepublishError> {
        let body = request
            .to_body()
            .map_err(|e| RepublishError::Serialize(e.to_string()))?;

        headers.insert(
            REQUEST_ID_HEADER.to_string(),
            Value::String(request.id.clone()),
        );

        Ok(Self {
            exchange: original.exchange.clone(),
            routing_key: original.routing_key.clone(),
            body,
            app_id: APP_ID.to_string(),
            content_type: CONTENT_TYPE.to_string(),
            priority: REPUBLISH_PRIORITY,
            headers,
        })
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER).and_then(Value::as_str)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Republisher: Send + Sync {
    async fn republish(&self, message: RepublishMessage) -> Result<(), RepublishError>;
}

/// Publishes over a fresh lapin connection, closed again on every exit path.
pub struct LapinRepublisher {
    connection_info: ConnectionInfo,
    url: String,
}

impl LapinRepublisher {
    pub fn new(connection_info: ConnectionInfo, url: impl Into<String>) -> Self {
        Self {
            connection_info,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Republisher for LapinRepublisher {
    async fn republish(&self, message: RepublishMessage) -> Result<(), RepublishError> {
        let connection =
            RabbitMqConnection::connect(&self.connection_info, &self.url, "request-republisher")
                .await?;

        let published = publish_on(connection.get_connection(), &message).await;

        if let Err(e) = connection
            .get_connection()
            .close(NORMAL_SHUTDOWN, "Republish complete")
            .await
        {
            warn!(error = %e, "Failed to close republish connection");
        }

        if published.is_ok() {
            info!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                request_id = message.request_id().unwrap_or_default(),
                "Request republished"
            );
        }

        published
    }
}

async fn publish_on(connection: &Connection, message: &RepublishMessage) -> Result<(), RepublishError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| RepublishError::Broker(BrokerError::ChannelFailed(e.to_string())))?;

    let properties = BasicProperties::default()
        .with_app_id(ShortString::from(message.app_id.clone()))
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_priority(message.priority)
        .with_headers(to_field_table(&message.headers));

    let published = match channel
        .basic_publish(
            &message.exchange,
            &message.routing_key,
            BasicPublishOptions::default(),
            message.body.as_bytes(),
            properties,
        )
        .await
    {
        Ok(confirm) => confirm
            .await
            .map(|_| ())
            .map_err(|e| RepublishError::Broker(BrokerError::PublishFailed(e.to_string()))),
        Err(e) => Err(RepublishError::Broker(BrokerError::PublishFailed(e.to_string()))),
    };

    if let Err(e) = channel.close(NORMAL_SHUTDOWN, "Republish complete").await {
        warn!(error = %e, "Failed to close republish channel");
    }

    published
}

#[derive(Debug, thiserror::Error)]
pub enum RepublishError {
    #[error("Republish failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to serialize request: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn original() -> DeliveryInfo {
        DeliveryInfo {
            delivery_tag: 7,
            exchange: "beer_garden".to_string(),
            routing_key: "echo.1-0-0.default".to_string(),
            redelivered: false,
        }
    }

    #[test]
    fn test_message_addressed_like_original() {
        let request = Request::with_id("58542eb571afd47ead90d26a");
        let message = RepublishMessage::for_request(&original(), &request, Headers::new()).unwrap();

        assert_eq!(message.exchange, "beer_garden");
        assert_eq!(message.routing_key, "echo.1-0-0.default");
        assert!(message.body.contains("58542eb571afd47ead90d26a"));
        assert_eq!(message.app_id, "beer-garden");
        assert_eq!(message.content_type, "text/plain");
        assert_eq!(message.priority, 1);
        assert_eq!(message.request_id(), Some("58542eb571afd47ead90d26a"));
    }

    #[test]
    fn test_request_id_header_wins() {
        let mut headers = Headers::new();
        headers.insert("request_id".to_string(), json!("stale"));
        headers.insert("retry".to_string(), json!(2));

        let message =
            RepublishMessage::for_request(&original(), &Request::with_id("fresh"), headers).unwrap();

        assert_eq!(message.request_id(), Some("fresh"));
        assert_eq!(message.headers["retry"], json!(2));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_failure() {
        let info = ConnectionInfo {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let republisher = LapinRepublisher::new(info.clone(), info.amqp_url().unwrap());
        let message =
            RepublishMessage::for_request(&original(), &Request::with_id("abc"), Headers::new())
                .unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            republisher.republish(message),
        )
        .await
        .expect("connection attempt hung");

        assert!(matches!(
            result,
            Err(RepublishError::Broker(BrokerError::ConnectionFailed(_)))
        ));
    }
}
