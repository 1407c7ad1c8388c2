use std::sync::Arc;

use async_trait::async_trait;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::LongString;
use lapin::{Connection, ConnectionProperties};
use tracing::{error, info, warn};

use super::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError};
use super::channel::RabbitMqChannel;
use super::event::{Event, EventSink, Generation};
use crate::config::{ConnectionInfo, TlsOptions};

/// Opens lapin connections for the consumer.
pub struct LapinBroker {
    connection_name: String,
}

impl LapinBroker {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(
        &self,
        info: &ConnectionInfo,
        url: &str,
        generation: Generation,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = RabbitMqConnection::connect(info, url, &self.connection_name).await?;

        connection.get_connection().on_error(move |err| {
            let code = close_code(&err);
            warn!(generation, code, error = %err, "RabbitMQ connection lost");
            events.post(Event::ConnectionClosed {
                generation,
                code,
                reason: err.to_string(),
            });
        });

        Ok(Arc::new(connection))
    }
}

/// Reply code carried by a broker-side close, 0 when the error has none.
pub(crate) fn close_code(err: &lapin::Error) -> u16 {
    match err {
        lapin::Error::ProtocolError(amqp_error) => amqp_error.get_id(),
        _ => 0,
    }
}

pub struct RabbitMqConnection {
    connection: Connection,
    host: String,
}

impl RabbitMqConnection {
    pub async fn connect(
        info: &ConnectionInfo,
        url: &str,
        connection_name: &str,
    ) -> Result<Self, BrokerError> {
        info!(
            host = %info.host,
            port = info.port,
            virtual_host = %info.virtual_host,
            tls = info.tls.enabled,
            "Connecting to RabbitMQ"
        );

        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_string()));

        let connection = if info.tls.enabled {
            let tls = tls_config(&info.tls)?;
            Connection::connect_with_config(url, properties, tls).await
        } else {
            Connection::connect(url, properties).await
        }
        .map_err(|e| {
            error!(error = %e, host = %info.host, "Failed to connect to RabbitMQ");
            BrokerError::ConnectionFailed(e.to_string())
        })?;

        info!(host = %info.host, "Successfully connected to RabbitMQ");

        Ok(Self {
            connection,
            host: info.host.clone(),
        })
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = RabbitMqChannel::create(&self.connection).await?;
        Ok(Arc::new(channel))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Ok(());
        }

        info!(host = %self.host, code, reason, "Closing RabbitMQ connection");

        self.connection.close(code, reason).await.map_err(|e| {
            error!(error = %e, "Failed to close RabbitMQ connection gracefully");
            BrokerError::CloseFailed(e.to_string())
        })?;

        info!("RabbitMQ connection closed successfully");
        Ok(())
    }
}

fn tls_config(tls: &TlsOptions) -> Result<OwnedTLSConfig, BrokerError> {
    if !tls.ca_verify {
        warn!("Certificate verification cannot be disabled, verifying against the configured CA");
    }

    let cert_chain = tls
        .ca_cert
        .as_ref()
        .map(std::fs::read_to_string)
        .transpose()
        .map_err(|e| BrokerError::ConnectionFailed(format!("Unreadable CA certificate: {}", e)))?;

    let identity = tls
        .client_cert
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .map_err(|e| BrokerError::ConnectionFailed(format!("Unreadable client certificate: {}", e)))?
        .map(|der| OwnedIdentity {
            der,
            password: tls.client_cert_password.clone(),
        });

    Ok(OwnedTLSConfig {
        identity,
        cert_chain,
    })
}
