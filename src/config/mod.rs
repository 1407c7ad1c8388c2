use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

const DEFAULT_MAX_CONCURRENT: u16 = 1;
const DEFAULT_MAX_CONNECT_RETRIES: u32 = 3;
const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// TLS settings for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    pub enabled: bool,
    /// PEM bundle of trusted certificate authorities.
    pub ca_cert: Option<PathBuf>,
    pub ca_verify: bool,
    /// PKCS#12 bundle holding the client certificate and key.
    pub client_cert: Option<PathBuf>,
    pub client_cert_password: String,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert: None,
            ca_verify: true,
            client_cert: None,
            client_cert_password: String::new(),
        }
    }
}

/// Where and how to reach the broker. Immutable once a consumer is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub virtual_host: String,
    pub tls: TlsOptions,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            tls: TlsOptions::default(),
        }
    }
}

impl ConnectionInfo {
    /// Builds the AMQP URL for this connection, `amqps` when TLS is enabled.
    ///
    /// Credentials are percent-encoded and the virtual host is a single path
    /// segment, so the default vhost `/` becomes `%2F`.
    pub fn amqp_url(&self) -> Result<String, ConfigError> {
        let scheme = if self.tls.enabled { "amqps" } else { "amqp" };
        let invalid = || ConfigError::InvalidUrl(format!("{}:{}", self.host, self.port));

        let mut url = Url::parse(&format!("{}://{}:{}", scheme, self.host, self.port))
            .map_err(|_| invalid())?;
        url.set_username(&self.user).map_err(|_| invalid())?;
        url.set_password(Some(&self.password))
            .map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .clear()
            .push(&self.virtual_host);

        Ok(url.into())
    }
}

/// Subscription and supervision settings for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub queue_name: String,
    /// Prefetch bound: unacknowledged deliveries the broker may hand over at once.
    pub max_concurrent: u16,
    pub max_connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub reconnect_delay: Duration,
}

impl ConsumerConfig {
    pub fn builder(queue_name: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            config: ConsumerConfig {
                queue_name: queue_name.into(),
                max_concurrent: DEFAULT_MAX_CONCURRENT,
                max_connect_retries: DEFAULT_MAX_CONNECT_RETRIES,
                connect_retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
                reconnect_delay: DEFAULT_RECONNECT_DELAY,
            },
        }
    }
}

pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn max_concurrent(mut self, max_concurrent: u16) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn max_connect_retries(mut self, retries: u32) -> Self {
        self.config.max_connect_retries = retries;
        self
    }

    pub fn connect_retry_delay(mut self, delay: Duration) -> Self {
        self.config.connect_retry_delay = delay;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

/// Process configuration for the worker binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionInfo,
    pub consumer: ConsumerConfig,
    pub service_name: String,
    pub metrics_port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_name =
            lookup("REQUEST_QUEUE").ok_or(ConfigError::MissingRequired("REQUEST_QUEUE"))?;

        let defaults = ConnectionInfo::default();
        let tls = TlsOptions {
            enabled: parse_or(&lookup, "RABBITMQ_TLS_ENABLED", false)?,
            ca_cert: lookup("RABBITMQ_TLS_CA_CERT").map(PathBuf::from),
            ca_verify: parse_or(&lookup, "RABBITMQ_TLS_CA_VERIFY", true)?,
            client_cert: lookup("RABBITMQ_TLS_CLIENT_CERT").map(PathBuf::from),
            client_cert_password: lookup("RABBITMQ_TLS_CLIENT_CERT_PASSWORD").unwrap_or_default(),
        };

        let connection = ConnectionInfo {
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "RABBITMQ_PORT", defaults.port)?,
            user: lookup("RABBITMQ_USER").unwrap_or(defaults.user),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            virtual_host: lookup("RABBITMQ_VHOST").unwrap_or(defaults.virtual_host),
            tls,
        };

        let consumer = ConsumerConfig::builder(queue_name)
            .max_concurrent(parse_or(&lookup, "MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT)?)
            .max_connect_retries(parse_or(
                &lookup,
                "MAX_CONNECT_RETRIES",
                DEFAULT_MAX_CONNECT_RETRIES,
            )?)
            .reconnect_delay(Duration::from_secs(parse_or(
                &lookup,
                "RECONNECT_DELAY_SECS",
                DEFAULT_RECONNECT_DELAY.as_secs(),
            )?))
            .build();

        Ok(Self {
            connection,
            consumer,
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "request-consumer".to_string()),
            metrics_port: parse_or(&lookup, "METRICS_PORT", 9090)?,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("Cannot build an AMQP URL for {0}")]
    InvalidUrl(String),
}
