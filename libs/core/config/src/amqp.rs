use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::fmt;

/// RabbitMQ connection settings
///
/// Either assembled from the individual `RABBITMQ_*` variables or taken
/// verbatim from `AMQP_URL` when that is set.
#[derive(Clone)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval negotiated with the broker, in seconds
    pub heartbeat_secs: u16,
    /// Full connection URI, takes precedence over the fields above
    pub url: Option<String>,
}

impl AmqpConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Build the `amqp://` URI handed to the broker client.
    pub fn uri(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs
        )
    }

    /// Broker address without credentials, for logs.
    pub fn endpoint(&self) -> String {
        if let Some(url) = &self.url {
            let rest = url.split_once("://").map_or(url.as_str(), |(_, rest)| rest);
            return rest.rsplit_once('@').map_or(rest, |(_, host)| host).to_string();
        }

        format!("{}:{} (vhost {})", self.host, self.port, self.vhost)
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "admin".to_string(),
            password: "admin".to_string(),
            vhost: "/".to_string(),
            heartbeat_secs: 600,
            url: None,
        }
    }
}

impl fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("url", &self.url.as_ref().map(|_| "***"))
            .finish()
    }
}

impl FromEnv for AmqpConfig {
    /// Environment variables (all optional):
    /// - `AMQP_URL`: full connection URI
    /// - `RABBITMQ_HOST` (localhost), `RABBITMQ_PORT` (5672)
    /// - `RABBITMQ_USER` (admin), `RABBITMQ_PASS` (admin)
    /// - `RABBITMQ_VHOST` (/), `RABBITMQ_HEARTBEAT_SECS` (600)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            host: env_or_default("RABBITMQ_HOST", &defaults.host),
            port: env_parse("RABBITMQ_PORT", defaults.port)?,
            username: env_or_default("RABBITMQ_USER", &defaults.username),
            password: env_or_default("RABBITMQ_PASS", &defaults.password),
            vhost: env_or_default("RABBITMQ_VHOST", &defaults.vhost),
            heartbeat_secs: env_parse("RABBITMQ_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
            url: std::env::var("AMQP_URL").ok().filter(|url| !url.is_empty()),
        })
    }
}
