// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Configuration
//!
//! `ConnectionConfig` describes how to reach a broker and how aggressively to
//! retry. It is an immutable value once handed to a
//! [`ConnectionManager`](crate::manager::ConnectionManager) and doubles as the
//! key of the [`ConnectionRegistry`](crate::registry::ConnectionRegistry), so
//! it implements `Eq` and `Hash`.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::{env, fmt, time::Duration};

/// Connection settings for one logical broker connection.
///
/// Durations are kept in milliseconds so the struct stays hashable and
/// serializes to plain numbers.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hosts: Vec<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub tls: bool,
    pub connection_name: String,
    pub heartbeat_secs: u16,
    pub connect_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub consumer_retry_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hosts: vec!["localhost".to_owned()],
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            tls: false,
            connection_name: "rabbitmq-resilience".to_owned(),
            heartbeat_secs: 60,
            connect_timeout_ms: 10_000,
            retry_interval_ms: 5_000,
            consumer_retry_interval_ms: 10_000,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("tls", &self.tls)
            .field("connection_name", &self.connection_name)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("retry_interval_ms", &self.retry_interval_ms)
            .field("consumer_retry_interval_ms", &self.consumer_retry_interval_ms)
            .finish()
    }
}

impl ConnectionConfig {
    /// Creates a configuration for a single host with default settings.
    pub fn new(host: &str) -> ConnectionConfig {
        ConnectionConfig {
            hosts: vec![host.to_owned()],
            ..ConnectionConfig::default()
        }
    }

    /// Adds a fallback host, tried after the ones already configured.
    pub fn host(mut self, host: &str) -> Self {
        self.hosts.push(host.to_owned());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    /// Switches the URI scheme to `amqps`.
    pub fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    pub fn heartbeat(mut self, secs: u16) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Delay between two failed connection attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Delay between two attempts to activate consumers that failed to subscribe.
    pub fn consumer_retry_interval(mut self, interval: Duration) -> Self {
        self.consumer_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn consumer_retry_interval_duration(&self) -> Duration {
        Duration::from_millis(self.consumer_retry_interval_ms)
    }

    /// Checks the settings that would otherwise only fail at connect time.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.hosts.is_empty() || self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(AmqpError::InvalidConfig("at least one non-empty host".to_owned()));
        }

        if self.port == 0 {
            return Err(AmqpError::InvalidConfig("port must be non-zero".to_owned()));
        }

        if self.retry_interval_ms == 0 || self.consumer_retry_interval_ms == 0 {
            return Err(AmqpError::InvalidConfig(
                "retry intervals must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }

    /// Builds the AMQP URI used to reach `host`.
    ///
    /// Credentials and vhost are percent-encoded, so the default `/` vhost
    /// becomes `%2F`.
    pub fn uri(&self, host: &str) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };

        format!(
            "{}://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            scheme,
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs,
            self.connect_timeout_ms
        )
    }

    /// Reads the configuration from `RABBITMQ_*` environment variables.
    ///
    /// `RABBITMQ_HOST` accepts a comma separated list. Missing variables keep
    /// their default value.
    pub fn from_env() -> Result<ConnectionConfig, AmqpError> {
        let mut cfg = ConnectionConfig::default();

        if let Ok(hosts) = env::var("RABBITMQ_HOST") {
            cfg.hosts = hosts
                .split(',')
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if let Ok(user) = env::var("RABBITMQ_USER") {
            cfg.user = user;
        }
        if let Ok(password) = env::var("RABBITMQ_PASSWORD") {
            cfg.password = password;
        }
        if let Ok(vhost) = env::var("RABBITMQ_VHOST") {
            cfg.vhost = vhost;
        }
        if let Ok(name) = env::var("RABBITMQ_CONNECTION_NAME") {
            cfg.connection_name = name;
        }

        cfg.port = parse_env("RABBITMQ_PORT", cfg.port)?;
        cfg.tls = parse_env("RABBITMQ_TLS", cfg.tls)?;
        cfg.heartbeat_secs = parse_env("RABBITMQ_HEARTBEAT", cfg.heartbeat_secs)?;
        cfg.connect_timeout_ms = parse_env("RABBITMQ_CONNECT_TIMEOUT_MS", cfg.connect_timeout_ms)?;
        cfg.retry_interval_ms = parse_env("RABBITMQ_RETRY_INTERVAL_MS", cfg.retry_interval_ms)?;
        cfg.consumer_retry_interval_ms = parse_env(
            "RABBITMQ_CONSUMER_RETRY_INTERVAL_MS",
            cfg.consumer_retry_interval_ms,
        )?;

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, AmqpError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AmqpError::InvalidConfig(format!("{key}={raw}"))),
        Err(_) => Ok(default),
    }
}
