//! Server configuration.
//!
//! Defaults suit a single local instance. Deployments override them with
//! environment variables:
//!
//! | variable                     | field                     | default                 |
//! |------------------------------|---------------------------|-------------------------|
//! | `DOCLET_COLLAB_ADDR`         | `bind_addr`               | `0.0.0.0:8090`          |
//! | `DOCLET_NATS_URL`            | `broker_url`              | `nats://127.0.0.1:4222` |
//! | `DOCLET_SUBJECT_NAMESPACE`   | `subject_namespace`       | `doclet`                |
//! | `DOCLET_QUEUE_CAPACITY`      | `outbound_queue_capacity` | `256`                   |
//! | `DOCLET_MAX_FRAME_BYTES`     | `max_frame_bytes`         | `1048576`               |
//! | `DOCLET_READ_TIMEOUT_SECS`   | `read_timeout`            | `60`                    |
//! | `DOCLET_KEEPALIVE_SECS`      | `keepalive_interval`      | `30`                    |
//! | `DOCLET_SHUTDOWN_GRACE_SECS` | `shutdown_grace`          | `10`                    |

use std::time::Duration;

use crate::subject::DEFAULT_NAMESPACE;

pub const ENV_ADDR: &str = "DOCLET_COLLAB_ADDR";
pub const ENV_NATS_URL: &str = "DOCLET_NATS_URL";
pub const ENV_NAMESPACE: &str = "DOCLET_SUBJECT_NAMESPACE";
pub const ENV_QUEUE_CAPACITY: &str = "DOCLET_QUEUE_CAPACITY";
pub const ENV_MAX_FRAME_BYTES: &str = "DOCLET_MAX_FRAME_BYTES";
pub const ENV_READ_TIMEOUT: &str = "DOCLET_READ_TIMEOUT_SECS";
pub const ENV_KEEPALIVE: &str = "DOCLET_KEEPALIVE_SECS";
pub const ENV_SHUTDOWN_GRACE: &str = "DOCLET_SHUTDOWN_GRACE_SECS";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broker connection URL
    pub broker_url: String,
    /// First token of every broker subject
    pub subject_namespace: String,
    /// Outbound messages buffered per connection before drops
    pub outbound_queue_capacity: usize,
    /// Largest accepted inbound frame
    pub max_frame_bytes: usize,
    /// Silence after which a connection is dropped
    pub read_timeout: Duration,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// How long shutdown waits for connections to finish
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8090".to_string(),
            broker_url: "nats://127.0.0.1:4222".to_string(),
            subject_namespace: DEFAULT_NAMESPACE.to_string(),
            outbound_queue_capacity: 256,
            max_frame_bytes: 1 << 20,
            read_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(addr) = get(ENV_ADDR) {
            config.bind_addr = normalize_addr(&addr);
        }
        if let Some(url) = get(ENV_NATS_URL) {
            config.broker_url = url;
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            // Blank is rejected by validate() rather than defaulted.
            config.subject_namespace = namespace.trim().to_string();
        }
        if let Some(raw) = get(ENV_QUEUE_CAPACITY) {
            config.outbound_queue_capacity = parse_number(ENV_QUEUE_CAPACITY, &raw)?;
        }
        if let Some(raw) = get(ENV_MAX_FRAME_BYTES) {
            config.max_frame_bytes = parse_number(ENV_MAX_FRAME_BYTES, &raw)?;
        }
        if let Some(raw) = get(ENV_READ_TIMEOUT) {
            config.read_timeout = Duration::from_secs(parse_number(ENV_READ_TIMEOUT, &raw)?);
        }
        if let Some(raw) = get(ENV_KEEPALIVE) {
            config.keepalive_interval = Duration::from_secs(parse_number(ENV_KEEPALIVE, &raw)?);
        }
        if let Some(raw) = get(ENV_SHUTDOWN_GRACE) {
            config.shutdown_grace = Duration::from_secs(parse_number(ENV_SHUTDOWN_GRACE, &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject_namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Zero("outbound_queue_capacity"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Zero("max_frame_bytes"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Zero("read_timeout"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Zero("keepalive_interval"));
        }
        if self.keepalive_interval >= self.read_timeout {
            return Err(ConfigError::KeepaliveTooLong {
                keepalive: self.keepalive_interval,
                read_timeout: self.read_timeout,
            });
        }
        Ok(())
    }
}

/// `":8090"` binds every interface.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: raw.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("keepalive interval {keepalive:?} must be shorter than read timeout {read_timeout:?}")]
    KeepaliveTooLong {
        keepalive: Duration,
        read_timeout: Duration,
    },
    #[error("subject namespace must not be empty")]
    EmptyNamespace,
}
