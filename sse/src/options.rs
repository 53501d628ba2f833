//! Tunables for streams, the distributed registry and the backplane.
//!
//! Each option struct is validated once at startup; an invalid combination
//! is a configuration error and the process should not come up.

use crate::error::{config_error, ConfigErrorKind, Error};
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "sse";

/// Per-stream behavior shared by every connection.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// Reconnect delay suggested to clients through the `retry:` frame.
    pub retry_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on a single frame write before the connection is
    /// considered dead.
    pub write_timeout: Duration,
    /// Frames queued per connection before writers start waiting.
    pub buffer: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            buffer: 64,
        }
    }
}

impl StreamOptions {
    pub fn validate(self) -> Result<Self, Error> {
        if self.heartbeat_interval.is_zero() {
            return Err(config_error(
                ConfigErrorKind::InvalidInterval,
                "heartbeat interval must be greater than zero",
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(config_error(
                ConfigErrorKind::InvalidInterval,
                "write timeout must be greater than zero",
            ));
        }
        Ok(self)
    }
}

/// Remote-store settings for the distributed registry.
#[derive(Clone, Debug, PartialEq)]
pub struct DistributedOptions {
    pub redis_url: String,
    pub key_prefix: String,
    /// Expiry of every connection record; a crashed server's records vanish
    /// after at most this long.
    pub connection_ttl: Duration,
    /// Must be strictly shorter than `connection_ttl`.
    pub refresh_interval: Duration,
}

impl DistributedOptions {
    pub fn new(redis_url: Option<String>) -> Result<Self, Error> {
        let redis_url = redis_url.filter(|url| !url.trim().is_empty()).ok_or_else(|| {
            config_error(
                ConfigErrorKind::MissingConnectionString,
                "a Redis connection string is required for the distributed registry",
            )
        })?;
        Ok(Self {
            redis_url,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connection_ttl: Duration::from_secs(120),
            refresh_interval: Duration::from_secs(60),
        })
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_ttl(mut self, connection_ttl: Duration, refresh_interval: Duration) -> Self {
        self.connection_ttl = connection_ttl;
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn validate(self) -> Result<Self, Error> {
        validate_ttl(self.connection_ttl, self.refresh_interval)?;
        Ok(self)
    }
}

/// A refresh has to land before the records it extends expire.
pub fn validate_ttl(connection_ttl: Duration, refresh_interval: Duration) -> Result<(), Error> {
    if refresh_interval.is_zero() {
        return Err(config_error(
            ConfigErrorKind::InvalidInterval,
            "TTL refresh interval must be greater than zero",
        ));
    }
    if refresh_interval >= connection_ttl {
        return Err(config_error(
            ConfigErrorKind::TtlRefreshInterval,
            &format!(
                "TTL refresh interval ({}s) must be shorter than the connection TTL ({}s)",
                refresh_interval.as_secs_f64(),
                connection_ttl.as_secs_f64()
            ),
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackplaneOptions {
    pub channel_prefix: String,
}

impl Default for BackplaneOptions {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl BackplaneOptions {
    pub fn broadcast_channel(&self) -> String {
        format!("{}:broadcast", self.channel_prefix)
    }

    pub fn server_channel(&self, server_id: &str) -> String {
        format!("{}:server:{}", self.channel_prefix, server_id)
    }
}
