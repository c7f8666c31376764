//! Bridge configuration

use crate::error::{BridgeError, Result};
use std::borrow::Cow;
use std::time::Duration;

/// Longest service type the discovery layer accepts
pub const MAX_SERVICE_TYPE_LEN: usize = 15;

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Service type advertised and browsed for.
    /// 1-15 characters: lowercase ASCII letters, digits and hyphens.
    pub service_type: String,

    /// Stable application-level identifier of this node
    pub peer_identifier: String,

    /// Deadline for `connect_to_peer`
    pub connect_timeout: Duration,

    /// How long to wait for the remote peer to dial back after a
    /// reverse-connect request
    pub reverse_connect_timeout: Duration,

    /// Forwarding buffer per relay direction
    pub relay_buffer_size: usize,

    /// Periodically stop and restart advertising, if set
    pub advertisement_reset_interval: Option<Duration>,

    /// Application events buffered before new ones are dropped
    pub event_channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            service_type: "peerbridge".to_string(),
            peer_identifier: String::new(),
            connect_timeout: Duration::from_secs(30),
            reverse_connect_timeout: Duration::from_secs(15),
            relay_buffer_size: 64 * 1024,
            advertisement_reset_interval: None,
            event_channel_capacity: 256,
        }
    }
}

impl BridgeConfig {
    /// Configuration for `peer_identifier` with defaults for the rest
    pub fn new(service_type: impl Into<String>, peer_identifier: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            peer_identifier: peer_identifier.into(),
            ..Self::default()
        }
    }

    /// Check every field, returning the first violation found
    pub fn validate(&self) -> Result<()> {
        validate_service_type(&self.service_type)?;

        if self.peer_identifier.is_empty() {
            return Err(BridgeError::InvalidConfig(Cow::Borrowed(
                "peer_identifier must not be empty",
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(Cow::Borrowed(
                "connect_timeout must be positive",
            )));
        }
        if self.reverse_connect_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(Cow::Borrowed(
                "reverse_connect_timeout must be positive",
            )));
        }
        if self.relay_buffer_size == 0 {
            return Err(BridgeError::InvalidConfig(Cow::Borrowed(
                "relay_buffer_size must be positive",
            )));
        }
        if self.advertisement_reset_interval.is_some_and(|d| d.is_zero()) {
            return Err(BridgeError::InvalidConfig(Cow::Borrowed(
                "advertisement_reset_interval must be positive when set",
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(BridgeError::InvalidConfig(Cow::Borrowed(
                "event_channel_capacity must be positive",
            )));
        }
        Ok(())
    }
}

fn validate_service_type(service_type: &str) -> Result<()> {
    if service_type.is_empty() || service_type.len() > MAX_SERVICE_TYPE_LEN {
        return Err(BridgeError::InvalidConfig(Cow::Owned(format!(
            "service_type must be 1-{} characters, got {}",
            MAX_SERVICE_TYPE_LEN,
            service_type.len()
        ))));
    }
    if let Some(c) = service_type
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(BridgeError::InvalidConfig(Cow::Owned(format!(
            "service_type contains invalid character {:?}",
            c
        ))));
    }
    Ok(())
}
