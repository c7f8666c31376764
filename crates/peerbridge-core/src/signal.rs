//! Side-channel signals exchanged during reverse-connect negotiation.
//!
//! Signals travel over the transport's out-of-band channel
//! (`PeerTransport::send_signal`) and are encoded with `bincode`.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Largest payload accepted as a signal
pub const MAX_SIGNAL_SIZE: usize = 1024;

/// Signal codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// Encoding failed
    #[error("Signal serialization failed: {0}")]
    Serialization(String),

    /// Decoding failed
    #[error("Signal deserialization failed: {0}")]
    Deserialization(String),

    /// Payload exceeds `MAX_SIGNAL_SIZE`
    #[error("Signal too large: {0} bytes")]
    TooLarge(usize),
}

impl From<SignalError> for BridgeError {
    fn from(err: SignalError) -> Self {
        BridgeError::Signal(Cow::Owned(err.to_string()))
    }
}

/// Reverse-connect negotiation messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// The sender cannot dial us; dial it instead. `server_port` is the
    /// sender's local service port.
    ReverseConnectRequest {
        /// Service port on the requesting side
        server_port: u16,
    },

    /// The receiver of a `ReverseConnectRequest` could not dial back
    ReverseConnectFailed {
        /// Human-readable reason
        reason: String,
    },
}

impl Signal {
    /// Encode for the side channel
    pub fn to_bytes(&self) -> Result<Vec<u8>, SignalError> {
        let bytes =
            bincode::serialize(self).map_err(|e| SignalError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_SIGNAL_SIZE {
            return Err(SignalError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Decode a side-channel payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignalError> {
        if bytes.len() > MAX_SIGNAL_SIZE {
            return Err(SignalError::TooLarge(bytes.len()));
        }
        bincode::deserialize(bytes).map_err(|e| SignalError::Deserialization(e.to_string()))
    }

    /// Short name for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            Signal::ReverseConnectRequest { .. } => "ReverseConnectRequest",
            Signal::ReverseConnectFailed { .. } => "ReverseConnectFailed",
        }
    }
}
