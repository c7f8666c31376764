//! Error types for the bridge
//!
//! Every asynchronous request resolves with either a value or one of these
//! errors. Transport and socket errors are translated into this taxonomy at
//! the session and relay boundary and never reach the caller raw.
//!
//! # Error Categories
//!
//! - **Transient**: the same request may succeed later (peer out of reach,
//!   link dropped, local app not yet listening)
//! - **Permanent**: retrying without intervention is pointless (unknown
//!   peer, invalid configuration, radios off, shut down)

use peerbridge_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in bridge operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // ============ Connect Errors ============
    /// No session is known for the identifier
    #[error("Unknown peer: {0}")]
    PeerUnknown(Cow<'static, str>),

    /// The transport could not establish a link (including timeouts)
    #[error("Transport connect failed: {0}")]
    TransportConnectFailed(Cow<'static, str>),

    /// Binding the local listening socket failed
    #[error("Local listen failed: {0}")]
    LocalListenFailed(Cow<'static, str>),

    /// The local application did not accept the relay connection
    #[error("did not connect with server port {port}")]
    LocalAppUnreachable {
        /// Port the relay tried to reach
        port: u16,
    },

    /// An established link dropped
    #[error("Link failure: {0}")]
    LinkFailure(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Both Wi-Fi and Bluetooth are reported off
    #[error("Radio turned off")]
    RadioTurnedOff,

    // ============ Operational Errors ============
    /// Starting or stopping advertising/browsing failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Side-channel signal could not be encoded or decoded
    #[error("Signal error: {0}")]
    Signal(Cow<'static, str>),

    /// The bridge has been shut down
    #[error("Bridge is shut down")]
    Shutdown,
}

impl BridgeError {
    /// Returns true if the failure may clear up on its own
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportConnectFailed(_)
                | BridgeError::LocalAppUnreachable { .. }
                | BridgeError::LinkFailure(_)
                | BridgeError::Transport(_)
        )
    }

    /// Returns true if retrying without intervention will not help
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BridgeError::PeerUnknown(_)
                | BridgeError::InvalidConfig(_)
                | BridgeError::RadioTurnedOff
                | BridgeError::Shutdown
        )
    }

    /// Create a connect failure with static context (zero allocation)
    #[must_use]
    pub const fn connect_failed(context: &'static str) -> Self {
        BridgeError::TransportConnectFailed(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        BridgeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a link failure with static context (zero allocation)
    #[must_use]
    pub const fn link_failure(context: &'static str) -> Self {
        BridgeError::LinkFailure(Cow::Borrowed(context))
    }

    /// Unknown peer error for `identifier`
    #[must_use]
    pub fn peer_unknown(identifier: &str) -> Self {
        BridgeError::PeerUnknown(Cow::Owned(identifier.to_string()))
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        BridgeError::Transport(Cow::Owned(err.to_string()))
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
