//! Peer transport trait abstraction.
//!
//! This module defines the `PeerTransport` trait that abstracts over the
//! platform discovery/session layer (Multipeer Connectivity, Wi-Fi Direct,
//! the in-memory simulator, ...). Every notification is delivered on a
//! channel handed out by the call that started it, so callers never
//! register delegates.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// The peer cannot be reached from this side of the link
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// The peer is not (or no longer) known to the transport
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Advertising or browsing is already active
    #[error("Already active: {0}")]
    AlreadyActive(&'static str),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Opaque transport-level peer handle.
///
/// Handles are supplied by the discovery layer and are only meaningful to the
/// transport that produced them. They are not stable across restarts; the
/// application-level peer identifier is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle(Arc<str>);

impl PeerHandle {
    /// Wrap a transport-specific handle string
    pub fn new(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    /// Raw handle string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Link state as reported by the transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link
    NotConnected,
    /// Link establishment in progress
    Connecting,
    /// Link established
    Connected,
}

/// Byte stream carrying data from the remote peer
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Byte stream carrying data to the remote peer
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Input/output stream pair of one transport session
pub struct StreamPair {
    /// Data from the remote peer
    pub input: InputStream,
    /// Data to the remote peer
    pub output: OutputStream,
}

impl fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPair").finish_non_exhaustive()
    }
}

/// Events delivered on an open transport session
#[derive(Debug)]
pub enum SessionEvent {
    /// The link changed state
    StateChanged(LinkState),
    /// The stream pair became available
    StreamsAvailable(StreamPair),
}

/// Events delivered to a browsing peer
#[derive(Debug)]
pub enum BrowseEvent {
    /// A peer advertising the service was found
    PeerFound {
        /// Transport handle of the peer
        handle: PeerHandle,
        /// Application-level identifier the peer advertises
        peer_identifier: String,
    },
    /// A previously found peer is no longer discoverable
    PeerLost {
        /// Transport handle of the peer
        handle: PeerHandle,
    },
    /// Out-of-band signal from a peer
    Signal {
        /// Sender handle
        handle: PeerHandle,
        /// Opaque payload
        payload: Vec<u8>,
    },
}

/// Events delivered to an advertising peer
#[derive(Debug)]
pub enum AdvertiseEvent {
    /// A remote peer opened a session with us
    InboundSession {
        /// Transport handle of the dialing peer
        handle: PeerHandle,
        /// Application-level identifier the dialer presented
        peer_identifier: String,
        /// The inbound session
        session: TransportSession,
    },
}

/// Control surface of one physical link.
pub trait LinkControl: Send + Sync {
    /// Close the link. Both ends observe `LinkState::NotConnected`.
    /// Must be idempotent.
    fn close(&self);

    /// Whether the link has been closed
    fn is_closed(&self) -> bool;
}

/// One end of an open transport session.
///
/// Dropping the session closes the link.
pub struct TransportSession {
    handle: PeerHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    link: Arc<dyn LinkControl>,
}

impl TransportSession {
    /// Create a session from its event channel and link control
    pub fn new(
        handle: PeerHandle,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        link: Arc<dyn LinkControl>,
    ) -> Self {
        Self {
            handle,
            events,
            link,
        }
    }

    /// Handle of the remote peer
    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Wait for the next session event.
    ///
    /// Returns `None` once the transport has dropped the session.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Close the underlying link
    pub fn close(&self) {
        self.link.close();
    }

    /// Whether the underlying link has been closed
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("handle", &self.handle)
            .field("closed", &self.link.is_closed())
            .finish()
    }
}

/// Peer transport capability set.
///
/// # Examples
///
/// ```no_run
/// use peerbridge_transport::{BrowseEvent, MemoryNetwork, PeerTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let network = MemoryNetwork::new();
/// let alice = network.transport("alice");
/// let bob = network.transport("bob");
///
/// let _inbound = bob.advertise("echo", "bob-id", 8080).await?;
/// let mut events = alice.browse("echo").await?;
///
/// if let Some(BrowseEvent::PeerFound { handle, .. }) = events.recv().await {
///     let _session = alice.open_session(&handle, "alice-id").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start advertising `service_type` under `peer_identifier`.
    ///
    /// `server_port` is the local application port, announced so remote
    /// peers can describe the service they are reaching. Inbound sessions
    /// are delivered on the returned channel.
    ///
    /// # Errors
    /// Returns `TransportError::AlreadyActive` if already advertising.
    async fn advertise(
        &self,
        service_type: &str,
        peer_identifier: &str,
        server_port: u16,
    ) -> TransportResult<mpsc::UnboundedReceiver<AdvertiseEvent>>;

    /// Stop advertising. Existing sessions are not affected.
    async fn stop_advertising(&self) -> TransportResult<()>;

    /// Start browsing for peers advertising `service_type`.
    ///
    /// Discovery events and side-channel signals are delivered on the
    /// returned channel.
    ///
    /// # Errors
    /// Returns `TransportError::AlreadyActive` if already browsing.
    async fn browse(
        &self,
        service_type: &str,
    ) -> TransportResult<mpsc::UnboundedReceiver<BrowseEvent>>;

    /// Stop browsing. Existing sessions are not affected.
    async fn stop_browsing(&self) -> TransportResult<()>;

    /// Open a session with `peer`, presenting `local_identifier`.
    ///
    /// # Errors
    /// Returns `TransportError::Unreachable` when this side cannot originate
    /// a link to the peer, and `TransportError::PeerNotFound` when the peer
    /// no longer advertises.
    async fn open_session(
        &self,
        peer: &PeerHandle,
        local_identifier: &str,
    ) -> TransportResult<TransportSession>;

    /// Send a small out-of-band payload to `peer`.
    async fn send_signal(&self, peer: &PeerHandle, payload: &[u8]) -> TransportResult<()>;

    /// Whether advertising is active
    fn is_advertising(&self) -> bool;

    /// Whether browsing is active
    fn is_browsing(&self) -> bool;
}
