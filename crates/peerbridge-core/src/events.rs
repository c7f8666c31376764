//! Application-facing events and value types

use peerbridge_transport::PeerHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Result of a successful `connect_to_peer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnection {
    /// The local app reaches the remote service at `127.0.0.1:listening_port`
    Forward {
        /// Port of the local listening relay
        listening_port: u16,
    },
    /// The link was realized by reverse connect: the remote peer is already
    /// connected to the local service at `server_port`, arriving from the
    /// local port `client_port`
    Incoming {
        /// Local port of the relay's connection to the service
        client_port: u16,
        /// Port of the local service
        server_port: u16,
    },
}

impl PeerConnection {
    /// Listening port, or 0 when the connection is incoming
    pub fn listening_port(&self) -> u16 {
        match self {
            PeerConnection::Forward { listening_port } => *listening_port,
            PeerConnection::Incoming { .. } => 0,
        }
    }

    /// Whether the connection was realized by reverse connect
    pub fn is_incoming(&self) -> bool {
        matches!(self, PeerConnection::Incoming { .. })
    }
}

/// Discovery status of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAvailability {
    /// Application-level identifier
    pub peer_identifier: String,
    /// Whether the peer is currently discoverable
    pub available: bool,
    /// Bumped each time the peer is found again after being lost
    pub generation: u64,
}

/// State of one radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    /// Radio is on
    On,
    /// Radio is off
    Off,
    /// Radio exists but cannot be used
    Unavailable,
    /// Device has no such radio
    NotHere,
    /// State is irrelevant on this platform
    DoNotCare,
}

/// Radio and network status reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Wi-Fi radio
    pub wifi: RadioState,
    /// Classic Bluetooth radio
    pub bluetooth: RadioState,
    /// Bluetooth Low Energy radio
    pub bluetooth_low_energy: RadioState,
    /// Cellular radio
    pub cellular: RadioState,
    /// SSID of the joined Wi-Fi network
    pub ssid: Option<String>,
    /// BSSID of the joined Wi-Fi access point
    pub bssid: Option<String>,
}

impl NetworkStatus {
    /// Whether peer connections are impossible (Wi-Fi and Bluetooth off)
    pub fn radios_off(&self) -> bool {
        self.wifi == RadioState::Off && self.bluetooth == RadioState::Off
    }
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeEvent {
    /// One or more peers changed availability
    PeerAvailabilityChanged(Vec<PeerAvailability>),

    /// Reported network status changed
    NetworkChanged(NetworkStatus),

    /// A relay could not reach the local service
    IncomingConnectionFailed {
        /// Local service port
        server_port: u16,
    },

    /// Discovery or advertising was started or stopped
    DiscoveryAdvertisingStateUpdate {
        /// Browsing active
        discovery_active: bool,
        /// Advertising active
        advertising_active: bool,
    },

    /// A remote peer asked us to dial it; the local relay for
    /// `peer_identifier` now listens on `port`
    ReverseConnectionListening {
        /// Remote peer
        peer_identifier: String,
        /// Local listening port
        port: u16,
    },

    /// An established link to the peer ended
    PeerDisconnected {
        /// Remote peer
        peer_identifier: String,
    },
}

/// Events exchanged between the client and server managers.
///
/// Each manager sends these to the coordinator, which routes them to the
/// other role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A forward dial was refused as unreachable; ask the peer to dial us
    ReverseConnectNeeded {
        /// Remote peer
        peer_identifier: String,
        /// Transport handle to signal
        handle: PeerHandle,
    },
    /// An inbound session finished connecting to the local service.
    /// `client_port == 0` means the service was unreachable.
    InboundCompleted {
        /// Remote peer
        peer_identifier: String,
        /// Local port of the relay's service connection
        client_port: u16,
        /// Local service port
        server_port: u16,
    },
}

/// Sending half of the application event channel.
///
/// The channel is bounded; once the application falls behind by the
/// configured capacity further events are dropped with a warning rather
/// than stalling session tasks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<BridgeEvent>,
}

impl EventSink {
    /// Create a sink and its receiver
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Deliver an event, dropping it if the receiver is full or gone
    pub fn emit(&self, event: BridgeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("Event receiver dropped");
            }
        }
    }
}
