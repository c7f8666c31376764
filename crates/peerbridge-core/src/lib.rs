//! # PeerBridge Core
//!
//! Bridges local TCP services across a peer-to-peer transport that offers
//! discovery and session byte streams but no notion of ports.
//!
//! This crate provides:
//! - The concurrent session registry keyed by peer identifier
//! - The per-peer session state machine
//! - Client and server socket relays between loopback TCP and peer streams
//! - Reverse-connect negotiation when only one side can dial
//! - The [`Coordinator`], a single entry point combining both roles
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Coordinator                             │
//! │   (connect/disconnect API, events, reverse-connect routing)     │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │         ClientManager          │         ServerManager          │
//! │   (browse, outbound connect)   │  (advertise, inbound accept)   │
//! ├────────────────────────────────┴────────────────────────────────┤
//! │                 SessionRegistry / PeerSession                   │
//! │   (one actor per peer, owns transport link and socket relay)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          PeerTransport                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod signal;

pub use client::ClientManager;
pub use config::BridgeConfig;
pub use coordinator::Coordinator;
pub use error::{BridgeError, Result};
pub use events::{
    BridgeEvent, EventSink, ManagerEvent, NetworkStatus, PeerAvailability, PeerConnection,
    RadioState,
};
pub use registry::{PeerKey, SessionRegistry};
pub use relay::{ClientSocketRelay, RelayError, RelayEvent, ServerSocketRelay, SocketRelay};
pub use server::{ResetCallback, ServerManager};
pub use session::{Attempt, PeerSession, Role, SessionSnapshot};
pub use signal::{Signal, MAX_SIGNAL_SIZE};
