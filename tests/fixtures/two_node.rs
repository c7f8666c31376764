//! Two-node test fixture for integration testing
//!
//! Provides a reusable test infrastructure for two-peer scenarios over the
//! in-memory transport:
//! - Discovery in both directions
//! - Forward and reverse connects
//! - Echo round trips through the relays
//!
//! # Example
//!
//! ```no_run
//! use peerbridge_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_echo() {
//!     let mut fixture = TwoNodeFixture::new().await.unwrap();
//!     fixture.start().await.unwrap();
//!
//!     let connection = fixture.connect().await.unwrap();
//!     let port = fixture.relay_port(connection).await;
//!     // ... talk to the responder's echo service through `port` ...
//!
//!     fixture.cleanup().await;
//! }
//! ```

use crate::test_helpers::{wait_deadline, wait_until};
use peerbridge_core::{BridgeConfig, BridgeError, BridgeEvent, Coordinator, PeerConnection};
use peerbridge_transport::MemoryNetwork;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifier of the connecting node
pub const INITIATOR: &str = "initiator";

/// Identifier of the node being connected to
pub const RESPONDER: &str = "responder";

/// Service type both nodes use
pub const SERVICE: &str = "echo-test";

/// Loopback echo server standing in for the application service
pub struct EchoService {
    port: u16,
    task: JoinHandle<()>,
}

impl EchoService {
    /// Bind an ephemeral port and start echoing
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = socket.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        Ok(Self { port, task })
    }

    /// Port the service listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// A loopback port nothing listens on
    pub async fn closed_port() -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(listener.local_addr()?.port())
    }
}

impl Drop for EchoService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Two-node test fixture
///
/// Both nodes advertise their own echo service and browse for each other.
pub struct TwoNodeFixture {
    pub network: MemoryNetwork,
    pub initiator: Coordinator,
    pub responder: Coordinator,
    pub initiator_events: mpsc::Receiver<BridgeEvent>,
    pub responder_events: mpsc::Receiver<BridgeEvent>,
    pub initiator_service: EchoService,
    pub responder_service: EchoService,
}

impl TwoNodeFixture {
    /// Fixture with default configuration on both nodes
    pub async fn new() -> Result<Self, BridgeError> {
        Self::new_with_config(
            BridgeConfig::new(SERVICE, INITIATOR),
            BridgeConfig::new(SERVICE, RESPONDER),
            MemoryNetwork::new(),
        )
        .await
    }

    /// Fixture whose initiator cannot originate links, so every connect
    /// goes through the reverse-connect path
    pub async fn new_reverse() -> Result<Self, BridgeError> {
        let network = MemoryNetwork::new();
        network.transport(INITIATOR);
        network.set_dial_allowed(INITIATOR, false);
        Self::new_with_config(
            BridgeConfig::new(SERVICE, INITIATOR),
            BridgeConfig::new(SERVICE, RESPONDER),
            network,
        )
        .await
    }

    /// Fixture with custom configurations over `network`
    pub async fn new_with_config(
        initiator_config: BridgeConfig,
        responder_config: BridgeConfig,
        network: MemoryNetwork,
    ) -> Result<Self, BridgeError> {
        let initiator_transport = network.transport(&initiator_config.peer_identifier);
        let responder_transport = network.transport(&responder_config.peer_identifier);

        let (initiator, initiator_events) =
            Coordinator::new(initiator_config, initiator_transport)?;
        let (responder, responder_events) =
            Coordinator::new(responder_config, responder_transport)?;

        let initiator_service = EchoService::start()
            .await
            .map_err(|e| BridgeError::LocalListenFailed(e.to_string().into()))?;
        let responder_service = EchoService::start()
            .await
            .map_err(|e| BridgeError::LocalListenFailed(e.to_string().into()))?;

        Ok(Self {
            network,
            initiator,
            responder,
            initiator_events,
            responder_events,
            initiator_service,
            responder_service,
        })
    }

    /// Advertise and browse on both nodes, then wait for mutual discovery
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        self.initiator
            .start_advertising_and_listening(self.initiator_service.port())
            .await?;
        self.responder
            .start_advertising_and_listening(self.responder_service.port())
            .await?;
        self.initiator.start_listening_for_advertisements().await?;
        self.responder.start_listening_for_advertisements().await?;

        let initiator = self.initiator.clone();
        wait_until("initiator to discover responder", || {
            initiator.client().session(RESPONDER).is_some()
        })
        .await;
        let responder = self.responder.clone();
        wait_until("responder to discover initiator", || {
            responder.client().session(INITIATOR).is_some()
        })
        .await;
        Ok(())
    }

    /// Connect the initiator to the responder
    pub async fn connect(&self) -> Result<PeerConnection, BridgeError> {
        self.initiator.connect_to_peer(RESPONDER).await
    }

    /// Loopback port the initiator-side application should use.
    ///
    /// For a reverse connect the listening relay lives on the responder,
    /// reported by `ReverseConnectionListening`.
    pub async fn relay_port(&mut self, connection: PeerConnection) -> u16 {
        match connection {
            PeerConnection::Forward { listening_port } => listening_port,
            PeerConnection::Incoming { .. } => self.reverse_listening_port().await,
        }
    }

    /// Wait for the responder to report a reverse relay
    pub async fn reverse_listening_port(&mut self) -> u16 {
        let found = tokio::time::timeout(wait_deadline(), async {
            while let Some(event) = self.responder_events.recv().await {
                if let BridgeEvent::ReverseConnectionListening { port, .. } = event {
                    return Some(port);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(port)) => port,
            _ => panic!("responder never reported a reverse relay"),
        }
    }

    /// Wait for the next responder event matching `predicate`
    pub async fn next_responder_event<F>(&mut self, mut predicate: F) -> Option<BridgeEvent>
    where
        F: FnMut(&BridgeEvent) -> bool,
    {
        tokio::time::timeout(wait_deadline(), async {
            while let Some(event) = self.responder_events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Wait for the next initiator event matching `predicate`
    pub async fn next_initiator_event<F>(&mut self, mut predicate: F) -> Option<BridgeEvent>
    where
        F: FnMut(&BridgeEvent) -> bool,
    {
        tokio::time::timeout(wait_deadline(), async {
            while let Some(event) = self.initiator_events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Shut both nodes down
    pub async fn cleanup(&self) {
        self.initiator.shutdown().await;
        self.responder.shutdown().await;
    }
}
