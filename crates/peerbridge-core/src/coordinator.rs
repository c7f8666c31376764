//! Single application-facing entry point.
//!
//! The coordinator owns one [`ClientManager`] and one [`ServerManager`] over
//! the same transport, routes manager events between them and folds both
//! roles into one logical view per peer identifier.

use crate::client::ClientManager;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{
    BridgeEvent, EventSink, ManagerEvent, NetworkStatus, PeerAvailability, PeerConnection,
};
use crate::server::{ResetCallback, ServerManager};
use peerbridge_transport::{LinkState, PeerTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct CoordinatorInner {
    config: Arc<BridgeConfig>,
    client: ClientManager,
    server: ServerManager,
    events: EventSink,
    network: Mutex<Option<NetworkStatus>>,
    shut_down: AtomicBool,
    router: Mutex<Option<JoinHandle<()>>>,
}

/// Application entry point for one local peer.
///
/// # Examples
///
/// ```no_run
/// use peerbridge_core::{BridgeConfig, Coordinator};
/// use peerbridge_transport::MemoryNetwork;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let network = MemoryNetwork::new();
/// let config = BridgeConfig::new("echo", "alice");
/// let (coordinator, mut events) = Coordinator::new(config, network.transport("alice"))?;
///
/// coordinator.start_advertising_and_listening(8080).await?;
/// coordinator.start_listening_for_advertisements().await?;
///
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Create a coordinator and the receiver of its application events.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// `InvalidConfig` if `config` does not validate.
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(Self, mpsc::Receiver<BridgeEvent>)> {
        config.validate()?;
        let config = Arc::new(config);
        let (events, events_rx) = EventSink::channel(config.event_channel_capacity);
        let (manager_tx, manager_rx) = mpsc::unbounded_channel();

        let client = ClientManager::new(
            Arc::clone(&config),
            Arc::clone(&transport),
            events.clone(),
            manager_tx.clone(),
        );
        let server = ServerManager::new(Arc::clone(&config), transport, manager_tx);

        let inner = Arc::new(CoordinatorInner {
            config,
            client,
            server,
            events,
            network: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            router: Mutex::new(None),
        });
        let router = tokio::spawn(route(Arc::downgrade(&inner), manager_rx));
        *lock(&inner.router) = Some(router);

        tracing::info!(
            "Coordinator for '{}' on service '{}' ready",
            inner.config.peer_identifier,
            inner.config.service_type
        );
        Ok((Self { inner }, events_rx))
    }

    /// Configuration in use
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Client role manager
    pub fn client(&self) -> &ClientManager {
        &self.inner.client
    }

    /// Server role manager
    pub fn server(&self) -> &ServerManager {
        &self.inner.server
    }

    /// Advertise the local service listening on `server_port`
    pub async fn start_advertising_and_listening(&self, server_port: u16) -> Result<()> {
        self.ensure_running()?;
        let result = self.inner.server.start(server_port).await;
        self.emit_state();
        result
    }

    /// Stop advertising and close every inbound link
    pub async fn stop_advertising_and_listening(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.server.stop().await;
        self.emit_state();
        Ok(())
    }

    /// Start discovering peers
    pub async fn start_listening_for_advertisements(&self) -> Result<()> {
        self.ensure_running()?;
        let result = self.inner.client.start().await;
        self.emit_state();
        result
    }

    /// Stop discovering peers and close every outbound link
    pub async fn stop_listening_for_advertisements(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.client.stop().await;
        self.emit_state();
        Ok(())
    }

    /// Connect to the peer advertising as `identifier`.
    ///
    /// # Errors
    /// - `Shutdown` after [`shutdown`](Self::shutdown)
    /// - `RadioTurnedOff` if the last reported status has Wi-Fi and
    ///   Bluetooth off
    /// - otherwise whatever the client role reports
    pub async fn connect_to_peer(&self, identifier: &str) -> Result<PeerConnection> {
        self.ensure_running()?;
        if self.radios_off() {
            return Err(BridgeError::RadioTurnedOff);
        }
        if let Some(connection) = self.existing_incoming(identifier) {
            tracing::debug!("'{}' already linked through our server role", identifier);
            return Ok(connection);
        }
        self.inner.client.connect_to_peer(identifier).await
    }

    /// Inbound link already realizing the logical connection to
    /// `identifier`, unless an outbound relay exists
    fn existing_incoming(&self, identifier: &str) -> Option<PeerConnection> {
        let forward_up = self
            .inner
            .client
            .session(identifier)
            .is_some_and(|s| s.listening_port().is_some());
        if forward_up {
            return None;
        }
        let (client_port, server_port) = self.inner.server.session(identifier)?.inbound_ports()?;
        Some(PeerConnection::Incoming {
            client_port,
            server_port,
        })
    }

    /// Gracefully close every link to `identifier`, in either role
    pub async fn disconnect(&self, identifier: &str) -> Result<()> {
        self.ensure_running()?;
        let client = self.inner.client.disconnect(identifier).await;
        let server = self.inner.server.disconnect(identifier).await;
        client.or(server)
    }

    /// Abort every link to `identifier` without graceful shutdown.
    /// Intended for tests.
    pub async fn kill_connection(&self, identifier: &str) -> Result<()> {
        self.ensure_running()?;
        let client = self.inner.client.kill_connection(identifier).await;
        let server = self.inner.server.kill_connection(identifier).await;
        client.or(server)
    }

    /// Combined state of both roles for `identifier`
    pub fn logical_state(&self, identifier: &str) -> LinkState {
        let states = [
            self.inner.client.session(identifier).map(|s| s.state()),
            self.inner.server.session(identifier).map(|s| s.state()),
        ];
        if states.contains(&Some(LinkState::Connected)) {
            LinkState::Connected
        } else if states.contains(&Some(LinkState::Connecting)) {
            LinkState::Connecting
        } else {
            LinkState::NotConnected
        }
    }

    /// Every peer discovered so far
    pub fn peers(&self) -> Vec<PeerAvailability> {
        self.inner.client.peers()
    }

    /// Record the platform's radio status
    pub fn report_network_status(&self, status: NetworkStatus) {
        let changed = {
            let mut current = lock(&self.inner.network);
            if current.as_ref() == Some(&status) {
                false
            } else {
                *current = Some(status.clone());
                true
            }
        };
        if changed {
            tracing::info!(
                "Network status: wifi {:?}, bluetooth {:?}",
                status.wifi,
                status.bluetooth
            );
            self.inner.events.emit(BridgeEvent::NetworkChanged(status));
        }
    }

    /// Last reported radio status
    pub fn network_status(&self) -> Option<NetworkStatus> {
        lock(&self.inner.network).clone()
    }

    /// Run `callback` after each periodic advertisement reset
    pub fn set_advertisement_reset_callback(&self, callback: ResetCallback) {
        self.inner.server.set_reset_callback(callback);
    }

    /// Stop both roles and refuse further calls. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.client.shutdown().await;
        self.inner.server.shutdown().await;
        if let Some(router) = lock(&self.inner.router).take() {
            router.abort();
        }
        self.emit_state();
        tracing::info!("Coordinator shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(BridgeError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn radios_off(&self) -> bool {
        lock(&self.inner.network)
            .as_ref()
            .is_some_and(NetworkStatus::radios_off)
    }

    fn emit_state(&self) {
        self.inner
            .events
            .emit(BridgeEvent::DiscoveryAdvertisingStateUpdate {
                discovery_active: self.inner.client.is_browsing(),
                advertising_active: self.inner.server.is_advertising(),
            });
    }
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        if let Some(router) = lock(&self.router).take() {
            router.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn route(inner: Weak<CoordinatorInner>, mut events: mpsc::UnboundedReceiver<ManagerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ManagerEvent::ReverseConnectNeeded {
                peer_identifier,
                handle,
            } => {
                if let Err(e) = inner.server.request_reverse_connect(&handle).await {
                    tracing::warn!("Reverse connect to '{}' not possible: {}", peer_identifier, e);
                    inner.client.fail_reverse_connection(&peer_identifier, e);
                }
            }
            ManagerEvent::InboundCompleted {
                peer_identifier,
                client_port,
                server_port,
            } => {
                if client_port == 0 {
                    inner
                        .events
                        .emit(BridgeEvent::IncomingConnectionFailed { server_port });
                }
                if inner
                    .client
                    .did_complete_reverse_connection(&peer_identifier, client_port, server_port)
                {
                    tracing::info!("Reverse connect with '{}' completed", peer_identifier);
                }
            }
        }
    }
    tracing::debug!("Manager event router ended");
}
