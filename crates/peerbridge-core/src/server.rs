//! Server role: advertising and inbound sessions.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::ManagerEvent;
use crate::registry::{PeerKey, SessionRegistry};
use crate::session::{NoticeKind, PeerSession, Role, SessionContext, SessionNotice};
use crate::signal::Signal;
use peerbridge_transport::{AdvertiseEvent, PeerHandle, PeerTransport};
use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Callback run after every advertisement reset
pub type ResetCallback = Arc<dyn Fn() + Send + Sync>;

struct Advertising {
    server_port: u16,
    accept_task: JoinHandle<()>,
}

struct ServerInner {
    config: Arc<BridgeConfig>,
    ctx: SessionContext,
    registry: SessionRegistry<PeerSession>,
    manager_events: mpsc::UnboundedSender<ManagerEvent>,
    advertising: Mutex<Option<Advertising>>,
    reset_task: Mutex<Option<JoinHandle<()>>>,
    reset_callback: Mutex<Option<ResetCallback>>,
    notice_task: Mutex<Option<JoinHandle<()>>>,
}

/// Server role manager.
///
/// Advertises the local service and wraps every inbound transport session
/// in a server [`PeerSession`] whose relay connects to the service port.
#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<ServerInner>,
}

impl ServerManager {
    /// Create the manager. Must be called within a Tokio runtime.
    pub fn new(
        config: Arc<BridgeConfig>,
        transport: Arc<dyn PeerTransport>,
        manager_events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            transport,
            local_identifier: Arc::from(config.peer_identifier.as_str()),
            buffer_size: config.relay_buffer_size,
            notices: notices_tx,
        };
        let inner = Arc::new(ServerInner {
            config,
            ctx,
            registry: SessionRegistry::new(),
            manager_events,
            advertising: Mutex::new(None),
            reset_task: Mutex::new(None),
            reset_callback: Mutex::new(None),
            notice_task: Mutex::new(None),
        });

        let task = tokio::spawn(notice_loop(Arc::downgrade(&inner), notices_rx));
        *lock(&inner.notice_task) = Some(task);
        Self { inner }
    }

    /// Advertise the service on `server_port`.
    ///
    /// Idempotent for the same port; a different port re-advertises.
    pub async fn start(&self, server_port: u16) -> Result<()> {
        let current = lock(&self.inner.advertising)
            .as_ref()
            .map(|ad| ad.server_port);
        match current {
            Some(port) if port == server_port => return Ok(()),
            Some(port) => {
                tracing::info!("Server port changed {} -> {}, re-advertising", port, server_port);
                self.stop_advertising().await;
            }
            None => {}
        }

        self.inner.advertise(server_port).await?;
        self.start_reset_timer();
        Ok(())
    }

    /// Stop advertising and stop every server session
    pub async fn stop(&self) {
        self.stop_advertising().await;
        for (_, session) in self.inner.registry.drain() {
            session.stop().await;
        }
        tracing::info!("Server manager stopped");
    }

    async fn stop_advertising(&self) {
        if let Some(task) = lock(&self.inner.reset_task).take() {
            task.abort();
        }
        let advertising = lock(&self.inner.advertising).take();
        if let Some(ad) = advertising {
            ad.accept_task.abort();
            if let Err(e) = self.inner.ctx.transport.stop_advertising().await {
                tracing::warn!("stop_advertising failed: {}", e);
            }
        }
    }

    /// Recycle advertising on the current port without touching sessions
    pub async fn restart_advertising(&self) -> Result<()> {
        self.inner.restart_advertising().await
    }

    /// Register the callback run after each periodic advertisement reset
    pub fn set_reset_callback(&self, callback: ResetCallback) {
        *lock(&self.inner.reset_callback) = Some(callback);
    }

    fn start_reset_timer(&self) {
        let Some(interval) = self.inner.config.advertisement_reset_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.restart_advertising().await {
                    tracing::warn!("Advertisement reset failed: {}", e);
                    continue;
                }
                let callback = lock(&inner.reset_callback).clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
        });
        if let Some(previous) = lock(&self.inner.reset_task).replace(task) {
            previous.abort();
        }
    }

    /// Whether advertising is active
    pub fn is_advertising(&self) -> bool {
        lock(&self.inner.advertising).is_some()
    }

    /// Advertised service port
    pub fn server_port(&self) -> Option<u16> {
        lock(&self.inner.advertising)
            .as_ref()
            .map(|ad| ad.server_port)
    }

    /// Ask the peer at `handle` to dial us.
    ///
    /// # Errors
    /// `TransportConnectFailed` if not advertising (nothing would accept the
    /// dial) or the signal cannot be delivered.
    pub async fn request_reverse_connect(&self, handle: &PeerHandle) -> Result<()> {
        let server_port = self
            .server_port()
            .ok_or(BridgeError::connect_failed("not advertising; cannot accept a reverse connect"))?;

        let signal = Signal::ReverseConnectRequest { server_port };
        let bytes = signal.to_bytes()?;
        self.inner
            .ctx
            .transport
            .send_signal(handle, &bytes)
            .await
            .map_err(|e| BridgeError::TransportConnectFailed(Cow::Owned(e.to_string())))?;
        tracing::info!("Requested reverse connect from {}", handle);
        Ok(())
    }

    /// Gracefully close the inbound link from `identifier`
    pub async fn disconnect(&self, identifier: &str) -> Result<()> {
        let session = self.session_or_unknown(identifier)?;
        session.disconnect().await;
        self.inner.retire(&session).await;
        Ok(())
    }

    /// Abort the inbound link from `identifier`
    pub async fn kill_connection(&self, identifier: &str) -> Result<()> {
        let session = self.session_or_unknown(identifier)?;
        session.kill().await;
        self.inner.retire(&session).await;
        Ok(())
    }

    /// Server session for `identifier`
    pub fn session(&self, identifier: &str) -> Option<Arc<PeerSession>> {
        self.inner.registry.get(&PeerKey::from_identifier(identifier))
    }

    /// Every server session
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|(_, session)| session)
            .collect()
    }

    /// Stop everything and end the notice task
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(task) = lock(&self.inner.notice_task).take() {
            task.abort();
        }
    }

    fn session_or_unknown(&self, identifier: &str) -> Result<Arc<PeerSession>> {
        self.session(identifier)
            .ok_or_else(|| BridgeError::peer_unknown(identifier))
    }
}

impl ServerInner {
    async fn advertise(self: &Arc<Self>, server_port: u16) -> Result<()> {
        let inbound = self
            .ctx
            .transport
            .advertise(&self.config.service_type, &self.config.peer_identifier, server_port)
            .await?;
        let accept_task = tokio::spawn(accept_loop(Arc::downgrade(self), inbound, server_port));
        let previous = lock(&self.advertising).replace(Advertising {
            server_port,
            accept_task,
        });
        if let Some(previous) = previous {
            previous.accept_task.abort();
        }
        tracing::info!(
            "Advertising '{}' as '{}' for port {}",
            self.config.service_type,
            self.config.peer_identifier,
            server_port
        );
        Ok(())
    }

    async fn restart_advertising(self: &Arc<Self>) -> Result<()> {
        let Some(server_port) = lock(&self.advertising).as_ref().map(|ad| ad.server_port) else {
            return Err(BridgeError::invalid_state("not advertising"));
        };
        if let Err(e) = self.ctx.transport.stop_advertising().await {
            tracing::warn!("stop_advertising failed: {}", e);
        }
        tracing::debug!("Recycling advertisement for port {}", server_port);
        self.advertise(server_port).await
    }

    fn on_inbound(&self, event: AdvertiseEvent, server_port: u16) {
        let AdvertiseEvent::InboundSession {
            handle,
            peer_identifier,
            session,
        } = event;
        tracing::info!("Inbound session from '{}' ({})", peer_identifier, handle);

        let key = PeerKey::from_identifier(&peer_identifier);
        let ctx = &self.ctx;
        let replaced = self.registry.upsert(key, |_| {
            Some(PeerSession::spawn_server(ctx, &peer_identifier, session, server_port))
        });
        if let Some(replaced) = replaced {
            tracing::debug!("Replacing server session {} for '{}'", replaced.id(), peer_identifier);
            tokio::spawn(async move { replaced.stop().await });
        }
    }

    async fn retire(&self, session: &Arc<PeerSession>) {
        if self.registry.remove_if_same(&session.key(), session) {
            session.stop().await;
        }
    }

    async fn on_notice(&self, notice: SessionNotice) {
        if notice.role != Role::Server {
            return;
        }
        match notice.kind {
            NoticeKind::InboundCompleted {
                client_port,
                server_port,
            } => {
                let _ = self.manager_events.send(ManagerEvent::InboundCompleted {
                    peer_identifier: notice.identifier,
                    client_port,
                    server_port,
                });
            }
            NoticeKind::Disconnected => {
                tracing::info!("Inbound link from '{}' ended", notice.identifier);
                let current = self
                    .registry
                    .get(&notice.key)
                    .filter(|s| s.id() == notice.session_id);
                if let Some(session) = current {
                    self.retire(&session).await;
                }
            }
            other => tracing::trace!("Ignoring server notice {:?}", other),
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(ad) = lock(&self.advertising).take() {
            ad.accept_task.abort();
        }
        for slot in [&self.reset_task, &self.notice_task] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept_loop(
    inner: Weak<ServerInner>,
    mut inbound: mpsc::UnboundedReceiver<AdvertiseEvent>,
    server_port: u16,
) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_inbound(event, server_port);
    }
    tracing::debug!("Accept loop for port {} ended", server_port);
}

async fn notice_loop(inner: Weak<ServerInner>, mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_notice(notice).await;
    }
}
