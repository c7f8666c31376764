//! Client role: discovery and outbound connects.
//!
//! The client manager browses for the service type and keeps one client
//! session per discovered peer identifier. `connect_to_peer` asks that
//! session to dial and resolves once its relay is listening. When the
//! transport reports the peer unreachable from this side, the request is
//! parked as awaiting a reverse connection and the coordinator is told to
//! ask the peer to dial us instead.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventSink, ManagerEvent, PeerAvailability, PeerConnection};
use crate::registry::{PeerKey, SessionRegistry};
use crate::session::{Attempt, NoticeKind, PeerSession, Role, SessionContext, SessionNotice};
use crate::signal::Signal;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peerbridge_transport::{BrowseEvent, LinkState, PeerHandle, PeerTransport};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// In-flight `connect_to_peer`
#[derive(Debug)]
struct ConnectionRequest {
    id: u64,
    identifier: String,
    reply: oneshot::Sender<Result<PeerConnection>>,
    started: Instant,
    awaiting_reverse: bool,
}

struct ClientInner {
    config: Arc<BridgeConfig>,
    ctx: SessionContext,
    registry: SessionRegistry<PeerSession>,
    pending: DashMap<PeerKey, ConnectionRequest>,
    /// Latest discovery handle of every visible peer
    handles: Mutex<HashMap<PeerHandle, PeerKey>>,
    availability: Mutex<HashMap<String, PeerAvailability>>,
    events: EventSink,
    manager_events: mpsc::UnboundedSender<ManagerEvent>,
    browse_task: Mutex<Option<JoinHandle<()>>>,
    notice_task: Mutex<Option<JoinHandle<()>>>,
    next_request_id: AtomicU64,
}

/// Client role manager
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ClientInner>,
}

impl ClientManager {
    /// Create the manager. Must be called within a Tokio runtime.
    pub fn new(
        config: Arc<BridgeConfig>,
        transport: Arc<dyn PeerTransport>,
        events: EventSink,
        manager_events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            transport,
            local_identifier: Arc::from(config.peer_identifier.as_str()),
            buffer_size: config.relay_buffer_size,
            notices: notices_tx,
        };
        let inner = Arc::new(ClientInner {
            config,
            ctx,
            registry: SessionRegistry::new(),
            pending: DashMap::new(),
            handles: Mutex::new(HashMap::new()),
            availability: Mutex::new(HashMap::new()),
            events,
            manager_events,
            browse_task: Mutex::new(None),
            notice_task: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        });

        let task = tokio::spawn(notice_loop(Arc::downgrade(&inner), notices_rx));
        *lock(&inner.notice_task) = Some(task);
        Self { inner }
    }

    /// Start browsing. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.is_browsing() {
            return Ok(());
        }
        let rx = self
            .inner
            .ctx
            .transport
            .browse(&self.inner.config.service_type)
            .await?;
        let task = tokio::spawn(browse_loop(Arc::downgrade(&self.inner), rx));
        if let Some(previous) = lock(&self.inner.browse_task).replace(task) {
            previous.abort();
        }
        tracing::info!("Browsing for '{}'", self.inner.config.service_type);
        Ok(())
    }

    /// Stop browsing, stop every client session and fail pending connects.
    pub async fn stop(&self) {
        self.stop_browsing().await;

        lock(&self.inner.handles).clear();
        for (_, session) in self.inner.registry.drain() {
            session.stop().await;
        }
        self.inner
            .fail_all_pending(BridgeError::connect_failed("browsing stopped"));

        let lost: Vec<PeerAvailability> = {
            let mut availability = lock(&self.inner.availability);
            availability
                .values_mut()
                .filter(|entry| entry.available)
                .map(|entry| {
                    entry.available = false;
                    entry.clone()
                })
                .collect()
        };
        if !lost.is_empty() {
            self.inner
                .events
                .emit(BridgeEvent::PeerAvailabilityChanged(lost));
        }
        tracing::info!("Client manager stopped");
    }

    /// Recycle browsing without touching sessions
    pub async fn restart(&self) -> Result<()> {
        self.stop_browsing().await;
        self.start().await
    }

    async fn stop_browsing(&self) {
        let task = lock(&self.inner.browse_task).take();
        if let Some(task) = task {
            task.abort();
        }
        if let Err(e) = self.inner.ctx.transport.stop_browsing().await {
            tracing::warn!("stop_browsing failed: {}", e);
        }
    }

    /// Whether browsing is active
    pub fn is_browsing(&self) -> bool {
        lock(&self.inner.browse_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Connect to `identifier`.
    ///
    /// Resolves with the listening port of a new (or the existing) client
    /// relay, or with `PeerConnection::Incoming` when the link was realized
    /// by reverse connect.
    pub async fn connect_to_peer(&self, identifier: &str) -> Result<PeerConnection> {
        let inner = &self.inner;
        let key = PeerKey::from_identifier(identifier);
        let session = inner
            .registry
            .get(&key)
            .ok_or_else(|| BridgeError::peer_unknown(identifier))?;

        if let Some(listening_port) = session.listening_port() {
            tracing::debug!("'{}' already connected on port {}", identifier, listening_port);
            return Ok(PeerConnection::Forward { listening_port });
        }

        let (tx, mut rx) = oneshot::channel();
        let id = inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        match inner.pending.entry(key) {
            Entry::Occupied(_) => {
                return Err(BridgeError::invalid_state("connect already pending for peer"));
            }
            Entry::Vacant(slot) => {
                slot.insert(ConnectionRequest {
                    id,
                    identifier: identifier.to_string(),
                    reply: tx,
                    started: Instant::now(),
                    awaiting_reverse: false,
                });
            }
        }

        if let Err(e) = session.connect(Attempt::Forward) {
            inner.pending.remove(&key);
            return Err(e);
        }

        // A session stopped under us never reports; treat that as failure
        let outcome = tokio::time::timeout(inner.config.connect_timeout, async {
            tokio::select! {
                reply = &mut rx => Some(reply.unwrap_or(Err(BridgeError::Shutdown))),
                _ = session.wait_for(|s| s.stopped) => None,
            }
        })
        .await;

        match outcome {
            Ok(Some(result)) => result,
            Ok(None) => {
                inner.pending.remove_if(&key, |_, r| r.id == id);
                Err(BridgeError::connect_failed("peer session ended while connecting"))
            }
            Err(_) => inner.settle_expired(&key, id, rx, &session).await,
        }
    }

    /// Gracefully close the client link to `identifier`
    pub async fn disconnect(&self, identifier: &str) -> Result<()> {
        let session = self.session_or_unknown(identifier)?;
        self.inner.resolve_if(
            &session.key(),
            |_| true,
            Err(BridgeError::connect_failed("disconnected")),
        );
        session.disconnect().await;
        self.inner.drop_if_invisible(&session).await;
        Ok(())
    }

    /// Abort the client link to `identifier` without graceful shutdown
    pub async fn kill_connection(&self, identifier: &str) -> Result<()> {
        let session = self.session_or_unknown(identifier)?;
        self.inner.resolve_if(
            &session.key(),
            |_| true,
            Err(BridgeError::link_failure("connection killed")),
        );
        session.kill().await;
        self.inner.drop_if_invisible(&session).await;
        Ok(())
    }

    /// Resolve a request parked for reverse connect.
    ///
    /// Called after every inbound completion; returns whether a request was
    /// waiting. `client_port == 0` resolves with `LocalAppUnreachable`.
    pub fn did_complete_reverse_connection(
        &self,
        identifier: &str,
        client_port: u16,
        server_port: u16,
    ) -> bool {
        let result = if client_port == 0 {
            Err(BridgeError::LocalAppUnreachable { port: server_port })
        } else {
            Ok(PeerConnection::Incoming {
                client_port,
                server_port,
            })
        };
        self.inner.resolve_if(
            &PeerKey::from_identifier(identifier),
            |r| r.awaiting_reverse,
            result,
        )
    }

    /// Fail a request parked for reverse connect
    pub fn fail_reverse_connection(&self, identifier: &str, error: BridgeError) -> bool {
        self.inner.resolve_if(
            &PeerKey::from_identifier(identifier),
            |r| r.awaiting_reverse,
            Err(error),
        )
    }

    /// Client session for `identifier`
    pub fn session(&self, identifier: &str) -> Option<Arc<PeerSession>> {
        self.inner.registry.get(&PeerKey::from_identifier(identifier))
    }

    /// Every client session
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|(_, session)| session)
            .collect()
    }

    /// Availability of every peer seen so far, by identifier
    pub fn peers(&self) -> Vec<PeerAvailability> {
        let mut peers: Vec<_> = lock(&self.inner.availability).values().cloned().collect();
        peers.sort_by(|a, b| a.peer_identifier.cmp(&b.peer_identifier));
        peers
    }

    /// Number of connect requests in flight
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop everything and end the notice task
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.fail_all_pending(BridgeError::Shutdown);
        if let Some(task) = lock(&self.inner.notice_task).take() {
            task.abort();
        }
    }

    fn session_or_unknown(&self, identifier: &str) -> Result<Arc<PeerSession>> {
        self.session(identifier)
            .ok_or_else(|| BridgeError::peer_unknown(identifier))
    }
}

impl ClientInner {
    /// Resolve the pending request for `key` if `predicate` accepts it
    fn resolve_if<P>(&self, key: &PeerKey, predicate: P, result: Result<PeerConnection>) -> bool
    where
        P: FnOnce(&ConnectionRequest) -> bool,
    {
        match self.pending.remove_if(key, |_, request| predicate(request)) {
            Some((_, request)) => {
                tracing::debug!(
                    "Resolving connect to '{}' after {:?}: {:?}",
                    request.identifier,
                    request.started.elapsed(),
                    result
                );
                let _ = request.reply.send(result);
                true
            }
            None => false,
        }
    }

    /// Settle a request whose deadline passed. A reply that beat the
    /// deadline still wins.
    async fn settle_expired(
        &self,
        key: &PeerKey,
        id: u64,
        rx: oneshot::Receiver<Result<PeerConnection>>,
        session: &PeerSession,
    ) -> Result<PeerConnection> {
        if self.pending.remove_if(key, |_, r| r.id == id).is_some() {
            session.cancel_connect();
            tracing::warn!("Connect to '{}' timed out", session.identifier());
            return Err(BridgeError::connect_failed("connect timed out"));
        }
        // Whoever removed the request is sending its reply
        rx.await
            .unwrap_or(Err(BridgeError::connect_failed("connect timed out")))
    }

    /// Session discovered at `handle`
    fn session_at(&self, handle: &PeerHandle) -> Option<Arc<PeerSession>> {
        let key = lock(&self.handles).get(handle).copied();
        key.and_then(|key| self.registry.get(&key))
    }

    fn fail_all_pending(&self, error: BridgeError) {
        let keys: Vec<PeerKey> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.resolve_if(&key, |_| true, Err(error.clone()));
        }
    }

    async fn drop_if_invisible(&self, session: &Arc<PeerSession>) {
        if !session.is_visible() && self.registry.remove_if_same(&session.key(), session) {
            session.stop().await;
        }
    }

    fn mark_available(&self, identifier: &str, available: bool) {
        let changed = {
            let mut availability = lock(&self.availability);
            match availability.get_mut(identifier) {
                Some(entry) if entry.available == available => None,
                Some(entry) => {
                    if available {
                        entry.generation += 1;
                    }
                    entry.available = available;
                    Some(entry.clone())
                }
                None if available => {
                    let entry = PeerAvailability {
                        peer_identifier: identifier.to_string(),
                        available: true,
                        generation: 0,
                    };
                    availability.insert(identifier.to_string(), entry.clone());
                    Some(entry)
                }
                None => None,
            }
        };
        if let Some(entry) = changed {
            self.events
                .emit(BridgeEvent::PeerAvailabilityChanged(vec![entry]));
        }
    }

    async fn send_signal(&self, handle: &PeerHandle, signal: Signal) {
        let bytes = match signal.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Encoding {} failed: {}", signal.message_type(), e);
                return;
            }
        };
        if let Err(e) = self.ctx.transport.send_signal(handle, &bytes).await {
            tracing::warn!("Sending {} to {} failed: {}", signal.message_type(), handle, e);
        }
    }

    async fn on_browse_event(self: &Arc<Self>, event: BrowseEvent) {
        match event {
            BrowseEvent::PeerFound {
                handle,
                peer_identifier,
            } => self.on_peer_found(handle, peer_identifier),
            BrowseEvent::PeerLost { handle } => self.on_peer_lost(handle).await,
            BrowseEvent::Signal { handle, payload } => self.on_signal(handle, &payload).await,
        }
    }

    fn on_peer_found(&self, handle: PeerHandle, identifier: String) {
        if identifier == self.config.peer_identifier {
            tracing::trace!("Ignoring our own advertisement");
            return;
        }

        let key = PeerKey::from_identifier(&identifier);
        let ctx = &self.ctx;
        self.registry.upsert(key, |current| match current {
            Some(existing) => {
                existing.set_visible(true, Some(handle.clone()));
                Some(existing)
            }
            None => Some(PeerSession::spawn_client(ctx, &identifier, handle.clone())),
        });
        {
            let mut handles = lock(&self.handles);
            handles.retain(|_, k| *k != key);
            handles.insert(handle.clone(), key);
        }
        tracing::debug!("Found '{}' at {}", identifier, handle);
        self.mark_available(&identifier, true);
    }

    async fn on_peer_lost(&self, handle: PeerHandle) {
        let key = lock(&self.handles).remove(&handle);
        let Some(session) = key.and_then(|key| self.registry.get(&key)) else {
            tracing::debug!("Lost unknown or stale handle {}", handle);
            return;
        };
        let key = session.key();

        if self.resolve_if(
            &key,
            |_| true,
            Err(BridgeError::connect_failed("peer lost while connecting")),
        ) {
            session.cancel_connect();
        }

        let mut removed = false;
        self.registry.upsert(key, |current| match current {
            Some(current)
                if Arc::ptr_eq(&current, &session) && current.state() != LinkState::Connected =>
            {
                removed = true;
                None
            }
            other => other,
        });

        if removed {
            session.stop().await;
        } else {
            session.set_visible(false, None);
        }
        tracing::debug!("Lost '{}' (kept: {})", session.identifier(), !removed);
        self.mark_available(session.identifier(), false);
    }

    async fn on_signal(&self, handle: PeerHandle, payload: &[u8]) {
        let signal = match Signal::from_bytes(payload) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!("Bad signal from {}: {}", handle, e);
                return;
            }
        };
        tracing::debug!("Received {} from {}", signal.message_type(), handle);

        match signal {
            Signal::ReverseConnectRequest { server_port } => {
                let session = self.session_at(&handle);
                let refusal = match &session {
                    None => Some("unknown peer".to_string()),
                    Some(s) if s.state() != LinkState::NotConnected => {
                        Some(format!("session busy ({:?})", s.state()))
                    }
                    Some(s) => s.connect(Attempt::Reverse).err().map(|e| e.to_string()),
                };
                match refusal {
                    None => tracing::info!(
                        "Dialing {} back on request (its service port {})",
                        handle,
                        server_port
                    ),
                    Some(reason) => {
                        tracing::warn!("Refusing reverse connect from {}: {}", handle, reason);
                        self.send_signal(&handle, Signal::ReverseConnectFailed { reason })
                            .await;
                    }
                }
            }
            Signal::ReverseConnectFailed { reason } => {
                let Some(session) = self
                    .session_at(&handle)
                    .or_else(|| self.registry.find(|s| s.handle() == handle))
                else {
                    return;
                };
                tracing::warn!("'{}' could not dial back: {}", session.identifier(), reason);
                self.resolve_if(
                    &session.key(),
                    |r| r.awaiting_reverse,
                    Err(BridgeError::TransportConnectFailed(Cow::Owned(reason))),
                );
            }
        }
    }

    async fn on_notice(self: &Arc<Self>, notice: SessionNotice) {
        if notice.role != Role::Client {
            return;
        }
        let key = notice.key;
        let current = self
            .registry
            .get(&key)
            .filter(|s| s.id() == notice.session_id);

        match notice.kind {
            NoticeKind::Connected {
                listening_port,
                attempt,
            } => {
                if attempt == Attempt::Reverse {
                    self.events.emit(BridgeEvent::ReverseConnectionListening {
                        peer_identifier: notice.identifier.clone(),
                        port: listening_port,
                    });
                }
                self.resolve_if(
                    &key,
                    |r| !r.awaiting_reverse,
                    Ok(PeerConnection::Forward { listening_port }),
                );
            }
            NoticeKind::Unreachable {
                attempt: Attempt::Forward,
            } => self.park_for_reverse(key, &notice.identifier, current),
            NoticeKind::Unreachable {
                attempt: Attempt::Reverse,
            } => {
                self.refuse_reverse(current, "unreachable from this side".to_string())
                    .await
            }
            NoticeKind::ConnectFailed {
                error,
                attempt: Attempt::Reverse,
            } => self.refuse_reverse(current, error.to_string()).await,
            NoticeKind::ConnectFailed {
                error,
                attempt: Attempt::Forward,
            } => {
                self.resolve_if(&key, |r| !r.awaiting_reverse, Err(error));
            }
            NoticeKind::Disconnected => {
                tracing::info!("Disconnected from '{}'", notice.identifier);
                self.events.emit(BridgeEvent::PeerDisconnected {
                    peer_identifier: notice.identifier,
                });
                if let Some(session) = current {
                    self.drop_if_invisible(&session).await;
                }
            }
            NoticeKind::InboundCompleted { .. } => {}
        }
    }

    fn park_for_reverse(
        self: &Arc<Self>,
        key: PeerKey,
        identifier: &str,
        session: Option<Arc<PeerSession>>,
    ) {
        let Some(session) = session else {
            return;
        };
        let request_id = match self.pending.get_mut(&key) {
            Some(mut request) if !request.awaiting_reverse => {
                request.awaiting_reverse = true;
                request.id
            }
            _ => {
                tracing::debug!("'{}' unreachable with no request waiting", identifier);
                return;
            }
        };

        tracing::info!("'{}' unreachable; requesting reverse connect", identifier);
        let _ = self.manager_events.send(ManagerEvent::ReverseConnectNeeded {
            peer_identifier: identifier.to_string(),
            handle: session.handle(),
        });

        let weak = Arc::downgrade(self);
        let timeout = self.config.reverse_connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if inner.resolve_if(
                    &key,
                    |r| r.id == request_id && r.awaiting_reverse,
                    Err(BridgeError::connect_failed("reverse connect timed out")),
                ) {
                    tracing::warn!("Reverse connect timed out");
                }
            }
        });
    }

    async fn refuse_reverse(&self, session: Option<Arc<PeerSession>>, reason: String) {
        if let Some(session) = session {
            tracing::warn!("Reverse dial to '{}' failed: {}", session.identifier(), reason);
            self.send_signal(&session.handle(), Signal::ReverseConnectFailed { reason })
                .await;
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for slot in [&self.browse_task, &self.notice_task] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn browse_loop(inner: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<BrowseEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_browse_event(event).await;
    }
    tracing::debug!("Browse loop ended");
}

async fn notice_loop(inner: Weak<ClientInner>, mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_notice(notice).await;
    }
}
