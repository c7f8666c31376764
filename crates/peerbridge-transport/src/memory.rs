//! In-process peer transport.
//!
//! `MemoryNetwork` simulates the discovery medium shared by a set of nodes.
//! Each node gets a [`MemoryTransport`] implementing [`PeerTransport`].
//! Sessions are backed by `tokio::io::duplex` pipes, so writes block once the
//! configured stream buffer is full, like a real socket.
//!
//! The network can be shaped to exercise failure paths:
//! - [`MemoryNetwork::set_dial_allowed`] makes a node unable to originate
//!   links (asymmetric reachability, the reverse-connect case)
//! - [`MemoryNetwork::set_visibility`] hides one node from another's browser
//! - [`MemoryNetwork::sever`] drops every link between two nodes
//! - [`MemoryNetwork::set_dial_delay`] keeps dials pending for a while

use crate::transport::{
    AdvertiseEvent, BrowseEvent, LinkControl, LinkState, PeerHandle, PeerTransport, SessionEvent,
    StreamPair, TransportError, TransportResult, TransportSession,
};
use crate::DEFAULT_STREAM_BUFFER;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

struct Advertisement {
    service_type: String,
    peer_identifier: String,
    server_port: u16,
    inbound: mpsc::UnboundedSender<AdvertiseEvent>,
}

struct Browser {
    service_type: String,
    events: mpsc::UnboundedSender<BrowseEvent>,
}

struct NodeState {
    advertisement: Option<Advertisement>,
    browser: Option<Browser>,
    dial_allowed: bool,
    /// Observers whose browser cannot see this node
    hidden_from: HashSet<PeerHandle>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            advertisement: None,
            browser: None,
            dial_allowed: true,
            hidden_from: HashSet::new(),
        }
    }
}

struct NetworkInner {
    nodes: Mutex<HashMap<PeerHandle, NodeState>>,
    links: Mutex<Vec<Arc<MemoryLink>>>,
    dial_delay: Mutex<Duration>,
    stream_buffer: usize,
    next_link_id: AtomicU64,
}

impl NetworkInner {
    fn nodes(&self) -> MutexGuard<'_, HashMap<PeerHandle, NodeState>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, Vec<Arc<MemoryLink>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared simulated discovery medium
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create a network with the default stream buffer
    pub fn new() -> Self {
        Self::with_stream_buffer(DEFAULT_STREAM_BUFFER)
    }

    /// Create a network whose session pipes buffer `stream_buffer` bytes
    pub fn with_stream_buffer(stream_buffer: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: Mutex::new(HashMap::new()),
                links: Mutex::new(Vec::new()),
                dial_delay: Mutex::new(Duration::ZERO),
                stream_buffer: stream_buffer.max(1),
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a node named `name` and return its transport
    pub fn transport(&self, name: &str) -> Arc<MemoryTransport> {
        let handle = PeerHandle::new(name);
        self.inner
            .nodes()
            .entry(handle.clone())
            .or_insert_with(NodeState::new);
        Arc::new(MemoryTransport {
            network: Arc::clone(&self.inner),
            handle,
        })
    }

    /// Allow or forbid `node` to originate links
    pub fn set_dial_allowed(&self, node: &str, allowed: bool) {
        if let Some(state) = self.inner.nodes().get_mut(&PeerHandle::new(node)) {
            state.dial_allowed = allowed;
        }
    }

    /// Delay applied to every dial before the link comes up
    pub fn set_dial_delay(&self, delay: Duration) {
        *self
            .inner
            .dial_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make `target` visible or invisible to `observer`'s browser.
    ///
    /// Emits `PeerFound` / `PeerLost` to the observer when the change is
    /// observable (observer browsing the service `target` advertises).
    pub fn set_visibility(&self, observer: &str, target: &str, visible: bool) {
        let observer = PeerHandle::new(observer);
        let target = PeerHandle::new(target);
        let mut nodes = self.inner.nodes();

        let changed = match nodes.get_mut(&target) {
            Some(state) if visible => state.hidden_from.remove(&observer),
            Some(state) => state.hidden_from.insert(observer.clone()),
            None => false,
        };
        if !changed {
            return;
        }

        let Some(ad) = nodes.get(&target).and_then(|s| s.advertisement.as_ref()) else {
            return;
        };
        let Some(browser) = nodes.get(&observer).and_then(|s| s.browser.as_ref()) else {
            return;
        };
        if browser.service_type != ad.service_type {
            return;
        }

        let event = if visible {
            BrowseEvent::PeerFound {
                handle: target.clone(),
                peer_identifier: ad.peer_identifier.clone(),
            }
        } else {
            BrowseEvent::PeerLost {
                handle: target.clone(),
            }
        };
        let _ = browser.events.send(event);
    }

    /// Close every open link between `a` and `b`
    pub fn sever(&self, a: &str, b: &str) {
        let a = PeerHandle::new(a);
        let b = PeerHandle::new(b);
        let matching: Vec<_> = self
            .inner
            .links()
            .iter()
            .filter(|link| link.connects(&a, &b))
            .cloned()
            .collect();

        for link in matching {
            tracing::debug!("Severing link {} between {} and {}", link.id, a, b);
            link.close();
        }
    }

    /// Number of links currently open
    pub fn open_links(&self) -> usize {
        let mut links = self.inner.links();
        links.retain(|link| !link.is_closed());
        links.len()
    }

    /// Server port announced by `node`, if it is advertising
    pub fn advertised_port(&self, node: &str) -> Option<u16> {
        self.inner
            .nodes()
            .get(&PeerHandle::new(node))
            .and_then(|s| s.advertisement.as_ref())
            .map(|ad| ad.server_port)
    }
}

/// One physical link between two nodes
struct MemoryLink {
    id: u64,
    ends: (PeerHandle, PeerHandle),
    closed: AtomicBool,
    events: [mpsc::UnboundedSender<SessionEvent>; 2],
}

impl MemoryLink {
    fn connects(&self, a: &PeerHandle, b: &PeerHandle) -> bool {
        (&self.ends.0 == a && &self.ends.1 == b) || (&self.ends.0 == b && &self.ends.1 == a)
    }
}

impl LinkControl for MemoryLink {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for events in &self.events {
            let _ = events.send(SessionEvent::StateChanged(LinkState::NotConnected));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn stream_pair(end: tokio::io::DuplexStream) -> StreamPair {
    let (input, output) = tokio::io::split(end);
    StreamPair {
        input: Box::new(input),
        output: Box::new(output),
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Arc<NetworkInner>,
    handle: PeerHandle,
}

impl MemoryTransport {
    /// Handle other nodes see for this node
    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn advertise(
        &self,
        service_type: &str,
        peer_identifier: &str,
        server_port: u16,
    ) -> TransportResult<mpsc::UnboundedReceiver<AdvertiseEvent>> {
        let mut nodes = self.network.nodes();
        let me = nodes
            .get_mut(&self.handle)
            .ok_or(TransportError::Closed)?;
        if me.advertisement.is_some() {
            return Err(TransportError::AlreadyActive("advertising"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        me.advertisement = Some(Advertisement {
            service_type: service_type.to_string(),
            peer_identifier: peer_identifier.to_string(),
            server_port,
            inbound: tx,
        });
        let hidden_from = me.hidden_from.clone();

        for (handle, state) in nodes.iter() {
            if handle == &self.handle || hidden_from.contains(handle) {
                continue;
            }
            if let Some(browser) = &state.browser {
                if browser.service_type == service_type {
                    let _ = browser.events.send(BrowseEvent::PeerFound {
                        handle: self.handle.clone(),
                        peer_identifier: peer_identifier.to_string(),
                    });
                }
            }
        }

        tracing::debug!("{} advertising '{}' on port {}", self.handle, service_type, server_port);
        Ok(rx)
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        let mut nodes = self.network.nodes();
        let Some(ad) = nodes
            .get_mut(&self.handle)
            .and_then(|me| me.advertisement.take())
        else {
            return Ok(());
        };

        for (handle, state) in nodes.iter() {
            if handle == &self.handle {
                continue;
            }
            if let Some(browser) = &state.browser {
                if browser.service_type == ad.service_type {
                    let _ = browser.events.send(BrowseEvent::PeerLost {
                        handle: self.handle.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn browse(
        &self,
        service_type: &str,
    ) -> TransportResult<mpsc::UnboundedReceiver<BrowseEvent>> {
        let mut nodes = self.network.nodes();
        if nodes
            .get(&self.handle)
            .ok_or(TransportError::Closed)?
            .browser
            .is_some()
        {
            return Err(TransportError::AlreadyActive("browsing"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (handle, state) in nodes.iter() {
            if handle == &self.handle || state.hidden_from.contains(&self.handle) {
                continue;
            }
            if let Some(ad) = &state.advertisement {
                if ad.service_type == service_type {
                    let _ = tx.send(BrowseEvent::PeerFound {
                        handle: handle.clone(),
                        peer_identifier: ad.peer_identifier.clone(),
                    });
                }
            }
        }

        if let Some(me) = nodes.get_mut(&self.handle) {
            me.browser = Some(Browser {
                service_type: service_type.to_string(),
                events: tx,
            });
        }
        Ok(rx)
    }

    async fn stop_browsing(&self) -> TransportResult<()> {
        if let Some(me) = self.network.nodes().get_mut(&self.handle) {
            me.browser = None;
        }
        Ok(())
    }

    async fn open_session(
        &self,
        peer: &PeerHandle,
        local_identifier: &str,
    ) -> TransportResult<TransportSession> {
        {
            let nodes = self.network.nodes();
            let me = nodes.get(&self.handle).ok_or(TransportError::Closed)?;
            if !me.dial_allowed {
                return Err(TransportError::Unreachable(format!(
                    "{} cannot originate a link to {}",
                    self.handle, peer
                )));
            }
            if nodes.get(peer).and_then(|s| s.advertisement.as_ref()).is_none() {
                return Err(TransportError::PeerNotFound(peer.to_string()));
            }
        }

        let delay = *self
            .network
            .dial_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let inbound = self
            .network
            .nodes()
            .get(peer)
            .and_then(|s| s.advertisement.as_ref())
            .map(|ad| ad.inbound.clone())
            .ok_or_else(|| TransportError::PeerNotFound(peer.to_string()))?;

        let (local_end, remote_end) = tokio::io::duplex(self.network.stream_buffer);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        let link = Arc::new(MemoryLink {
            id: self.network.next_link_id.fetch_add(1, Ordering::Relaxed),
            ends: (self.handle.clone(), peer.clone()),
            closed: AtomicBool::new(false),
            events: [local_tx.clone(), remote_tx.clone()],
        });
        {
            let mut links = self.network.links();
            links.retain(|l| !l.is_closed());
            links.push(Arc::clone(&link));
        }

        let _ = local_tx.send(SessionEvent::StateChanged(LinkState::Connecting));
        let _ = local_tx.send(SessionEvent::StateChanged(LinkState::Connected));
        let _ = local_tx.send(SessionEvent::StreamsAvailable(stream_pair(local_end)));
        let _ = remote_tx.send(SessionEvent::StateChanged(LinkState::Connected));
        let _ = remote_tx.send(SessionEvent::StreamsAvailable(stream_pair(remote_end)));

        let remote_session =
            TransportSession::new(self.handle.clone(), remote_rx, link.clone() as Arc<dyn LinkControl>);
        if inbound
            .send(AdvertiseEvent::InboundSession {
                handle: self.handle.clone(),
                peer_identifier: local_identifier.to_string(),
                session: remote_session,
            })
            .is_err()
        {
            link.close();
            return Err(TransportError::PeerNotFound(peer.to_string()));
        }

        tracing::debug!("Link {} opened: {} -> {}", link.id, self.handle, peer);
        Ok(TransportSession::new(peer.clone(), local_rx, link))
    }

    async fn send_signal(&self, peer: &PeerHandle, payload: &[u8]) -> TransportResult<()> {
        let nodes = self.network.nodes();
        let browser = nodes
            .get(peer)
            .ok_or_else(|| TransportError::PeerNotFound(peer.to_string()))?
            .browser
            .as_ref()
            .ok_or_else(|| {
                TransportError::Unreachable(format!("{} is not listening for signals", peer))
            })?;

        browser
            .events
            .send(BrowseEvent::Signal {
                handle: self.handle.clone(),
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::Unreachable(peer.to_string()))
    }

    fn is_advertising(&self) -> bool {
        self.network
            .nodes()
            .get(&self.handle)
            .is_some_and(|s| s.advertisement.is_some())
    }

    fn is_browsing(&self) -> bool {
        self.network
            .nodes()
            .get(&self.handle)
            .is_some_and(|s| s.browser.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn next_found(rx: &mut mpsc::UnboundedReceiver<BrowseEvent>) -> (PeerHandle, String) {
        match rx.recv().await {
            Some(BrowseEvent::PeerFound {
                handle,
                peer_identifier,
            }) => (handle, peer_identifier),
            other => panic!("expected PeerFound, got {:?}", other),
        }
    }

    async fn streams(session: &mut TransportSession) -> StreamPair {
        loop {
            match session.next_event().await {
                Some(SessionEvent::StreamsAvailable(pair)) => return pair,
                Some(SessionEvent::StateChanged(_)) => continue,
                None => panic!("session ended before streams were available"),
            }
        }
    }

    #[tokio::test]
    async fn test_browse_finds_existing_advertiser() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let _inbound = b.advertise("svc", "bob", 9000).await.unwrap();
        let mut events = a.browse("svc").await.unwrap();

        let (handle, id) = next_found(&mut events).await;
        assert_eq!(handle.as_str(), "b");
        assert_eq!(id, "bob");
        assert_eq!(network.advertised_port("b"), Some(9000));
    }

    #[tokio::test]
    async fn test_advertise_notifies_existing_browser() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let mut events = a.browse("svc").await.unwrap();
        let _inbound = b.advertise("svc", "bob", 9000).await.unwrap();
        let (handle, _) = next_found(&mut events).await;
        assert_eq!(handle.as_str(), "b");

        b.stop_advertising().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(BrowseEvent::PeerLost { handle }) if handle.as_str() == "b"
        ));
    }

    #[tokio::test]
    async fn test_other_service_not_reported() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let mut events = a.browse("svc").await.unwrap();
        let _inbound = b.advertise("other", "bob", 9000).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_double_advertise_rejected() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let _rx = a.advertise("svc", "alice", 1).await.unwrap();
        assert!(matches!(
            a.advertise("svc", "alice", 1).await,
            Err(TransportError::AlreadyActive(_))
        ));
        assert!(a.is_advertising());
    }

    #[tokio::test]
    async fn test_open_session_moves_bytes() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let mut inbound = b.advertise("svc", "bob", 9000).await.unwrap();
        let mut session = a.open_session(&PeerHandle::new("b"), "alice").await.unwrap();

        let AdvertiseEvent::InboundSession {
            handle,
            peer_identifier,
            session: mut remote,
        } = inbound.recv().await.unwrap();
        assert_eq!(handle.as_str(), "a");
        assert_eq!(peer_identifier, "alice");

        let mut local = streams(&mut session).await;
        let mut far = streams(&mut remote).await;

        local.output.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(network.open_links(), 1);
    }

    #[tokio::test]
    async fn test_dial_forbidden_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let _inbound = b.advertise("svc", "bob", 9000).await.unwrap();

        network.set_dial_allowed("a", false);
        assert!(matches!(
            a.open_session(&PeerHandle::new("b"), "alice").await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_non_advertiser_not_found() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let _b = network.transport("b");
        assert!(matches!(
            a.open_session(&PeerHandle::new("b"), "alice").await,
            Err(TransportError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sever_notifies_both_ends() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let mut inbound = b.advertise("svc", "bob", 9000).await.unwrap();
        let mut session = a.open_session(&PeerHandle::new("b"), "alice").await.unwrap();
        let AdvertiseEvent::InboundSession {
            session: mut remote,
            ..
        } = inbound.recv().await.unwrap();
        let _local = streams(&mut session).await;
        let _far = streams(&mut remote).await;

        network.sever("b", "a");

        assert!(matches!(
            session.next_event().await,
            Some(SessionEvent::StateChanged(LinkState::NotConnected))
        ));
        assert!(matches!(
            remote.next_event().await,
            Some(SessionEvent::StateChanged(LinkState::NotConnected))
        ));
        assert_eq!(network.open_links(), 0);
    }

    #[tokio::test]
    async fn test_visibility_toggle() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let _inbound = b.advertise("svc", "bob", 9000).await.unwrap();
        let mut events = a.browse("svc").await.unwrap();
        next_found(&mut events).await;

        network.set_visibility("a", "b", false);
        assert!(matches!(events.recv().await, Some(BrowseEvent::PeerLost { .. })));

        // Hiding twice is not observable
        network.set_visibility("a", "b", false);
        network.set_visibility("a", "b", true);
        let (handle, _) = next_found(&mut events).await;
        assert_eq!(handle.as_str(), "b");
    }

    #[tokio::test]
    async fn test_signal_requires_browser() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        assert!(matches!(
            a.send_signal(&PeerHandle::new("b"), b"hi").await,
            Err(TransportError::Unreachable(_))
        ));

        let mut events = b.browse("svc").await.unwrap();
        a.send_signal(&PeerHandle::new("b"), b"hi").await.unwrap();
        match events.recv().await {
            Some(BrowseEvent::Signal { handle, payload }) => {
                assert_eq!(handle.as_str(), "a");
                assert_eq!(payload, b"hi");
            }
            other => panic!("expected Signal, got {:?}", other),
        }
    }
}
