//! Per-peer session state machine.
//!
//! A [`PeerSession`] is the handle stored in the registry. The state machine
//! itself runs in a dedicated task (see `actor`) that owns the transport
//! session, the stream pair and the socket relay. Commands, transport
//! events and relay events all arrive on channels and are processed one at
//! a time, so transitions for one peer never interleave.
//!
//! ```text
//!                 connect()            link up + relay bound
//!  NotConnected ─────────────► Connecting ──────────────────► Connected
//!       ▲                          │                              │
//!       └──── dial failed / lost ──┘◄── link lost / relay ended ──┘
//! ```
//!
//! Outcomes the manager must act on are reported upward as
//! [`SessionNotice`]s.

mod actor;

use crate::error::{BridgeError, Result};
use crate::registry::PeerKey;
use peerbridge_transport::{LinkState, PeerHandle, PeerTransport, TransportSession};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Which manager owns a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Created by discovery; dials the peer
    Client,
    /// Created by an inbound transport session
    Server,
}

/// Why a client session is dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Local `connect_to_peer`
    Forward,
    /// The peer asked us to dial it
    Reverse,
}

/// Published view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Connection state
    pub state: LinkState,
    /// Whether discovery currently sees the peer
    pub visible: bool,
    /// Latest transport handle
    pub handle: PeerHandle,
    /// Client relay port while Connected
    pub listening_port: Option<u16>,
    /// Local port of the server relay's service connection while Connected
    pub service_client_port: Option<u16>,
    /// Dial in progress or completed
    pub attempt: Option<Attempt>,
    /// Session task has ended
    pub stopped: bool,
}

/// Outcome reported by a session to its manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// Client relay is listening; the session is Connected
    Connected {
        /// Relay port
        listening_port: u16,
        /// Dial that produced the link
        attempt: Attempt,
    },
    /// The transport cannot dial the peer from this side
    Unreachable {
        /// Failed dial
        attempt: Attempt,
    },
    /// Dial or link setup failed
    ConnectFailed {
        /// Translated failure
        error: BridgeError,
        /// Failed dial
        attempt: Attempt,
    },
    /// Server relay finished connecting to the local service.
    /// `client_port == 0` means the service was unreachable.
    InboundCompleted {
        /// Local port of the relay's service connection
        client_port: u16,
        /// Local service port
        server_port: u16,
    },
    /// The session returned to NotConnected after a link existed
    Disconnected,
}

/// Notice with the reporting session's identity
#[derive(Debug, Clone)]
pub struct SessionNotice {
    /// Instance id of the reporting session
    pub session_id: u64,
    /// Registry key
    pub key: PeerKey,
    /// Peer identifier
    pub identifier: String,
    /// Session role
    pub role: Role,
    /// What happened
    pub kind: NoticeKind,
}

/// Collaborators shared by every session of one manager
#[derive(Clone)]
pub struct SessionContext {
    /// Peer transport
    pub transport: Arc<dyn PeerTransport>,
    /// Identifier presented when dialing
    pub local_identifier: Arc<str>,
    /// Relay buffer per direction
    pub buffer_size: usize,
    /// Manager notice channel
    pub notices: mpsc::UnboundedSender<SessionNotice>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("local_identifier", &self.local_identifier)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

pub(crate) enum Command {
    Connect(Attempt),
    CancelConnect,
    SetVisible {
        visible: bool,
        handle: Option<PeerHandle>,
    },
    Disconnect(oneshot::Sender<()>),
    Kill(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Handle to one peer session
#[derive(Debug)]
pub struct PeerSession {
    id: u64,
    identifier: String,
    key: PeerKey,
    role: Role,
    server_port: u16,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl PeerSession {
    /// Start a client session for a discovered peer (NotConnected, visible)
    pub fn spawn_client(ctx: &SessionContext, identifier: &str, handle: PeerHandle) -> Arc<Self> {
        Self::spawn(ctx, identifier, Role::Client, handle, None, 0)
    }

    /// Start a server session around an inbound transport session.
    ///
    /// Once streams arrive a server relay connects to `server_port`.
    pub fn spawn_server(
        ctx: &SessionContext,
        identifier: &str,
        link: TransportSession,
        server_port: u16,
    ) -> Arc<Self> {
        let handle = link.handle().clone();
        Self::spawn(ctx, identifier, Role::Server, handle, Some(link), server_port)
    }

    fn spawn(
        ctx: &SessionContext,
        identifier: &str,
        role: Role,
        handle: PeerHandle,
        link: Option<TransportSession>,
        server_port: u16,
    ) -> Arc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let key = PeerKey::from_identifier(identifier);
        let snapshot = SessionSnapshot {
            state: LinkState::NotConnected,
            visible: role == Role::Client,
            handle,
            listening_port: None,
            service_client_port: None,
            attempt: None,
            stopped: false,
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(snapshot.clone());

        let actor = actor::SessionActor::new(actor::ActorSetup {
            id,
            identifier: identifier.to_string(),
            key,
            role,
            ctx: ctx.clone(),
            server_port,
            snapshot,
            published: state_tx,
            commands: commands_rx,
            link,
        });
        tokio::spawn(actor.run());

        tracing::debug!("Spawned {:?} session {} for '{}'", role, id, identifier);
        Arc::new(Self {
            id,
            identifier: identifier.to_string(),
            key,
            role,
            server_port,
            commands: commands_tx,
            state: state_rx,
        })
    }

    /// Instance id, unique per process
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer identifier
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Registry key
    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// Session role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Current connection state
    pub fn state(&self) -> LinkState {
        self.state.borrow().state
    }

    /// Latest transport handle
    pub fn handle(&self) -> PeerHandle {
        self.state.borrow().handle.clone()
    }

    /// Whether discovery currently sees the peer
    pub fn is_visible(&self) -> bool {
        self.state.borrow().visible
    }

    /// Relay port if Connected as client
    pub fn listening_port(&self) -> Option<u16> {
        let snapshot = self.state.borrow();
        match snapshot.state {
            LinkState::Connected => snapshot.listening_port,
            _ => None,
        }
    }

    /// `(client_port, server_port)` of the service connection if this is a
    /// Connected server session whose relay reached the local service
    pub fn inbound_ports(&self) -> Option<(u16, u16)> {
        let snapshot = self.state.borrow();
        match (snapshot.state, snapshot.service_client_port) {
            (LinkState::Connected, Some(client_port)) => Some((client_port, self.server_port)),
            _ => None,
        }
    }

    /// Subscribe to snapshot updates
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait until the published snapshot satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.state.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| BridgeError::Shutdown)?;
        Ok(snapshot.clone())
    }

    /// Begin dialing. The outcome arrives as a [`SessionNotice`].
    pub fn connect(&self, attempt: Attempt) -> Result<()> {
        self.send(Command::Connect(attempt))
    }

    /// Abandon a dial in progress; no notice is emitted for it
    pub fn cancel_connect(&self) {
        let _ = self.send(Command::CancelConnect);
    }

    /// Record discovery visibility, optionally refreshing the handle
    pub fn set_visible(&self, visible: bool, handle: Option<PeerHandle>) {
        let _ = self.send(Command::SetVisible { visible, handle });
    }

    /// Stop the relay, close the link and return to NotConnected
    pub async fn disconnect(&self) {
        self.request(Command::Disconnect).await;
    }

    /// Abort the relay and drop the link without waiting for forwarding
    /// tasks to wind down
    pub async fn kill(&self) {
        self.request(Command::Kill).await;
    }

    /// Tear down and end the session task. Idempotent.
    pub async fn stop(&self) {
        self.request(Command::Stop).await;
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::invalid_state("session stopped"))
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (tx, rx) = oneshot::channel();
        if self.send(make(tx)).is_ok() {
            // Dropped reply means the task already ended
            let _ = rx.await;
        }
    }
}
