//! Session task: the only code that mutates a session's state.

use super::{Attempt, Command, NoticeKind, Role, SessionContext, SessionNotice, SessionSnapshot};
use crate::error::BridgeError;
use crate::registry::PeerKey;
use crate::relay::{ClientSocketRelay, RelayEvent, ServerSocketRelay, SocketRelay};
use peerbridge_transport::{
    LinkState, SessionEvent, StreamPair, TransportError, TransportResult, TransportSession,
};
use std::borrow::Cow;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub(super) struct ActorSetup {
    pub id: u64,
    pub identifier: String,
    pub key: PeerKey,
    pub role: Role,
    pub ctx: SessionContext,
    pub server_port: u16,
    pub snapshot: SessionSnapshot,
    pub published: watch::Sender<SessionSnapshot>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub link: Option<TransportSession>,
}

struct DialResult {
    epoch: u64,
    result: TransportResult<TransportSession>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Wait for relay tasks to end
    Graceful,
    /// Abort relay tasks and move on
    Abort,
}

pub(super) struct SessionActor {
    id: u64,
    identifier: String,
    key: PeerKey,
    role: Role,
    ctx: SessionContext,
    server_port: u16,

    snapshot: SessionSnapshot,
    published: watch::Sender<SessionSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,

    /// Bumped on every dial and teardown; older dial results are stale
    epoch: u64,
    dial: Option<JoinHandle<()>>,
    dial_tx: mpsc::UnboundedSender<DialResult>,
    dial_rx: mpsc::UnboundedReceiver<DialResult>,

    link: Option<TransportSession>,
    pending_streams: Option<StreamPair>,
    relay: Option<SocketRelay>,
    relay_events: Option<mpsc::UnboundedReceiver<RelayEvent>>,
}

async fn next_link_event(link: &mut Option<TransportSession>) -> Option<SessionEvent> {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_relay_event(
    events: &mut Option<mpsc::UnboundedReceiver<RelayEvent>>,
) -> Option<RelayEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub(super) fn new(setup: ActorSetup) -> Self {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        Self {
            id: setup.id,
            identifier: setup.identifier,
            key: setup.key,
            role: setup.role,
            ctx: setup.ctx,
            server_port: setup.server_port,
            snapshot: setup.snapshot,
            published: setup.published,
            commands: setup.commands,
            epoch: 0,
            dial: None,
            dial_tx,
            dial_rx,
            link: setup.link,
            pending_streams: None,
            relay: None,
            relay_events: None,
        }
    }

    pub(super) async fn run(mut self) {
        let done = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Stop(done)) => {
                        self.teardown(Teardown::Graceful).await;
                        break Some(done);
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.teardown(Teardown::Abort).await;
                        break None;
                    }
                },
                Some(dial) = self.dial_rx.recv() => self.on_dial_result(dial).await,
                event = next_link_event(&mut self.link) => self.on_link_event(event).await,
                event = next_relay_event(&mut self.relay_events) => match event {
                    Some(event) => self.on_relay_event(event).await,
                    None => self.relay_events = None,
                },
            }
        };

        self.snapshot.stopped = true;
        self.publish();
        tracing::debug!("{:?} session {} for '{}' ended", self.role, self.id, self.identifier);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot.clone());
    }

    fn transition_to(&mut self, state: LinkState) {
        if self.snapshot.state != state {
            tracing::info!(
                "{:?} session '{}': {:?} -> {:?}",
                self.role,
                self.identifier,
                self.snapshot.state,
                state
            );
            self.snapshot.state = state;
        }
        if state != LinkState::Connected {
            self.snapshot.listening_port = None;
            self.snapshot.service_client_port = None;
        }
        self.publish();
    }

    fn notify(&self, kind: NoticeKind) {
        let notice = SessionNotice {
            session_id: self.id,
            key: self.key,
            identifier: self.identifier.clone(),
            role: self.role,
            kind,
        };
        if self.ctx.notices.send(notice).is_err() {
            tracing::trace!("Manager gone; dropping notice for '{}'", self.identifier);
        }
    }

    fn attempt(&self) -> Attempt {
        self.snapshot.attempt.unwrap_or(Attempt::Forward)
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(attempt) => self.on_connect(attempt),
            Command::CancelConnect => {
                if self.snapshot.state == LinkState::Connecting {
                    tracing::debug!("Cancelling connect to '{}'", self.identifier);
                    self.teardown(Teardown::Abort).await;
                }
            }
            Command::SetVisible { visible, handle } => {
                self.snapshot.visible = visible;
                if let Some(handle) = handle {
                    self.snapshot.handle = handle;
                }
                self.publish();
            }
            Command::Disconnect(done) => {
                let was = self.snapshot.state;
                self.teardown(Teardown::Graceful).await;
                if was == LinkState::Connected {
                    self.notify(NoticeKind::Disconnected);
                }
                let _ = done.send(());
            }
            Command::Kill(done) => {
                let was = self.snapshot.state;
                self.teardown(Teardown::Abort).await;
                if was == LinkState::Connected {
                    self.notify(NoticeKind::Disconnected);
                }
                let _ = done.send(());
            }
            // Handled by the run loop
            Command::Stop(done) => {
                let _ = done.send(());
            }
        }
    }

    fn on_connect(&mut self, attempt: Attempt) {
        if self.role != Role::Client {
            self.notify(NoticeKind::ConnectFailed {
                error: BridgeError::invalid_state("not a client session"),
                attempt,
            });
            return;
        }

        match self.snapshot.state {
            LinkState::Connected => match self.snapshot.listening_port {
                Some(listening_port) => self.notify(NoticeKind::Connected {
                    listening_port,
                    attempt,
                }),
                None => self.notify(NoticeKind::ConnectFailed {
                    error: BridgeError::invalid_state("connected without a relay"),
                    attempt,
                }),
            },
            LinkState::Connecting => self.notify(NoticeKind::ConnectFailed {
                error: BridgeError::invalid_state("connect already in progress"),
                attempt,
            }),
            LinkState::NotConnected => self.start_dial(attempt),
        }
    }

    fn start_dial(&mut self, attempt: Attempt) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.snapshot.attempt = Some(attempt);
        self.transition_to(LinkState::Connecting);

        let transport = self.ctx.transport.clone();
        let handle = self.snapshot.handle.clone();
        let local_identifier = self.ctx.local_identifier.clone();
        let results = self.dial_tx.clone();
        tracing::debug!("Dialing '{}' ({:?}) via {}", self.identifier, attempt, handle);

        self.dial = Some(tokio::spawn(async move {
            let result = transport.open_session(&handle, &local_identifier).await;
            let _ = results.send(DialResult { epoch, result });
        }));
    }

    async fn on_dial_result(&mut self, dial: DialResult) {
        if dial.epoch != self.epoch || self.snapshot.state != LinkState::Connecting {
            if let Ok(link) = dial.result {
                tracing::debug!("Discarding stale link to '{}'", self.identifier);
                link.close();
            }
            return;
        }
        self.dial = None;
        let attempt = self.attempt();

        match dial.result {
            Ok(link) => {
                // Connected arrives on the link's event channel
                self.link = Some(link);
            }
            Err(TransportError::Unreachable(reason)) => {
                tracing::info!("'{}' unreachable from here: {}", self.identifier, reason);
                self.teardown(Teardown::Abort).await;
                self.notify(NoticeKind::Unreachable { attempt });
            }
            Err(e) => {
                tracing::warn!("Dial to '{}' failed: {}", self.identifier, e);
                self.teardown(Teardown::Abort).await;
                self.notify(NoticeKind::ConnectFailed {
                    error: BridgeError::TransportConnectFailed(Cow::Owned(e.to_string())),
                    attempt,
                });
            }
        }
    }

    async fn on_link_event(&mut self, event: Option<SessionEvent>) {
        match event {
            Some(SessionEvent::StateChanged(LinkState::Connecting)) => {
                if self.role == Role::Server && self.snapshot.state == LinkState::NotConnected {
                    self.transition_to(LinkState::Connecting);
                }
            }
            Some(SessionEvent::StateChanged(LinkState::Connected)) => self.on_link_up().await,
            Some(SessionEvent::StreamsAvailable(streams)) => self.on_streams(streams),
            Some(SessionEvent::StateChanged(LinkState::NotConnected)) | None => {
                self.on_link_lost().await
            }
        }
    }

    async fn on_link_up(&mut self) {
        match self.role {
            Role::Server => {
                if self.snapshot.state == LinkState::NotConnected {
                    self.transition_to(LinkState::Connecting);
                }
            }
            Role::Client => {
                if self.snapshot.state != LinkState::Connecting || self.relay.is_some() {
                    return;
                }
                let attempt = self.attempt();
                let (events_tx, events_rx) = mpsc::unbounded_channel();

                match ClientSocketRelay::bind(self.ctx.buffer_size, events_tx).await {
                    Ok(mut relay) => {
                        if let Some(streams) = self.pending_streams.take() {
                            if let Err(e) = relay.attach_streams(streams) {
                                tracing::warn!("Attaching streams for '{}': {}", self.identifier, e);
                            }
                        }
                        let listening_port = relay.port();
                        self.relay = Some(SocketRelay::Client(relay));
                        self.relay_events = Some(events_rx);
                        self.snapshot.listening_port = Some(listening_port);
                        self.transition_to(LinkState::Connected);
                        self.notify(NoticeKind::Connected {
                            listening_port,
                            attempt,
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Relay for '{}' could not listen: {}", self.identifier, e);
                        self.teardown(Teardown::Abort).await;
                        self.notify(NoticeKind::ConnectFailed {
                            error: e.into(),
                            attempt,
                        });
                    }
                }
            }
        }
    }

    fn on_streams(&mut self, streams: StreamPair) {
        match self.role {
            Role::Client => match self.relay.as_mut() {
                Some(SocketRelay::Client(relay)) => {
                    if let Err(e) = relay.attach_streams(streams) {
                        tracing::warn!("Dropping extra streams for '{}': {}", self.identifier, e);
                    }
                }
                // Relay is created on link up; hold the streams until then
                _ => self.pending_streams = Some(streams),
            },
            Role::Server => {
                if self.relay.is_some() {
                    tracing::warn!("Dropping extra streams for '{}'", self.identifier);
                    return;
                }
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let relay = ServerSocketRelay::connect(
                    self.server_port,
                    streams,
                    self.ctx.buffer_size,
                    events_tx,
                );
                self.relay = Some(SocketRelay::Server(relay));
                self.relay_events = Some(events_rx);
                self.transition_to(LinkState::Connected);
            }
        }
    }

    async fn on_link_lost(&mut self) {
        let was = self.snapshot.state;
        let attempt = self.attempt();
        if self.link.is_some() {
            tracing::info!("Link to '{}' closed", self.identifier);
        }
        self.teardown(Teardown::Abort).await;

        match (self.role, was) {
            (_, LinkState::NotConnected) => {}
            (Role::Client, LinkState::Connecting) => self.notify(NoticeKind::ConnectFailed {
                error: BridgeError::connect_failed("link closed while connecting"),
                attempt,
            }),
            _ => self.notify(NoticeKind::Disconnected),
        }
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::ConnectedToServer { client_port } => {
                self.snapshot.service_client_port = Some(client_port);
                self.publish();
                self.notify(NoticeKind::InboundCompleted {
                    client_port,
                    server_port: self.server_port,
                });
            }
            RelayEvent::ServerConnectFailed { server_port } => {
                self.notify(NoticeKind::InboundCompleted {
                    client_port: 0,
                    server_port,
                });
                self.teardown(Teardown::Abort).await;
                self.notify(NoticeKind::Disconnected);
            }
            RelayEvent::ConnectionRejected { remote } => {
                tracing::debug!("'{}' relay rejected {}", self.identifier, remote);
            }
            RelayEvent::Disconnected { error } => {
                match error {
                    Some(error) => {
                        tracing::warn!("Relay for '{}' failed: {}", self.identifier, error)
                    }
                    None => tracing::debug!("Relay for '{}' finished", self.identifier),
                }
                let was = self.snapshot.state;
                self.teardown(Teardown::Abort).await;
                if was != LinkState::NotConnected {
                    self.notify(NoticeKind::Disconnected);
                }
            }
        }
    }

    /// Drop relay, link and any dial in flight; back to NotConnected
    async fn teardown(&mut self, mode: Teardown) {
        self.epoch += 1;
        if let Some(dial) = self.dial.take() {
            dial.abort();
        }
        if let Some(mut relay) = self.relay.take() {
            match mode {
                Teardown::Graceful => relay.stop().await,
                Teardown::Abort => relay.abort(),
            }
        }
        self.relay_events = None;
        self.pending_streams = None;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.snapshot.attempt = None;
        self.transition_to(LinkState::NotConnected);
    }
}
