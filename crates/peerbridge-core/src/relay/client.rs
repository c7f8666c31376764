//! Listening relay on the connecting side.

use super::{forward, RelayError, RelayEvent, RelayEventSender, RelayTask};
use peerbridge_transport::StreamPair;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

/// Relay that listens on loopback for the local application.
///
/// The listening port is known as soon as [`ClientSocketRelay::bind`]
/// returns. No connection is accepted until the transport streams are
/// attached; an application that connects earlier waits in the listen
/// backlog. Exactly one connection is forwarded; later ones are refused.
#[derive(Debug)]
pub struct ClientSocketRelay {
    port: u16,
    streams: Option<oneshot::Sender<StreamPair>>,
    pub(crate) task: RelayTask,
}

impl ClientSocketRelay {
    /// Bind `127.0.0.1:0` and start the accept task
    pub async fn bind(buffer_size: usize, events: RelayEventSender) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(RelayError::Bind)?;
        let port = listener.local_addr().map_err(RelayError::Bind)?.port();
        let (streams_tx, streams_rx) = oneshot::channel();

        tracing::debug!("Client relay listening on 127.0.0.1:{}", port);
        let task = RelayTask::spawn(accept_loop(listener, streams_rx, buffer_size, events));

        Ok(Self {
            port,
            streams: Some(streams_tx),
            task,
        })
    }

    /// Bound listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether streams have been attached (always true once stopped)
    pub fn has_streams(&self) -> bool {
        self.streams.is_none()
    }

    /// Hand over the transport streams; enables accepting
    pub fn attach_streams(&mut self, streams: StreamPair) -> Result<(), RelayError> {
        let tx = self
            .streams
            .take()
            .ok_or(RelayError::StreamsAlreadyAttached)?;
        tx.send(streams).map_err(|_| RelayError::Stopped)
    }

    /// Whether the relay task is still running
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Close the listener and any forwarded connection. Idempotent.
    pub async fn stop(&mut self) {
        self.streams = None;
        self.task.stop().await;
    }
}

/// Gate for the single forwarded connection
#[derive(Debug, Default)]
struct AcceptSlot {
    streams: Option<StreamPair>,
    socket_created: bool,
}

impl AcceptSlot {
    fn can_create_socket(&self) -> bool {
        self.streams.is_some() && !self.socket_created
    }

    fn did_create_socket(&mut self) -> Option<StreamPair> {
        if !self.can_create_socket() {
            return None;
        }
        self.socket_created = true;
        self.streams.take()
    }
}

async fn accept_loop(
    listener: TcpListener,
    streams_rx: oneshot::Receiver<StreamPair>,
    buffer_size: usize,
    events: RelayEventSender,
) {
    let mut slot = AcceptSlot::default();
    match streams_rx.await {
        Ok(streams) => slot.streams = Some(streams),
        // Relay dropped before the link came up
        Err(_) => return,
    }

    let mut forwarding = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, remote)) => match slot.did_create_socket() {
                    Some(streams) => {
                        tracing::debug!("Client relay accepted {}", remote);
                        forwarding.spawn(forward(socket, streams, buffer_size));
                    }
                    None => {
                        tracing::warn!("Client relay refusing extra connection from {}", remote);
                        drop(socket);
                        let _ = events.send(RelayEvent::ConnectionRejected { remote });
                    }
                },
                Err(e) => {
                    tracing::warn!("Client relay accept failed: {}", e);
                    let _ = events.send(RelayEvent::Disconnected {
                        error: Some(e.to_string()),
                    });
                    return;
                }
            },
            Some(joined) = forwarding.join_next() => {
                let error = joined.unwrap_or_else(|e| Some(e.to_string()));
                let _ = events.send(RelayEvent::Disconnected { error });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    fn duplex_streams() -> (StreamPair, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let (input, output) = tokio::io::split(near);
        (
            StreamPair {
                input: Box::new(input),
                output: Box::new(output),
            },
            far,
        )
    }

    #[test]
    fn test_accept_slot_gate() {
        let mut slot = AcceptSlot::default();
        assert!(!slot.can_create_socket());
        assert!(slot.did_create_socket().is_none());

        slot.streams = Some(duplex_streams().0);
        assert!(slot.can_create_socket());
        assert!(slot.did_create_socket().is_some());
        assert!(!slot.can_create_socket());
        assert!(slot.did_create_socket().is_none());
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut relay = ClientSocketRelay::bind(1024, tx).await.unwrap();
        assert!(relay.port() > 0);
        assert!(relay.is_running());
        relay.stop().await;
        assert!(!relay.is_running());
    }

    #[tokio::test]
    async fn test_forwards_after_streams_attached() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut relay = ClientSocketRelay::bind(1024, tx).await.unwrap();

        // Connect before streams exist; data waits
        let mut app = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
        app.write_all(b"early").await.unwrap();

        let (streams, mut peer) = duplex_streams();
        relay.attach_streams(streams).unwrap();
        assert!(relay.has_streams());

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_second_attach_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut relay = ClientSocketRelay::bind(1024, tx).await.unwrap();
        relay.attach_streams(duplex_streams().0).unwrap();
        assert!(matches!(
            relay.attach_streams(duplex_streams().0),
            Err(RelayError::StreamsAlreadyAttached)
        ));
    }

    #[tokio::test]
    async fn test_second_connection_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut relay = ClientSocketRelay::bind(1024, tx).await.unwrap();
        let (streams, mut peer) = duplex_streams();
        relay.attach_streams(streams).unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
        first.write_all(b"1").await.unwrap();
        let mut buf = [0u8; 1];
        peer.read_exact(&mut buf).await.unwrap();

        let _second = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(RelayEvent::ConnectionRejected { .. })));

        // First connection still forwards
        first.write_all(b"2").await.unwrap();
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2");

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_reported_when_app_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut relay = ClientSocketRelay::bind(1024, tx).await.unwrap();
        let (streams, peer) = duplex_streams();
        relay.attach_streams(streams).unwrap();

        let app = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
        drop(app);
        drop(peer);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(RelayEvent::Disconnected { .. })));
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut relay = ClientSocketRelay::bind(1024, tx).await.unwrap();
        relay.stop().await;
        relay.stop().await;
        assert!(matches!(
            relay.attach_streams(duplex_streams().0),
            Err(RelayError::StreamsAlreadyAttached)
        ));
    }
}
