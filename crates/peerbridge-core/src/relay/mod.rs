//! Socket relays.
//!
//! A relay bridges one local TCP socket to one transport stream pair. Two
//! variants exist:
//!
//! - [`ClientSocketRelay`]: listens on `127.0.0.1:0` and forwards the first
//!   application connection it accepts
//! - [`ServerSocketRelay`]: connects to the local service port
//!
//! Both hand the socket and streams to the same forwarding engine: one task
//! per direction, each owning one socket half and one stream half. A
//! direction reads at most `buffer_size` bytes and writes them completely
//! before reading again. EOF in one direction half-closes its writer; the
//! relay ends once both directions have finished or either has failed.
//!
//! Relays never own a reference to their session. Progress is reported on
//! the event channel given at construction.

pub mod client;
pub mod server;

pub use client::ClientSocketRelay;
pub use server::ServerSocketRelay;

use crate::error::BridgeError;
use peerbridge_transport::StreamPair;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Binding the local listening socket failed
    #[error("Failed to bind local relay socket: {0}")]
    Bind(#[source] io::Error),

    /// Streams were already handed to the relay
    #[error("Streams already attached")]
    StreamsAlreadyAttached,

    /// The relay has been stopped
    #[error("Relay stopped")]
    Stopped,
}

impl From<RelayError> for BridgeError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Bind(e) => BridgeError::LocalListenFailed(Cow::Owned(e.to_string())),
            RelayError::StreamsAlreadyAttached => {
                BridgeError::invalid_state("streams already attached")
            }
            RelayError::Stopped => BridgeError::link_failure("relay stopped"),
        }
    }
}

/// Which side of the bridge a relay serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    /// Listens for the local application
    Client,
    /// Connects to the local service
    Server,
}

/// Progress reported by a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Server relay reached the local service from local port `client_port`
    ConnectedToServer {
        /// Local port of the connection to the service
        client_port: u16,
    },

    /// Server relay could not reach the local service
    ServerConnectFailed {
        /// Port of the local service
        server_port: u16,
    },

    /// Client relay refused an extra application connection
    ConnectionRejected {
        /// Address of the refused connection
        remote: SocketAddr,
    },

    /// Forwarding ended; `error` is set when it ended by failure
    Disconnected {
        /// Failure description
        error: Option<String>,
    },
}

/// Sending half of a relay's event channel
pub type RelayEventSender = mpsc::UnboundedSender<RelayEvent>;

/// Either relay variant
#[derive(Debug)]
pub enum SocketRelay {
    /// Listening relay
    Client(ClientSocketRelay),
    /// Connecting relay
    Server(ServerSocketRelay),
}

impl SocketRelay {
    /// Relay role
    pub fn role(&self) -> RelayRole {
        match self {
            SocketRelay::Client(_) => RelayRole::Client,
            SocketRelay::Server(_) => RelayRole::Server,
        }
    }

    /// Listening port of a client relay
    pub fn listening_port(&self) -> Option<u16> {
        match self {
            SocketRelay::Client(relay) => Some(relay.port()),
            SocketRelay::Server(_) => None,
        }
    }

    /// Whether the relay task is still running
    pub fn is_running(&self) -> bool {
        match self {
            SocketRelay::Client(relay) => relay.is_running(),
            SocketRelay::Server(relay) => relay.is_running(),
        }
    }

    /// Stop forwarding and wait for the relay task to end. Idempotent.
    pub async fn stop(&mut self) {
        match self {
            SocketRelay::Client(relay) => relay.stop().await,
            SocketRelay::Server(relay) => relay.stop().await,
        }
    }

    /// Stop forwarding without waiting. Idempotent.
    pub fn abort(&mut self) {
        match self {
            SocketRelay::Client(relay) => relay.task.abort(),
            SocketRelay::Server(relay) => relay.task.abort(),
        }
    }
}

/// Root task of a relay.
///
/// Aborting it drops every task it spawned, since those live in
/// `JoinSet`s owned by the root future.
#[derive(Debug)]
pub(crate) struct RelayTask {
    handle: Option<JoinHandle<()>>,
}

impl RelayTask {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub(crate) async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            // Cancelled or finished; either way the task is gone
            let _ = handle.await;
        }
    }
}

impl Drop for RelayTask {
    fn drop(&mut self) {
        self.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToPeer,
    ToApp,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToPeer => f.write_str("app->peer"),
            Direction::ToApp => f.write_str("peer->app"),
        }
    }
}

async fn pump<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
) -> (Direction, io::Result<u64>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = async {
        let mut buf = vec![0u8; buffer_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                writer.shutdown().await?;
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            total += n as u64;
        }
    }
    .await;
    (direction, result)
}

/// Forward between `socket` and `streams` until both directions end.
///
/// Returns the first failure, if any.
pub(crate) async fn forward(
    socket: TcpStream,
    streams: StreamPair,
    buffer_size: usize,
) -> Option<String> {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::trace!("set_nodelay failed: {}", e);
    }
    let (socket_in, socket_out) = socket.into_split();
    let StreamPair { input, output } = streams;

    let mut directions = JoinSet::new();
    directions.spawn(pump(Direction::ToPeer, socket_in, output, buffer_size));
    directions.spawn(pump(Direction::ToApp, input, socket_out, buffer_size));

    let mut failure = None;
    while let Some(joined) = directions.join_next().await {
        match joined {
            Ok((direction, Ok(bytes))) => {
                tracing::debug!("Relay direction {} finished after {} bytes", direction, bytes);
            }
            Ok((direction, Err(e))) => {
                tracing::debug!("Relay direction {} failed: {}", direction, e);
                failure.get_or_insert_with(|| format!("{}: {}", direction, e));
                directions.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                failure.get_or_insert_with(|| e.to_string());
                directions.abort_all();
            }
        }
    }
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn duplex_streams(buffer: usize) -> (StreamPair, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(buffer);
        let (input, output) = tokio::io::split(near);
        (
            StreamPair {
                input: Box::new(input),
                output: Box::new(output),
            },
            far,
        )
    }

    #[tokio::test]
    async fn test_pump_copies_and_half_closes() {
        let (mut writer_end, reader_end) = tokio::io::duplex(64);
        let (out_end, mut observer) = tokio::io::duplex(64);

        let task = tokio::spawn(pump(Direction::ToPeer, reader_end, out_end, 8));
        writer_end.write_all(b"hello relay").await.unwrap();
        drop(writer_end);

        let mut received = Vec::new();
        observer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello relay");

        let (_, result) = task.await.unwrap();
        assert_eq!(result.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_forward_both_directions() {
        let (mut app, relay_side) = socket_pair().await;
        let (streams, mut peer) = duplex_streams(1024);

        let relay = tokio::spawn(forward(relay_side, streams, 16));

        app.write_all(b"to peer").await.unwrap();
        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to peer");

        peer.write_all(b"to app").await.unwrap();
        let mut buf = [0u8; 6];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to app");

        // Close both sides; relay ends cleanly
        app.shutdown().await.unwrap();
        drop(peer);
        let mut rest = Vec::new();
        app.read_to_end(&mut rest).await.unwrap();
        assert!(relay.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_relay_task_stop_idempotent() {
        let mut task = RelayTask::spawn(std::future::pending());
        assert!(task.is_running());
        task.stop().await;
        assert!(!task.is_running());
        task.stop().await;
        task.abort();
    }

    #[test]
    fn test_relay_error_mapping() {
        let err: BridgeError = RelayError::Bind(io::Error::other("in use")).into();
        assert!(matches!(err, BridgeError::LocalListenFailed(_)));
        let err: BridgeError = RelayError::StreamsAlreadyAttached.into();
        assert!(matches!(err, BridgeError::InvalidState(_)));
    }
}
