//! Connecting relay on the accepting side.

use super::{forward, RelayEvent, RelayEventSender, RelayTask};
use peerbridge_transport::StreamPair;
use tokio::net::TcpStream;

/// Relay that connects to the local service on `127.0.0.1:<server_port>`.
///
/// Reports [`RelayEvent::ConnectedToServer`] with the local port of the
/// connection, or [`RelayEvent::ServerConnectFailed`] if the service does
/// not accept it, in which case nothing is forwarded.
#[derive(Debug)]
pub struct ServerSocketRelay {
    server_port: u16,
    pub(crate) task: RelayTask,
}

impl ServerSocketRelay {
    /// Start connecting and, on success, forwarding
    pub fn connect(
        server_port: u16,
        streams: StreamPair,
        buffer_size: usize,
        events: RelayEventSender,
    ) -> Self {
        let task = RelayTask::spawn(run(server_port, streams, buffer_size, events));
        Self { server_port, task }
    }

    /// Port of the local service
    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    /// Whether the relay task is still running
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Close the connection to the service. Idempotent.
    pub async fn stop(&mut self) {
        self.task.stop().await;
    }
}

async fn run(server_port: u16, streams: StreamPair, buffer_size: usize, events: RelayEventSender) {
    let connected = TcpStream::connect(("127.0.0.1", server_port))
        .await
        .and_then(|socket| {
            let client_port = socket.local_addr()?.port();
            Ok((socket, client_port))
        });

    let (socket, client_port) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!("did not connect with server port {}: {}", server_port, e);
            let _ = events.send(RelayEvent::ServerConnectFailed { server_port });
            return;
        }
    };

    tracing::debug!(
        "Server relay connected to port {} from port {}",
        server_port,
        client_port
    );
    let _ = events.send(RelayEvent::ConnectedToServer { client_port });

    let error = forward(socket, streams, buffer_size).await;
    let _ = events.send(RelayEvent::Disconnected { error });
}
