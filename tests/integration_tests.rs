//! End-to-end tests over two coordinators sharing an in-memory transport.
//!
//! Each test drives the public `Coordinator` API the way an application
//! would and checks what the application observes: relay ports, echoed
//! bytes, events and logical connection state.

use peerbridge_core::{BridgeConfig, BridgeError, BridgeEvent, PeerConnection};
use peerbridge_integration_tests::fixtures::{EchoService, TwoNodeFixture};
use peerbridge_integration_tests::test_helpers::{payload, round_trip, wait_until};
use peerbridge_transport::{LinkState, MemoryNetwork};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const INITIATOR: &str = "initiator";
const RESPONDER: &str = "responder";

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_unknown_peer_fails_promptly() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();

    let started = Instant::now();
    let result = fixture.initiator.connect_to_peer("nobody").await;
    assert!(matches!(result, Err(BridgeError::PeerUnknown(_))));
    assert!(started.elapsed() < Duration::from_secs(1));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_forward_echo_round_trip() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();

    let connection = fixture.connect().await.unwrap();
    let port = match connection {
        PeerConnection::Forward { listening_port } => listening_port,
        other => panic!("expected forward connection, got {:?}", other),
    };
    assert!(port >= 1024, "relay port {} outside ephemeral range", port);

    // Exactly one session per side for the pair
    let responder = fixture.responder.clone();
    wait_until("responder inbound session", || {
        responder.server().sessions().len() == 1
    })
    .await;
    assert_eq!(fixture.initiator.client().sessions().len(), 1);

    let data = payload(4096);
    assert_eq!(round_trip(port, &data).await.unwrap(), data);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_connect_twice_reuses_relay() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();

    let first = fixture.connect().await.unwrap();
    let second = fixture.connect().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fixture.network.open_links(), 1);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_ordering_across_payload_sizes() {
    const BUFFER: usize = 1024;
    let mut initiator = BridgeConfig::new("echo-test", INITIATOR);
    initiator.relay_buffer_size = BUFFER;
    let mut responder = BridgeConfig::new("echo-test", RESPONDER);
    responder.relay_buffer_size = BUFFER;

    let mut fixture = TwoNodeFixture::new_with_config(
        initiator,
        responder,
        MemoryNetwork::with_stream_buffer(BUFFER),
    )
    .await
    .unwrap();
    fixture.start().await.unwrap();

    for size in [1, BUFFER - 1, BUFFER, BUFFER + 1, 7 * BUFFER + 13] {
        let connection = fixture.connect().await.unwrap();
        let data = payload(size);
        let echoed = round_trip(connection.listening_port(), &data).await.unwrap();
        assert_eq!(echoed.len(), size);
        assert!(echoed == data, "payload of {} bytes reordered", size);

        // One stream per link: wait for the relay to wind down before the next
        let session = fixture.initiator.client().session(RESPONDER).unwrap();
        wait_until("link to close after round trip", || {
            session.state() == LinkState::NotConnected
        })
        .await;
    }

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_connect_timeout() {
    let mut initiator = BridgeConfig::new("echo-test", INITIATOR);
    initiator.connect_timeout = Duration::from_millis(200);
    let network = MemoryNetwork::new();
    network.set_dial_delay(Duration::from_secs(3));

    let mut fixture = TwoNodeFixture::new_with_config(
        initiator,
        BridgeConfig::new("echo-test", RESPONDER),
        network,
    )
    .await
    .unwrap();
    fixture.start().await.unwrap();

    let started = Instant::now();
    let result = fixture.connect().await;
    assert!(matches!(result, Err(BridgeError::TransportConnectFailed(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(fixture.initiator.client().pending_count(), 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_peer_lost_while_connecting() {
    let network = MemoryNetwork::new();
    network.set_dial_delay(Duration::from_millis(500));
    let mut fixture = TwoNodeFixture::new_with_config(
        BridgeConfig::new("echo-test", INITIATOR),
        BridgeConfig::new("echo-test", RESPONDER),
        network,
    )
    .await
    .unwrap();
    fixture.start().await.unwrap();

    let initiator = fixture.initiator.clone();
    let connect = tokio::spawn(async move { initiator.connect_to_peer(RESPONDER).await });

    let client = fixture.initiator.client().clone();
    wait_until("dial to start", || {
        client
            .session(RESPONDER)
            .is_some_and(|s| s.state() == LinkState::Connecting)
    })
    .await;
    fixture.network.set_visibility(INITIATOR, RESPONDER, false);

    let result = connect.await.unwrap();
    assert!(matches!(result, Err(BridgeError::TransportConnectFailed(_))));

    let lost = fixture
        .next_initiator_event(|e| {
            matches!(e, BridgeEvent::PeerAvailabilityChanged(peers) if !peers[0].available)
        })
        .await;
    assert!(lost.is_some());

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_local_app_unreachable_on_responder() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    let dead_port = EchoService::closed_port().await.unwrap();
    fixture.initiator.start_listening_for_advertisements().await.unwrap();
    fixture
        .responder
        .start_advertising_and_listening(dead_port)
        .await
        .unwrap();
    let client = fixture.initiator.client().clone();
    wait_until("discovery", || client.session(RESPONDER).is_some()).await;

    fixture.connect().await.unwrap();
    let failed = fixture
        .next_responder_event(|e| matches!(e, BridgeEvent::IncomingConnectionFailed { .. }))
        .await;
    assert_eq!(
        failed,
        Some(BridgeEvent::IncomingConnectionFailed {
            server_port: dead_port
        })
    );

    fixture.cleanup().await;
}

// ============================================================================
// Reverse connect
// ============================================================================

#[tokio::test]
async fn test_reverse_connect_single_logical_link() {
    let mut fixture = TwoNodeFixture::new_reverse().await.unwrap();
    fixture.start().await.unwrap();

    let connection = fixture.connect().await.unwrap();
    assert!(connection.is_incoming());
    assert_eq!(connection.listening_port(), 0);
    match connection {
        PeerConnection::Incoming { server_port, .. } => {
            assert_eq!(server_port, fixture.initiator_service.port());
        }
        other => panic!("expected incoming, got {:?}", other),
    }

    // Initiator: only the inbound role is connected
    assert_eq!(fixture.initiator.logical_state(RESPONDER), LinkState::Connected);
    assert_eq!(
        fixture.initiator.client().session(RESPONDER).map(|s| s.state()),
        Some(LinkState::NotConnected)
    );
    // Responder: only the outbound role is connected
    let responder = fixture.responder.clone();
    wait_until("responder reverse relay", || {
        responder.logical_state(INITIATOR) == LinkState::Connected
    })
    .await;
    assert!(fixture.responder.server().session(INITIATOR).is_none());
    assert_eq!(fixture.network.open_links(), 1);

    // Data flows responder app -> initiator service and back
    let port = fixture.relay_port(connection).await;
    let data = payload(10_000);
    assert_eq!(round_trip(port, &data).await.unwrap(), data);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_reverse_connect_twice_reuses_link() {
    let mut fixture = TwoNodeFixture::new_reverse().await.unwrap();
    fixture.start().await.unwrap();

    let first = fixture.connect().await.unwrap();
    assert!(first.is_incoming());
    let port = fixture.reverse_listening_port().await;

    // The inbound link already realizes the logical connection
    let second = fixture.connect().await.unwrap();
    assert_eq!(second, first);
    assert_eq!(fixture.initiator.logical_state(RESPONDER), LinkState::Connected);
    assert_eq!(fixture.initiator.client().pending_count(), 0);
    assert_eq!(fixture.network.open_links(), 1);

    // And it still carries data
    let data = payload(4_096);
    assert_eq!(round_trip(port, &data).await.unwrap(), data);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_reverse_connect_without_advertising_fails() {
    let mut fixture = TwoNodeFixture::new_reverse().await.unwrap();
    fixture
        .responder
        .start_advertising_and_listening(fixture.responder_service.port())
        .await
        .unwrap();
    fixture.initiator.start_listening_for_advertisements().await.unwrap();
    let client = fixture.initiator.client().clone();
    wait_until("discovery", || client.session(RESPONDER).is_some()).await;

    let result = fixture.connect().await;
    assert!(matches!(result, Err(BridgeError::TransportConnectFailed(_))));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_reverse_connect_refused_by_peer_that_lost_us() {
    let mut fixture = TwoNodeFixture::new_reverse().await.unwrap();
    fixture.start().await.unwrap();

    // Hide the initiator from the responder: the dial-back request arrives
    // from a peer the responder cannot see
    fixture.network.set_visibility(RESPONDER, INITIATOR, false);
    let responder = fixture.responder.client().clone();
    wait_until("responder to drop initiator", || {
        responder.session(INITIATOR).is_none()
    })
    .await;

    let result = fixture.connect().await;
    assert!(matches!(result, Err(BridgeError::TransportConnectFailed(_))));
    assert_eq!(fixture.initiator.client().pending_count(), 0);

    fixture.cleanup().await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_disconnect_is_observed_by_both_sides() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();
    fixture.connect().await.unwrap();

    let responder = fixture.responder.clone();
    wait_until("responder inbound link", || {
        responder.logical_state(INITIATOR) == LinkState::Connected
    })
    .await;

    fixture.initiator.disconnect(RESPONDER).await.unwrap();
    assert_eq!(fixture.initiator.logical_state(RESPONDER), LinkState::NotConnected);
    wait_until("responder to drop inbound link", || {
        responder.logical_state(INITIATOR) == LinkState::NotConnected
    })
    .await;

    // Disconnecting again is harmless
    fixture.initiator.disconnect(RESPONDER).await.unwrap();
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_severed_link_reports_disconnect() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();
    fixture.connect().await.unwrap();

    fixture.network.sever(INITIATOR, RESPONDER);
    let event = fixture
        .next_initiator_event(|e| matches!(e, BridgeEvent::PeerDisconnected { .. }))
        .await;
    assert_eq!(
        event,
        Some(BridgeEvent::PeerDisconnected {
            peer_identifier: RESPONDER.to_string()
        })
    );

    // The peer is still visible, so a new connect works
    let connection = fixture.connect().await.unwrap();
    assert!(connection.listening_port() > 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_kill_connection_closes_app_socket() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();

    let connection = fixture.connect().await.unwrap();
    let mut socket = TcpStream::connect(("127.0.0.1", connection.listening_port()))
        .await
        .unwrap();

    fixture.initiator.kill_connection(RESPONDER).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("socket stayed open after kill");
    assert!(matches!(read, Ok(0) | Err(_)));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();
    fixture.connect().await.unwrap();

    let session = fixture.initiator.client().session(RESPONDER).unwrap();
    fixture.cleanup().await;
    fixture.cleanup().await;

    assert!(session.snapshot().stopped);
    session.stop().await;
    assert_eq!(fixture.network.open_links(), 0);
    assert_eq!(
        fixture.initiator.connect_to_peer(RESPONDER).await,
        Err(BridgeError::Shutdown)
    );
}

// ============================================================================
// Churn
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discovery_churn_with_connects() {
    let mut fixture = TwoNodeFixture::new().await.unwrap();
    fixture.start().await.unwrap();

    let network = fixture.network.clone();
    let flapper = tokio::spawn(async move {
        for i in 0..40 {
            network.set_visibility(INITIATOR, RESPONDER, i % 2 == 1);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        network.set_visibility(INITIATOR, RESPONDER, true);
    });

    let mut workers = Vec::new();
    for _ in 0..4 {
        let initiator = fixture.initiator.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..10 {
                match initiator.connect_to_peer(RESPONDER).await {
                    Ok(_) => {
                        let _ = initiator.disconnect(RESPONDER).await;
                    }
                    Err(
                        BridgeError::PeerUnknown(_)
                        | BridgeError::InvalidState(_)
                        | BridgeError::TransportConnectFailed(_)
                        | BridgeError::LinkFailure(_),
                    ) => {}
                    Err(other) => panic!("unexpected error under churn: {:?}", other),
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    flapper.await.unwrap();
    for worker in workers {
        worker.await.unwrap();
    }

    // Settled: at most one client session for the peer, and it works
    let client = fixture.initiator.client().clone();
    wait_until("responder visible again", || client.session(RESPONDER).is_some()).await;
    assert_eq!(client.sessions().len(), 1);
    assert_eq!(client.pending_count(), 0);

    let session = client.session(RESPONDER).unwrap();
    wait_until("churn to settle", || session.state() != LinkState::Connecting).await;
    let _ = fixture.initiator.disconnect(RESPONDER).await;

    let connection = fixture.connect().await.unwrap();
    let data = payload(2048);
    assert_eq!(
        round_trip(connection.listening_port(), &data).await.unwrap(),
        data
    );

    fixture.cleanup().await;
}
