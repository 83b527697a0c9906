//! E2E tests for the websocket room relay
//!
//! Tests the full flow: connect -> host/join a room -> exchange messages -> leave

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_test::assert_err;

use tandem::network::{
    ConnectionLifecycle, ConnectionState, DisconnectCause, LifecycleConfig, MessageBus,
    NetworkError, RelayServer, RelayTransport, Transport,
};
use tandem::protocol::SyncMessage;

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Start a relay in the background and return it with its URL
async fn start_test_server() -> (RelayServer, String, tokio::task::JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{}", port);
    let server = RelayServer::new();
    let runner = server.clone();
    let handle = tokio::spawn(async move {
        let _ = runner.run(&addr).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (server, format!("ws://127.0.0.1:{}", port), handle)
}

async fn wait_for_state(lifecycle: &ConnectionLifecycle, state: ConnectionState) -> bool {
    for _ in 0..150 {
        if lifecycle.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Test: Host and guest meet through the relay
/// Given a running relay server
/// When a host opens a room and a guest joins with its code
/// Then both lifecycles reach Connected and messages flow both ways
#[tokio::test]
async fn test_host_and_guest_exchange_messages() {
    let (server, url, server_handle) = start_test_server().await;

    let host_transport = RelayTransport::connect(&url).await.expect("Host connect");
    let guest_transport = RelayTransport::connect(&url).await.expect("Guest connect");
    let host = ConnectionLifecycle::new(host_transport.clone(), LifecycleConfig::default());
    let guest = ConnectionLifecycle::new(guest_transport.clone(), LifecycleConfig::default());

    let host_bus = MessageBus::new(host_transport.clone());
    let guest_bus = MessageBus::new(guest_transport.clone());
    host_bus.start_receive_loop();
    guest_bus.start_receive_loop();

    let host_inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = host_inbox.clone();
    host_bus.subscribe(move |inbound| {
        sink.lock().push(inbound.clone());
        Ok(())
    });
    let guest_inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = guest_inbox.clone();
    guest_bus.subscribe(move |inbound| {
        sink.lock().push(inbound.clone());
        Ok(())
    });

    let code = host.host_session().await.expect("Host session");
    guest
        .join_session(code.as_str())
        .await
        .expect("Join session");

    assert!(wait_for_state(&host, ConnectionState::Connected).await);
    assert_eq!(guest.state(), ConnectionState::Connected);
    assert_eq!(server.room_count().await, 1);

    guest_bus
        .broadcast(&SyncMessage::Ping { sent_at_ms: 42 })
        .expect("Guest send");
    host_bus
        .send(
            &SyncMessage::RoomClear { room_id: 3 },
            Some(guest_transport.local_peer_id()),
        )
        .expect("Host send");
    tokio::time::sleep(Duration::from_millis(200)).await;

    {
        let received = host_inbox.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from, guest_transport.local_peer_id());
        assert_eq!(received[0].message, SyncMessage::Ping { sent_at_ms: 42 });
    }
    {
        let received = guest_inbox.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, SyncMessage::RoomClear { room_id: 3 });
    }

    guest.disconnect();
    assert!(wait_for_state(&host, ConnectionState::Waiting).await);

    host.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.room_count().await, 0);

    server_handle.abort();
}

/// Test: Connection refused
/// Given no relay listening on the port
/// When a client connects
/// Then connect fails with an error
#[tokio::test]
async fn test_connect_refused() {
    let port = find_available_port();
    let result = RelayTransport::connect(&format!("ws://127.0.0.1:{}", port)).await;
    assert!(result.is_err());
}

/// Test: A third peer cannot enter a full room
/// Given a room with a host and a guest
/// When a third peer joins with the same code
/// Then it is told the room is full without waiting out the join timeout
#[tokio::test]
async fn test_full_room_rejects_third_peer() {
    let (_server, url, server_handle) = start_test_server().await;

    let host_transport = RelayTransport::connect(&url).await.expect("Host connect");
    let guest_transport = RelayTransport::connect(&url).await.expect("Guest connect");
    let third_transport = RelayTransport::connect(&url).await.expect("Third connect");
    let host = ConnectionLifecycle::new(host_transport, LifecycleConfig::default());
    let guest = ConnectionLifecycle::new(guest_transport, LifecycleConfig::default());
    let third = ConnectionLifecycle::new(third_transport, LifecycleConfig::default());

    let code = host.host_session().await.expect("Host session");
    guest.join_session(code.as_str()).await.expect("Join session");

    let result = tokio::time::timeout(Duration::from_secs(2), third.join_session(code.as_str()))
        .await
        .expect("Room full should be reported promptly");
    let err = assert_err!(result);
    assert!(matches!(err, NetworkError::RoomFull));
    assert_eq!(third.state(), ConnectionState::Disconnected);
    assert_eq!(third.disconnect_cause(), Some(DisconnectCause::RoomFull));
    assert_eq!(host.state(), ConnectionState::Connected);
    assert_eq!(guest.state(), ConnectionState::Connected);

    server_handle.abort();
}

/// Test: A guest whose socket drops gets back into the room
/// Given a host and a guest connected through the relay
/// When the guest's websocket closes underneath it
/// Then the transport redials, the guest reconnects and messages flow again
#[tokio::test]
async fn test_guest_socket_drop_reconnects() {
    let (server, url, server_handle) = start_test_server().await;
    let config = LifecycleConfig {
        reconnect_delay: Duration::from_millis(200),
        reconnect_wait: Duration::from_secs(2),
        ..LifecycleConfig::default()
    };

    let host_transport = RelayTransport::connect(&url).await.expect("Host connect");
    let guest_transport = RelayTransport::connect(&url).await.expect("Guest connect");
    let host = ConnectionLifecycle::new(host_transport.clone(), config.clone());
    let guest = ConnectionLifecycle::new(guest_transport.clone(), config);

    let guest_states = Arc::new(Mutex::new(Vec::new()));
    let sink = guest_states.clone();
    guest.subscribe(move |state| {
        sink.lock().push(*state);
        Ok(())
    });

    let host_bus = MessageBus::new(host_transport.clone());
    host_bus.start_receive_loop();
    let host_inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = host_inbox.clone();
    host_bus.subscribe(move |inbound| {
        sink.lock().push(inbound.clone());
        Ok(())
    });
    let guest_bus = MessageBus::new(guest_transport.clone());

    let code = host.host_session().await.expect("Host session");
    guest.join_session(code.as_str()).await.expect("Join session");
    assert!(wait_for_state(&host, ConnectionState::Connected).await);

    guest_transport.drop_connection();
    assert!(wait_for_state(&guest, ConnectionState::Reconnecting).await);

    assert!(wait_for_state(&guest, ConnectionState::Connected).await);
    assert!(guest_states.lock().contains(&ConnectionState::Reconnecting));
    assert!(wait_for_state(&host, ConnectionState::Connected).await);
    assert!(guest_transport.is_open());
    assert_eq!(server.room_count().await, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    guest_bus
        .broadcast(&SyncMessage::Ping { sent_at_ms: 7 })
        .expect("Guest send after reconnect");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let received = host_inbox.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from, guest_transport.local_peer_id());

    server_handle.abort();
}
