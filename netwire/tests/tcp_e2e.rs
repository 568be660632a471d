mod common;

use std::time::Duration;

use common::{
    ClientEvent, EVENT_TIMEOUT, RecordingClientListener, RecordingServerListener, ServerEvent,
    collect_server_bytes, free_tcp_port,
};
use netwire::{TcpClient, TcpServer};

#[test]
fn test_tcp_echo() {
    let port = free_tcp_port();
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::echoing(b"world");
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    let client = TcpClient::new("127.0.0.1", port);
    let (client_listener, client_rx) = RecordingClientListener::new();
    client.set_listener(client_listener.clone());
    assert!(client.init());
    assert!(client.connect());

    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Accept(_) => {}
        other => panic!("expected accept, got {other:?}"),
    }

    assert!(client.send(b"hello"));
    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Receive(_, bytes) => assert_eq!(bytes, b"hello"),
        other => panic!("expected receive, got {other:?}"),
    }

    match client_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ClientEvent::Receive(_, bytes) => assert_eq!(bytes, b"world"),
        other => panic!("expected receive, got {other:?}"),
    }

    client.close();
    server.stop();
}

#[test]
fn test_tcp_large_write() {
    let port = free_tcp_port();
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    let client = TcpClient::new("127.0.0.1", port);
    assert!(client.init());
    assert!(client.connect());

    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Accept(_) => {}
        other => panic!("expected accept, got {other:?}"),
    }

    const PAYLOAD_LEN: usize = 1_048_576;
    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
    assert!(client.send(&payload));

    let received = collect_server_bytes(&server_rx, PAYLOAD_LEN);
    assert_eq!(received.len(), PAYLOAD_LEN);
    assert_eq!(received, payload);

    client.close();
    server.stop();
}

#[test]
fn test_tcp_peer_close_detection() {
    let port = free_tcp_port();
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    let client = TcpClient::new("127.0.0.1", port);
    assert!(client.init());
    assert!(client.connect());

    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Accept(_) => {}
        other => panic!("expected accept, got {other:?}"),
    }

    assert!(client.send(b"ping"));
    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Receive(_, bytes) => assert_eq!(bytes, b"ping"),
        other => panic!("expected receive, got {other:?}"),
    }

    client.close();

    // The peer close surfaces as on_close, never on_error.
    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Close(_) => {}
        other => panic!("expected close, got {other:?}"),
    }

    server.stop();
}

#[test]
fn test_tcp_send_ordering_under_load() {
    let port = free_tcp_port();
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    let client = TcpClient::new("127.0.0.1", port);
    assert!(client.init());
    assert!(client.connect());

    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Accept(_) => {}
        other => panic!("expected accept, got {other:?}"),
    }

    // Rapid sends force the send queue through the partial-write and
    // write-arming paths; every byte must arrive in order.
    const CHUNKS: usize = 100;
    const CHUNK_LEN: usize = 4096;
    for i in 0..CHUNKS {
        let chunk = vec![i as u8; CHUNK_LEN];
        assert!(client.send(&chunk));
    }

    let received = collect_server_bytes(&server_rx, CHUNKS * CHUNK_LEN);
    for (i, chunk) in received.chunks(CHUNK_LEN).enumerate() {
        assert!(
            chunk.iter().all(|&b| b == i as u8),
            "chunk {i} out of order"
        );
    }

    client.close();
    server.stop();
}

#[test]
fn test_accept_drains_backlog() {
    let port = free_tcp_port();
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    // A burst of connections must all surface as accepts.
    let clients: Vec<TcpClient> = (0..5)
        .map(|_| {
            let client = TcpClient::new("127.0.0.1", port);
            assert!(client.init());
            assert!(client.connect());
            client
        })
        .collect();

    for _ in 0..clients.len() {
        match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
            ServerEvent::Accept(_) => {}
            other => panic!("expected accept, got {other:?}"),
        }
    }

    for client in &clients {
        client.close();
    }
    server.stop();
}

#[test]
fn test_send_rejects_empty_payload() {
    let port = free_tcp_port();
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    let client = TcpClient::new("127.0.0.1", port);
    assert!(client.init());
    assert!(client.connect());

    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Accept(_) => {}
        other => panic!("expected accept, got {other:?}"),
    }

    assert!(!client.send(b""));

    // The empty send must not have perturbed the queue.
    assert!(client.send(b"after"));
    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Receive(_, bytes) => assert_eq!(bytes, b"after"),
        other => panic!("expected receive, got {other:?}"),
    }

    client.close();
    server.stop();
}

#[test]
fn test_connect_to_closed_port_fails() {
    let port = free_tcp_port();
    let client = TcpClient::new("127.0.0.1", port);
    assert!(client.init());
    assert!(!client.connect());

    // The socket was re-created; a later connect to a live server works.
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    assert!(client.connect());
    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Accept(_) => {}
        other => panic!("expected accept, got {other:?}"),
    }

    client.close();
    server.stop();
}

#[test]
fn test_no_callbacks_after_stop() {
    let port = free_tcp_port();
    let server = TcpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    let client = TcpClient::new("127.0.0.1", port);
    assert!(client.init());
    assert!(client.connect());

    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Accept(_) => {}
        other => panic!("expected accept, got {other:?}"),
    }

    server.stop();

    // Sends after the server stopped cannot produce server callbacks.
    let _ = client.send(b"into the void");
    assert!(server_rx.recv_timeout(Duration::from_millis(300)).is_err());

    client.close();
}
