mod common;

use common::{
    ClientEvent, EVENT_TIMEOUT, RecordingClientListener, RecordingServerListener, ServerEvent,
};
use netwire::{UdpClient, UdpServer, get_idle_udp_port, get_idle_udp_port_pair};

#[test]
fn test_udp_echo() {
    let port = get_idle_udp_port().expect("no idle udp port");
    let server = UdpServer::with_addr("127.0.0.1", port);
    let (server_listener, server_rx) = RecordingServerListener::echoing(b"world");
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    let client = UdpClient::new("127.0.0.1", port);
    let (client_listener, client_rx) = RecordingClientListener::new();
    client.set_listener(client_listener.clone());
    assert!(client.init());

    assert!(client.send(b"hello udp"));

    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Receive(_, bytes) => assert_eq!(bytes, b"hello udp"),
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
fn test_udp_send_to_peer() {
    let server_port = get_idle_udp_port().expect("no idle udp port");
    let client_port = get_idle_udp_port().expect("no idle udp port");

    let server = UdpServer::with_addr("127.0.0.1", server_port);
    let (server_listener, server_rx) = RecordingServerListener::new();
    server.set_listener(server_listener.clone());
    assert!(server.init());
    assert!(server.start());

    // Client bound to a known local port so the server can address it
    // directly.
    let client = UdpClient::with_local("127.0.0.1", server_port, "127.0.0.1", client_port);
    let (client_listener, client_rx) = RecordingClientListener::new();
    client.set_listener(client_listener.clone());
    assert!(client.init());

    assert!(client.send(b"register me"));
    match server_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ServerEvent::Receive(_, bytes) => assert_eq!(bytes, b"register me"),
        other => panic!("expected receive, got {other:?}"),
    }

    assert!(server.send_to("127.0.0.1", client_port, b"direct"));
    match client_rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
        ClientEvent::Receive(_, bytes) => assert_eq!(bytes, b"direct"),
        other => panic!("expected receive, got {other:?}"),
    }

    client.close();
    server.stop();
}

#[test]
fn test_udp_rejects_empty_send() {
    let port = get_idle_udp_port().expect("no idle udp port");
    let client = UdpClient::new("127.0.0.1", port);
    assert!(client.init());
    assert!(!client.send(b""));
    client.close();
}

#[test]
fn test_idle_port_pair() {
    let first = get_idle_udp_port_pair().expect("no idle udp port pair");

    let a = UdpServer::with_addr("127.0.0.1", first);
    let b = UdpServer::with_addr("127.0.0.1", first + 1);
    assert!(a.init());
    assert!(b.init());
}
