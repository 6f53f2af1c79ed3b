//! Peer-pool maintenance tests against scripted remote peers: address
//! discovery through getaddr, and termination of peers that fail to
//! answer in time.

use btc_network::{
    encode_message, read_message, Address, AddrPayload, Command, NetworkAddress, Payload, Services,
    VersionPayload, PROTOCOL_VERSION,
};
use btc_node::{Node, NodeConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Answer the node's opening handshake from the server side.
async fn serve_handshake(stream: &mut TcpStream) {
    let msg = read_message(stream).await.unwrap();
    assert_eq!(msg.command(), Command::Version);

    let zero = NetworkAddress::new(
        Services::NODE_NETWORK,
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
    );
    let version = VersionPayload {
        version: PROTOCOL_VERSION,
        services: Services::NODE_NETWORK,
        timestamp: 0,
        addr_recv: zero.clone(),
        addr_from: zero,
        nonce: 11,
        user_agent: "/scripted:0.1/".to_string(),
        start_height: 0,
        relay: false,
    };
    stream
        .write_all(&encode_message(&Payload::Version(version)))
        .await
        .unwrap();

    let msg = read_message(stream).await.unwrap();
    assert_eq!(msg.command(), Command::Verack);
    stream
        .write_all(&encode_message(&Payload::Verack))
        .await
        .unwrap();
}

/// Read messages until one carries the wanted command, or the stream
/// dies (returns None).
async fn next_command(stream: &mut TcpStream, command: Command) -> Option<Payload> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match read_message(stream).await {
                Ok(msg) if msg.command() == command => return Some(msg.payload),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

fn localhost_entry(addr: SocketAddr) -> Address {
    Address {
        timestamp: 1_700_000_000,
        address: NetworkAddress::new(Services::NODE_NETWORK, addr.ip(), addr.port()),
    }
}

// The node is one peer short: it asks its live peer for addresses, then
// dials the returned address and completes a second handshake.
#[tokio::test]
async fn test_getaddr_discovery_fills_the_pool() {
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first_addr = first.local_addr().unwrap();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second_addr = second.local_addr().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        min_peers: 2,
        blocks_file: dir.path().join("peers-discovery.dat"),
        ..NodeConfig::default()
    };
    let node = Node::new(config);
    let state = node.state();

    // first peer: answers getaddr with the second listener's address
    let first_server = tokio::spawn(async move {
        let (mut stream, _) = first.accept().await.unwrap();
        serve_handshake(&mut stream).await;

        let payload = next_command(&mut stream, Command::GetAddr).await;
        assert_eq!(payload, Some(Payload::GetAddr));
        let reply = AddrPayload {
            addresses: vec![localhost_entry(second_addr)],
        };
        stream
            .write_all(&encode_message(&Payload::Addr(reply)))
            .await
            .unwrap();

        // hold the connection until shutdown
        while next_command(&mut stream, Command::Ping).await.is_some() {}
    });

    // second peer: just completes the handshake and stays quiet
    let second_server = tokio::spawn(async move {
        let (mut stream, _) = second.accept().await.unwrap();
        serve_handshake(&mut stream).await;
        while next_command(&mut stream, Command::Ping).await.is_some() {}
    });

    state
        .add_peer(first_addr, Services::NODE_NETWORK)
        .await
        .expect("handshake with first scripted peer");
    let supervisor = tokio::spawn(node.run());

    tokio::time::timeout(Duration::from_secs(10), async {
        while state.peer_count() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("node never reached the minimum peer count");

    state.quit();
    supervisor.await.unwrap();
    first_server.await.unwrap();
    second_server.await.unwrap();
}

// A peer that never answers getaddr within the deadline is terminated,
// and with nothing left to dial the node reaches its terminal state.
#[tokio::test]
async fn test_silent_getaddr_peer_is_dropped_and_node_gives_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        min_peers: 2,
        getaddr_wait: Duration::from_millis(300),
        blocks_file: dir.path().join("peers-silent.dat"),
        ..NodeConfig::default()
    };
    let node = Node::new(config);
    let state = node.state();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_handshake(&mut stream).await;
        // swallow everything, never answer the getaddr
        while next_command(&mut stream, Command::Ping).await.is_some() {}
    });

    state
        .add_peer(addr, Services::NODE_NETWORK)
        .await
        .expect("handshake with scripted peer");
    let supervisor = tokio::spawn(node.run());

    // the silent peer is dropped, leaving no peers and no addresses
    tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .expect("node did not give up")
        .unwrap();

    assert!(state.has_quit());
    assert_eq!(state.peer_count(), 0);
    server.await.unwrap();
}
