//! End-to-end scenarios exercised over real loopback UDP sockets: an
//! `init()` helper installing a test-scoped `env_logger`, `#[tokio::test]`
//! async integration tests, bounded by `tokio::time::timeout` rather than
//! open-ended sleeps.

use bitdht::id::{Contact, Endpoint, NodeId};
use bitdht::message::Message;
use bitdht::node::Node;
use bitdht::transport::Transport;
use bitdht::Config;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::time::timeout;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

/// Two independent nodes over real sockets: a PING from A reaches B, B's
/// PONG reaches A, and A's routing table learns about B as a result.
#[tokio::test]
async fn two_nodes_ping_pong_over_loopback() {
    init();

    let a_addr = loopback(16775);
    let b_addr = loopback(16776);

    let mut a_transport = Transport::bind(a_addr).await.expect("bind a");
    let mut b_transport = Transport::bind(b_addr).await.expect("bind b");

    let mut a = Node::new(NodeId([1u8; 20]), Config::new());
    let b_id = NodeId([2u8; 20]);

    let b_endpoint: Endpoint = match b_addr {
        SocketAddr::V4(v4) => v4.into(),
        _ => unreachable!(),
    };
    a.send_ping(b_endpoint);
    for (bytes, to) in a.drain_outbound() {
        a_transport.queue_send(to, bytes);
    }
    // Polling is what actually flushes a transport's send queue over the
    // wire (see `Transport::poll`); a short timeout sends the PING and
    // gives up waiting for anything back from A in the same step.
    let _ = timeout(Duration::from_millis(100), &mut a_transport).await;

    // B receives and decodes the PING, then replies directly (bypassing
    // B's own Node so the test stays a focused wire-level handshake check).
    let (from, bytes) = timeout(Duration::from_secs(2), &mut b_transport)
        .await
        .expect("B did not receive the PING in time");
    let ping = Message::decode(&bytes).expect("valid PING datagram");
    let t = ping.transaction_id().clone();
    assert!(matches!(ping, Message::Ping { .. }));

    let pong = Message::Pong {
        t,
        id: b_id,
        v: Some(b"BD01".to_vec()),
    };
    b_transport.queue_send(from, pong.encode(10 * 1024).unwrap());
    // Polling the transport future is what actually drains its send queue
    // (see `Transport::poll`); a short timeout both flushes the PONG and
    // gives up waiting for anything further from B.
    let _ = timeout(Duration::from_millis(100), &mut b_transport).await;

    let (from2, bytes2) = timeout(Duration::from_secs(2), &mut a_transport)
        .await
        .expect("A did not receive the PONG in time");
    assert_eq!(from2, b_endpoint);
    let claimed = a.recv_pkt(&bytes2, from2, Instant::now()).unwrap();
    assert!(claimed);
    assert!(a.routing().contains(&Contact::new(b_id, b_endpoint)));
}
