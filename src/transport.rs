//! The transport adapter (§4.10): bounds the UDP socket between the wire
//! and [`crate::node::Node`]'s inbound/outbound FIFOs.
//!
//! `Transport` itself is a bare `Future` wrapping a `tokio::net::UdpSocket`:
//! each poll drains the send queue before attempting a receive, re-queuing
//! the head of the send queue on `Poll::Pending` rather than blocking.
//! `run_node` is the higher-level driver that ties a `Transport` to a
//! `Node`/`Manager` pair at the cadences named in §2 and §4.10.

use crate::id::Endpoint;
use crate::manager::Manager;
use crate::node::{Node, MAX_DATAGRAM_LEN};
use crate::tunnel::Tunnel;
use core::pin::Pin;
use futures::Future;
use log::debug;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::task::{self, Poll};
use tokio::net::UdpSocket;
use tokio::pin;

/// Outbound datagrams emitted per 20 ms tick ceiling (§4.10: "~5 000
/// messages/s ceiling"). The node-level rate class further limits this per
/// one-second maintenance iteration.
pub const MAX_SENDS_PER_TICK: usize = 100;
pub const SEND_TICK: std::time::Duration = std::time::Duration::from_millis(20);
pub const MAINTENANCE_TICK: std::time::Duration = std::time::Duration::from_secs(1);

/// Bare UDP transport: a `Future` that resolves once with the next
/// successfully decoded-at-the-byte-level datagram (decoding into a
/// [`crate::message::Message`] is the node core's job, not this layer's).
pub struct Transport {
    socket: UdpSocket,
    recv_buffer: Box<[u8; MAX_DATAGRAM_LEN]>,
    send_queue: VecDeque<(Endpoint, Vec<u8>)>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(&addr).await?;
        Ok(Transport {
            socket,
            recv_buffer: Box::new([0u8; MAX_DATAGRAM_LEN]),
            send_queue: VecDeque::new(),
        })
    }

    pub fn queue_send(&mut self, to: Endpoint, bytes: Vec<u8>) {
        if self.send_queue.len() >= MAX_SENDS_PER_TICK * 8 {
            self.send_queue.pop_front();
        }
        self.send_queue.push_back((to, bytes));
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Future for Transport {
    type Output = (Endpoint, Vec<u8>);

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let transport = self.get_mut();

        let mut sent_this_tick = 0;
        while let Some((to, bytes)) = transport.send_queue.pop_front() {
            let future = transport.socket.send_to(&bytes, to.to_socket_addr());
            pin!(future);
            match future.poll(cx) {
                Poll::Ready(Ok(_)) => {
                    sent_this_tick += 1;
                    if sent_this_tick >= MAX_SENDS_PER_TICK {
                        break;
                    }
                }
                Poll::Pending => {
                    transport.send_queue.push_front((to, bytes));
                    cx.waker().wake_by_ref();
                    break;
                }
                Poll::Ready(Err(e)) => {
                    debug!("dropping datagram to {}: {}", to, e);
                }
            }
        }

        loop {
            let mut recv_buf = transport.recv_buffer.clone();
            let future = transport.socket.recv_from(&mut recv_buf[..]);
            pin!(future);
            match future.poll(cx) {
                Poll::Ready(Ok((len, src))) => {
                    let data = recv_buf[..len].to_vec();
                    transport.recv_buffer = recv_buf;
                    if let SocketAddr::V4(v4) = src {
                        return Poll::Ready((v4.into(), data));
                    }
                    // IPv6 sources are outside the wire format (§6); ignore
                    // and keep draining.
                }
                Poll::Pending => break,
                Poll::Ready(Err(e)) => {
                    debug!("udp recv error: {}", e);
                    break;
                }
            }
        }
        Poll::Pending
    }
}

/// Drives the node/manager pair (and, if bound to the same port, the tunnel
/// subsystem) against a bound [`Transport`] until the manager returns to
/// OFF. Receives are applied as they arrive; the maintenance tick (manager
/// lifecycle + node `iteration` + tunnel `iteration`) runs on a fixed
/// one-second cadence, matching §2's control-flow summary.
///
/// `tunnel` is `None` for callers that only need the DHT core. When
/// present, it is offered every datagram the node core itself did not claim
/// (§5, "Shared resource policy": insertion order, first claim wins).
pub async fn run_node(
    mut transport: Transport,
    mut node: Node,
    mut manager: Manager,
    config: crate::config::Config,
    mut tunnel: Option<Tunnel>,
) {
    let mut maintenance = tokio::time::interval(MAINTENANCE_TICK);
    manager.start_dht(std::time::Instant::now());
    if let Some(t) = tunnel.as_mut() {
        t.start(std::time::Instant::now());
    }

    loop {
        tokio::select! {
            (from, bytes) = &mut transport => {
                let now = std::time::Instant::now();
                match node.recv_pkt(&bytes, from, now) {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Some(t) = tunnel.as_mut() {
                            if let Err(e) = t.recv_pkt(&bytes, from, now) {
                                debug!("tunnel subsystem rejected datagram from {}: {}", from, e);
                            }
                        }
                    }
                    Err(e) => debug!("dropping datagram from {}: {}", from, e),
                }
                for (bytes, to) in node.drain_outbound() {
                    transport.queue_send(to, bytes);
                }
                if let Some(t) = tunnel.as_mut() {
                    for (bytes, to) in t.drain_outbound() {
                        transport.queue_send(to, bytes);
                    }
                }
            }
            _ = maintenance.tick() => {
                let now = std::time::Instant::now();
                manager.tick(&mut node, &config, now);
                node.iteration(now);
                for (bytes, to) in node.drain_outbound() {
                    transport.queue_send(to, bytes);
                }
                if let Some(t) = tunnel.as_mut() {
                    t.iteration(now);
                    for (bytes, to) in t.drain_outbound() {
                        transport.queue_send(to, bytes);
                    }
                }
                if manager.state() == crate::manager::LifecycleState::Off {
                    break;
                }
            }
        }
    }
}
