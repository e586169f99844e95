//! The hole-punch tunnel subsystem (§4.9): a second, node-like component
//! sharing the same UDP port and bencode codec as [`crate::node::Node`], but
//! owning its own request list and a reduced state machine
//! (OFF -> STARTUP -> NEWCONN <-> FAILED).
//!
//! Also resolves the three-party BROADCAST_CONN/ASK_CONN/REPLY_CONN flow: A
//! asks intermediary M to forward an ASK_CONN to peer P carrying A's
//! observed address; P replies with REPLY_CONN to M; M relays it to A as the
//! NEWCONN result (§9, resolved).

use crate::callback::{CallbackRegistry, PeerStatus};
use crate::error::DhtError;
use crate::id::{Contact, Endpoint, NodeId};
use crate::message::{Message, TransactionId};
use fnv::FnvHashMap;
use log::debug;
use std::time::{Duration, Instant};

const NEWCONN_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    Off,
    Startup,
    NewConn,
    Failed,
}

/// A connect request awaiting a REPLY_NEWCONN (direct) or REPLY_CONN
/// (relayed via an intermediary).
struct PendingConnect {
    contact: Contact,
    started_at: Instant,
    last_sent: Option<Instant>,
}

/// A BROADCAST_CONN this node is relaying as intermediary M: forward one
/// ASK_CONN to `target`, and relay whatever REPLY_CONN comes back to
/// `requester`.
struct RelayedAsk {
    requester: Contact,
    requester_nid: NodeId,
    target: Contact,
    transaction_id: TransactionId,
}

pub struct Tunnel {
    local_id: NodeId,
    state: TunnelState,
    entered_state_at: Instant,
    pending_connects: FnvHashMap<NodeId, PendingConnect>,
    relays: FnvHashMap<TransactionId, RelayedAsk>,
    outbound: Vec<(Vec<u8>, Endpoint)>,
    txn_counter: u16,
    callbacks: CallbackRegistry,
}

impl Tunnel {
    pub fn new(local_id: NodeId) -> Self {
        Tunnel {
            local_id,
            state: TunnelState::Off,
            entered_state_at: Instant::now(),
            pending_connects: FnvHashMap::default(),
            relays: FnvHashMap::default(),
            outbound: Vec::new(),
            txn_counter: 0,
            callbacks: CallbackRegistry::new(),
        }
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackRegistry {
        &mut self.callbacks
    }

    pub fn drain_outbound(&mut self) -> Vec<(Vec<u8>, Endpoint)> {
        self.outbound.drain(..).collect()
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        let t = self.txn_counter % 100;
        self.txn_counter = self.txn_counter.wrapping_add(1);
        TransactionId(format!("{:02}", t).into_bytes())
    }

    fn send(&mut self, msg: Message, to: Endpoint) {
        if let Ok(bytes) = msg.encode(crate::node::MAX_DATAGRAM_LEN) {
            self.outbound.push((bytes, to));
        }
    }

    pub fn start(&mut self, now: Instant) {
        if self.state == TunnelState::Off {
            self.state = TunnelState::Startup;
            self.entered_state_at = now;
        }
    }

    /// §4.9 `connectNode`: registers a pending tunnel request. Emissions
    /// happen from `iteration` while in the NEWCONN state.
    pub fn connect_node(&mut self, contact: Contact, now: Instant) {
        self.pending_connects.entry(contact.id).or_insert(PendingConnect {
            contact,
            started_at: now,
            last_sent: None,
        });
        if self.state == TunnelState::Startup {
            self.state = TunnelState::NewConn;
            self.entered_state_at = now;
        }
    }

    /// Relays a hole-punch request through intermediary `via`: this node
    /// asks `via` to forward an ASK_CONN to `target` (§4.9, three-party
    /// flow, step 1: A -> M).
    pub fn broadcast_connect(&mut self, via: Endpoint, target: NodeId, target_pid: Contact) {
        let t = self.next_transaction_id();
        self.send(
            Message::BroadcastConn {
                t,
                id: self.local_id,
                nid: target,
                pid: target_pid,
            },
            via,
        );
    }

    /// Per-tick emission: one NEWCONN per unresolved pending connect whose
    /// last attempt is stale.
    pub fn iteration(&mut self, now: Instant) -> usize {
        if self.state != TunnelState::NewConn {
            return 0;
        }
        let expired: Vec<NodeId> = self
            .pending_connects
            .iter()
            .filter(|(_, p)| now.duration_since(p.started_at) > NEWCONN_MAX_AGE)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.pending_connects.remove(id);
        }
        if !expired.is_empty() && self.pending_connects.is_empty() {
            self.state = TunnelState::Failed;
        }

        let mut sent = 0;
        let due: Vec<(NodeId, Endpoint)> = self
            .pending_connects
            .iter()
            .filter(|(_, p)| p.last_sent.map_or(true, |t| now.duration_since(t) > Duration::from_secs(1)))
            .map(|(id, p)| (*id, p.contact.endpoint))
            .collect();
        for (id, endpoint) in due {
            if let Some(p) = self.pending_connects.get_mut(&id) {
                p.last_sent = Some(now);
            }
            let t = self.next_transaction_id();
            self.send(Message::NewConn { t, id: self.local_id }, endpoint);
            sent += 1;
        }
        sent
    }

    /// §4.9 / §5 shared-socket policy: the node core already refused
    /// NEWCONN-family messages (`Node::recv_pkt` returns `Ok(false)` for
    /// them); this is where they are actually claimed and processed.
    pub fn recv_pkt(&mut self, bytes: &[u8], from: Endpoint, now: Instant) -> Result<bool, DhtError> {
        let msg = Message::decode(bytes)?;
        match msg {
            Message::NewConn { t, id } => {
                let pid = Contact::new(id, from);
                self.send(
                    Message::ReplyNewConn {
                        t,
                        id: self.local_id,
                        pid,
                    },
                    from,
                );
                Ok(true)
            }
            Message::ReplyNewConn { id, .. } => {
                if self.pending_connects.remove(&id).is_some() {
                    self.callbacks.notify_peer(id, PeerStatus::PeerOnline, Some(from));
                }
                Ok(true)
            }
            Message::BroadcastConn { t, id, nid, pid } => {
                // We are the intermediary M: forward an ASK_CONN to the
                // target, remembering who to relay the answer back to.
                self.relays.insert(
                    t.clone(),
                    RelayedAsk {
                        requester: Contact::new(id, from),
                        requester_nid: nid,
                        target: pid,
                        transaction_id: t.clone(),
                    },
                );
                self.send(
                    Message::AskConn {
                        t,
                        id: self.local_id,
                        nid,
                        pid,
                    },
                    pid.endpoint,
                );
                Ok(true)
            }
            Message::AskConn { t, nid, pid, .. } => {
                // We are P: attempt to reach `nid` at the address the
                // intermediary reported, and tell M (our sender) the
                // outcome.
                self.connect_node(pid, now);
                self.send(
                    Message::ReplyConn {
                        t,
                        id: self.local_id,
                        nid,
                        pid,
                    },
                    from,
                );
                Ok(true)
            }
            Message::ReplyConn { t, nid, pid, .. } => {
                // We are M: relay the outcome back to the original
                // requester A.
                if let Some(relay) = self.relays.remove(&t) {
                    self.send(
                        Message::ReplyConn {
                            t,
                            id: self.local_id,
                            nid: relay.requester_nid,
                            pid,
                        },
                        relay.requester.endpoint,
                    );
                } else {
                    debug!("unsolicited REPLY_CONN for nid {:?} pid {:?}", nid, pid);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn state(&self) -> &str {
        match self.state {
            TunnelState::Off => "OFF",
            TunnelState::Startup => "STARTUP",
            TunnelState::NewConn => "NEWCONN",
            TunnelState::Failed => "FAILED",
        }
    }
}
