//! The per-tick scheduler (§4.7): decodes inbound datagrams, updates routing
//! state, answers remote queries, advances active lookups, and rate-limits
//! outbound traffic. Exposed as a plain synchronous `iteration()` the
//! transport adapter calls once a second, plus a `recv_pkt` the transport
//! calls per datagram.

use crate::callback::CallbackRegistry;
use crate::config::Config;
use crate::error::DhtError;
use crate::id::{Contact, Endpoint, NodeId};
use crate::message::{Message, Token, TransactionId};
use crate::peerstore::PeerStore;
use crate::query::{flags as query_flags, Query, QueryState};
use crate::routing::{flags as bucket_flags, RoutingTable};
use crate::stats::Stats;
use fnv::FnvHashMap;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum datagram size accepted or emitted (§6, "Wire format").
pub const MAX_DATAGRAM_LEN: usize = 10 * 1024;
/// RemoteQuery entries older than this are dropped unanswered (§3).
const REMOTE_QUERY_MAX_AGE: Duration = Duration::from_secs(10);
/// Bound on the inbound/outbound FIFOs and the potential-peer ping backlog;
/// unspecified numerically by the source, chosen generously above the
/// highest configured rate class.
const MAX_QUEUE_LEN: usize = 2048;

/// What kind of remote query is outstanding (§3, "RemoteQuery").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteQueryKind {
    Neighbours,
    Hash,
}

struct RemoteQuery {
    requester: Contact,
    target_or_info_hash: NodeId,
    transaction_id: TransactionId,
    kind: RemoteQueryKind,
    received_at: Instant,
}

/// What we expect back for a transaction id we sent, keyed together with the
/// sender endpoint so a reply is only accepted from the same peer we asked
/// (§9, "Transaction-id matching... resolved").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRequestKind {
    Ping,
    FindNode { query_target: NodeId },
    PostHash,
}

pub struct Node {
    local_id: NodeId,
    config: Config,
    routing: RoutingTable,
    peer_store: PeerStore,
    queries: Vec<Query>,
    remote_queries: VecDeque<RemoteQuery>,
    potential_peers: VecDeque<Contact>,
    pending: FnvHashMap<(TransactionId, Endpoint), (PendingRequestKind, Instant)>,
    inbound: VecDeque<(Vec<u8>, Endpoint)>,
    outbound: VecDeque<(Vec<u8>, Endpoint)>,
    callbacks: CallbackRegistry,
    stats: Stats,
    txn_counter: u16,
}

impl Node {
    pub fn new(local_id: NodeId, config: Config) -> Self {
        let peer_store_capacity = config.peer_store_capacity;
        Node {
            local_id,
            config,
            routing: RoutingTable::new(local_id),
            peer_store: PeerStore::new(peer_store_capacity),
            queries: Vec::new(),
            remote_queries: VecDeque::new(),
            potential_peers: VecDeque::new(),
            pending: FnvHashMap::default(),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            callbacks: CallbackRegistry::new(),
            stats: Stats::new(),
            txn_counter: 0,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn routing_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing
    }

    pub fn peer_store_mut(&mut self) -> &mut PeerStore {
        &mut self.peer_store
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackRegistry {
        &mut self.callbacks
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        let t = self.txn_counter % 100;
        self.txn_counter = self.txn_counter.wrapping_add(1);
        TransactionId(format!("{:02}", t).into_bytes())
    }

    fn enqueue_outbound(&mut self, bytes: Vec<u8>, to: Endpoint) {
        if self.outbound.len() >= MAX_QUEUE_LEN {
            self.outbound.pop_front();
            self.stats.record_drop("outbound_queue_full");
        }
        self.outbound.push_back((bytes, to));
        self.stats.record_sent();
    }

    /// Hands the transport adapter a datagram it received. The inbound FIFO
    /// decouples the socket reader from the worker tick (§5, "Suspension
    /// points").
    pub fn push_inbound(&mut self, bytes: Vec<u8>, from: Endpoint) {
        if bytes.len() > MAX_DATAGRAM_LEN {
            self.stats.record_drop("datagram_too_large");
            return;
        }
        if self.inbound.len() >= MAX_QUEUE_LEN {
            self.inbound.pop_front();
            self.stats.record_drop("inbound_queue_full");
        }
        self.inbound.push_back((bytes, from));
        self.stats.record_received();
    }

    /// Drains datagrams the transport adapter should now send.
    pub fn drain_outbound(&mut self) -> Vec<(Vec<u8>, Endpoint)> {
        self.outbound.drain(..).collect()
    }

    /// Processes every datagram currently queued in the inbound FIFO.
    pub fn drain_inbound(&mut self, now: Instant) {
        while let Some((bytes, from)) = self.inbound.pop_front() {
            if let Err(e) = self.recv_pkt(&bytes, from, now) {
                trace!("dropping datagram from {}: {}", from, e);
                self.stats.record_drop("decode_error");
            }
        }
    }

    /// §4.7 `recvPkt`. Returns `Ok(true)` if the message was one this
    /// component owns and claimed; `Ok(false)` if it belongs to another
    /// registered receiver on the shared socket (the tunnel subsystem's
    /// NEWCONN family, §5 "Shared resource policy").
    pub fn recv_pkt(&mut self, bytes: &[u8], from: Endpoint, now: Instant) -> Result<bool, DhtError> {
        let msg = Message::decode(bytes)?;
        let contact = Contact::new(msg.sender_id(), from);

        match msg {
            Message::Ping { t, .. } => {
                self.admit_peer(contact, 0);
                self.reply_pong(t, from);
                Ok(true)
            }
            Message::Pong { t, v, .. } => {
                self.handle_pong_or_reply_post(t, from, v, contact, now);
                Ok(true)
            }
            Message::FindNode { t, target, .. } => {
                self.admit_peer(contact, 0);
                self.push_remote_query(contact, target, t, RemoteQueryKind::Neighbours, now);
                Ok(true)
            }
            Message::ReplyNode { t, nodes, .. } => {
                self.handle_reply_node(t, from, contact, nodes, now);
                Ok(true)
            }
            Message::GetHash { t, info_hash, .. } => {
                self.admit_peer(contact, 0);
                self.push_remote_query(contact, info_hash, t, RemoteQueryKind::Hash, now);
                Ok(true)
            }
            Message::ReplyHash { t, .. } | Message::ReplyNear { t, .. } => {
                debug!("unsolicited hash reply, transaction {:?}", t);
                Ok(true)
            }
            Message::PostHash { t, .. } => {
                // Values are never persisted (Non-goal); just acknowledge.
                self.admit_peer(contact, 0);
                self.reply_post(t, from);
                Ok(true)
            }
            Message::NewConn { .. }
            | Message::ReplyNewConn { .. }
            | Message::BroadcastConn { .. }
            | Message::AskConn { .. }
            | Message::ReplyConn { .. } => Ok(false),
        }
    }

    fn handle_pong_or_reply_post(
        &mut self,
        t: TransactionId,
        from: Endpoint,
        v: Option<Vec<u8>>,
        contact: Contact,
        now: Instant,
    ) {
        let kind = self.pending.remove(&(t.clone(), from)).map(|(k, _)| k);
        match kind {
            Some(PendingRequestKind::Ping) => {
                let mut flags = bucket_flags::RECV_PONG;
                if let Some(v) = &v {
                    if v.starts_with(self.config.dht_version.as_bytes()) {
                        flags |= bucket_flags::DHT_ENGINE | bucket_flags::DHT_APPL | bucket_flags::DHT_VERSION;
                    }
                }
                self.admit_peer(contact, flags);
                self.peer_store.add(from);
            }
            Some(PendingRequestKind::PostHash) => {
                trace!("announce acknowledged by {}", from);
            }
            Some(PendingRequestKind::FindNode { .. }) | None => {
                debug!("reply with no matching pending request from {}: t={:?}", from, t);
            }
        }
        let _ = now;
    }

    fn handle_reply_node(
        &mut self,
        t: TransactionId,
        from: Endpoint,
        contact: Contact,
        nodes: Vec<Contact>,
        now: Instant,
    ) {
        let kind = self.pending.remove(&(t.clone(), from)).map(|(k, _)| k);
        let query_target = match kind {
            Some(PendingRequestKind::FindNode { query_target }) => query_target,
            _ => {
                debug!("REPLY_NODE with no matching FIND_NODE pending, t={:?}", t);
                return;
            }
        };
        self.admit_peer(contact, bucket_flags::RECV_NODES);

        if let Some(query) = self.queries.iter_mut().find(|q| q.target == query_target) {
            query.add_peer(contact, now);
        }
        for query in self.queries.iter_mut() {
            for &node in &nodes {
                if node.id == self.local_id {
                    continue;
                }
                if query.add_potential_peer(node, now) {
                    self.potential_peers.push_back(node);
                }
            }
        }
    }

    fn push_remote_query(
        &mut self,
        requester: Contact,
        target_or_info_hash: NodeId,
        transaction_id: TransactionId,
        kind: RemoteQueryKind,
        now: Instant,
    ) {
        if self.remote_queries.len() >= MAX_QUEUE_LEN {
            self.remote_queries.pop_front();
            self.stats.record_drop("remote_query_queue_full");
        }
        self.remote_queries.push_back(RemoteQuery {
            requester,
            target_or_info_hash,
            transaction_id,
            kind,
            received_at: now,
        });
    }

    /// §4.7, "Remote-query processing": at most one per tick.
    fn process_one_remote_query(&mut self, now: Instant) {
        let rq = match self.remote_queries.pop_front() {
            Some(rq) => rq,
            None => return,
        };
        if now.duration_since(rq.received_at) > REMOTE_QUERY_MAX_AGE {
            self.stats.record_drop("remote_query_expired");
            return;
        }
        match rq.kind {
            RemoteQueryKind::Neighbours => {
                let nearest = self.routing.nearest_nodes(&rq.target_or_info_hash, 8, &[]);
                self.reply_node(rq.transaction_id, rq.requester.endpoint, nearest);
            }
            RemoteQueryKind::Hash => {
                // Stored values are never kept (Non-goal); always answer
                // with the nearest-neighbour shape (§9, resolved).
                let nearest = self.routing.nearest_nodes(&rq.target_or_info_hash, 8, &[]);
                let token = Token(self.random_token());
                self.reply_near(rq.transaction_id, rq.requester.endpoint, token, nearest);
            }
        }
    }

    /// Admits `contact` into the routing table and, if it becomes resident
    /// (new or refreshed), fires `onNode` (§6: "every peer the routing
    /// table learns about").
    fn admit_peer(&mut self, contact: Contact, flags: u32) -> bool {
        let admitted = self.routing.add_peer(contact, flags);
        if admitted {
            self.callbacks.notify_node(contact, flags);
        }
        admitted
    }

    fn random_token(&self) -> Vec<u8> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        format!("{:04}{:04}", rng.gen_range(0, 10000), rng.gen_range(0, 10000)).into_bytes()
    }

    fn send(&mut self, msg: Message, to: Endpoint) {
        match msg.encode(MAX_DATAGRAM_LEN) {
            Ok(bytes) => self.enqueue_outbound(bytes, to),
            Err(e) => warn!("failed to encode outgoing message to {}: {}", to, e),
        }
    }

    pub fn send_ping(&mut self, to: Endpoint) {
        let t = self.next_transaction_id();
        self.pending.insert((t.clone(), to), (PendingRequestKind::Ping, Instant::now()));
        self.send(Message::Ping { t, id: self.local_id }, to);
    }

    fn reply_pong(&mut self, t: TransactionId, to: Endpoint) {
        self.send(
            Message::Pong {
                t,
                id: self.local_id,
                v: Some(self.config.dht_version.clone().into_bytes()),
            },
            to,
        );
    }

    fn send_find_node(&mut self, to: Endpoint, advertised_target: NodeId, query_target: NodeId) {
        let t = self.next_transaction_id();
        self.pending
            .insert((t.clone(), to), (PendingRequestKind::FindNode { query_target }, Instant::now()));
        self.send(
            Message::FindNode {
                t,
                id: self.local_id,
                target: advertised_target,
            },
            to,
        );
    }

    fn reply_node(&mut self, t: TransactionId, to: Endpoint, nodes: Vec<Contact>) {
        self.send(
            Message::ReplyNode {
                t,
                id: self.local_id,
                nodes,
            },
            to,
        );
    }

    fn reply_near(&mut self, t: TransactionId, to: Endpoint, token: Token, nodes: Vec<Contact>) {
        self.send(
            Message::ReplyNear {
                t,
                id: self.local_id,
                token,
                nodes,
            },
            to,
        );
    }

    fn reply_post(&mut self, t: TransactionId, to: Endpoint) {
        self.send(Message::ReplyPost { t, id: self.local_id }, to);
    }

    /// §4.6: seeds from the local routing table and registers a new active
    /// query. Idempotent per the manager's lookup map, but the node itself
    /// does not deduplicate by target -- that is the manager's contract
    /// (§4.8, `addFindNode`).
    pub fn add_query(&mut self, target: NodeId, flags: u32, now: Instant) {
        let seeds = self.routing.nearest_nodes(&target, crate::routing::K, &[self.local_id]);
        self.queries.push(Query::new(target, seeds, flags, now));
    }

    pub fn remove_query(&mut self, target: &NodeId) {
        self.queries.retain(|q| q.target != *target);
    }

    pub fn clear_queries(&mut self) {
        self.queries.clear();
    }

    /// Read-only snapshot the manager reconciles against its lookup map
    /// (§4.8, "Status reconciliation").
    pub fn query_status_snapshot(&self) -> Vec<(NodeId, QueryState, bool)> {
        self.queries
            .iter()
            .map(|q| (q.target, q.state, q.is_idle()))
            .collect()
    }

    pub fn query_result(&self, target: &NodeId) -> Option<Contact> {
        self.queries
            .iter()
            .find(|q| q.target == *target)
            .and_then(|q| q.match_result().into_iter().next())
    }

    fn expire_pending(&mut self, now: Instant) {
        let window = self.config.expected_reply_window;
        let expired: Vec<(TransactionId, Endpoint)> = self
            .pending
            .iter()
            .filter(|(_, (_, sent_at))| now.duration_since(*sent_at) > window)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.pending.remove(&key);
            self.stats.record_drop("request_timeout");
        }
    }

    /// §4.7, "Outbound budget" + §2 control flow's per-second maintenance.
    /// Returns the number of datagrams enqueued this tick.
    pub fn iteration(&mut self, now: Instant) -> usize {
        self.stats.active_queries = self.queries.len();
        self.stats.routing_table_occupancy = self.routing.space_size();
        self.expire_pending(now);

        let budget = self.config.rate_class.max_msgs();
        let ping_budget = (budget * 9) / 10;
        let mut sent = 0usize;

        while sent < ping_budget {
            match self.potential_peers.pop_front() {
                Some(contact) => {
                    self.send_ping(contact.endpoint);
                    sent += 1;
                }
                None => break,
            }
        }

        if sent < budget {
            if let Some(contact) = self.routing.out_of_date_peer() {
                self.send_ping(contact.endpoint);
                sent += 1;
            }
        }

        let query_targets: Vec<NodeId> = self.queries.iter().map(|q| q.target).collect();
        let n = query_targets.len();
        if n > 0 {
            let mut misses = 0usize;
            let mut i = 0usize;
            while sent < budget && misses < n {
                let target = query_targets[i % n];
                let next = self
                    .queries
                    .iter_mut()
                    .find(|q| q.target == target)
                    .and_then(|q| q.next_query(now));
                match next {
                    Some((contact, advertised)) => {
                        self.send_find_node(contact.endpoint, advertised, target);
                        sent += 1;
                        misses = 0;
                    }
                    None => misses += 1,
                }
                i += 1;
            }
        }

        self.process_one_remote_query(now);
        sent
    }
}
