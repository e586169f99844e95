//! The per-target iterative lookup state machine (§4.6): a
//! `BTreeMap<Metric, QueryPeer>` ordered by XOR distance to the target,
//! advanced one peer at a time by `next_query`.

use crate::id::{Contact, Metric, NodeId};
use crate::routing::K;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A query is under-age until this elapses, even if `closest` looks done
/// (§4.6, `nextQuery` step 4).
pub const MIN_QUERY_AGE: Duration = Duration::from_secs(5);
/// A query with an empty `closest` bag after this long fails outright.
pub const MAX_QUERY_AGE: Duration = Duration::from_secs(90);
/// How long a sent request may go unanswered before the peer is treated as
/// unresponsive (§4.6, `addPeer`; §7, "Query timeout").
pub const EXPECTED_REPLY_WINDOW: Duration = Duration::from_secs(8);
/// Starting idle-retry backoff (§4.6, `nextQuery` step 2).
pub const IDLE_RETRY_PERIOD_START: Duration = Duration::from_secs(300);

/// Bit flags carried by a [`Query`] (§3).
pub mod flags {
    /// Advertise a disguised (randomized midpoint) target instead of the
    /// real one (§4.1, §4.6 step 3).
    pub const DISGUISE: u32 = 1 << 0;
    /// Never retire on success/failure; keep re-polling at a backing-off
    /// interval (§3, "IDLE query"; §4.8 reconciliation table).
    pub const IDLE: u32 = 1 << 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Querying,
    FoundClosest,
    Success,
    PeerUnreachable,
    Failure,
}

/// A peer tracked within a query's `closest` or `potentialClosest` bag.
#[derive(Debug, Clone, Copy)]
pub struct QueryPeer {
    pub contact: Contact,
    pub last_send: Option<Instant>,
    pub last_recv: Option<Instant>,
    pub found_at: Instant,
}

impl QueryPeer {
    fn new(contact: Contact, now: Instant) -> Self {
        QueryPeer {
            contact,
            last_send: None,
            last_recv: None,
            found_at: now,
        }
    }

    fn has_replied(&self) -> bool {
        match (self.last_send, self.last_recv) {
            (Some(send), Some(recv)) => recv >= send,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

pub struct Query {
    pub target: NodeId,
    pub flags: u32,
    pub state: QueryState,
    pub created_at: Instant,
    pub search_duration_on_finish: Option<Duration>,
    closest: BTreeMap<Metric, QueryPeer>,
    potential_closest: BTreeMap<Metric, QueryPeer>,
}

impl Query {
    /// Seeds a new query from the local routing table's `nearestNodes`
    /// result (§4.6).
    pub fn new(target: NodeId, starting_set: Vec<Contact>, flags: u32, now: Instant) -> Self {
        // §3 invariant: `closest` is capped at K-1 entries by construction.
        let mut closest = BTreeMap::new();
        for contact in starting_set.into_iter().take(K - 1) {
            let metric = contact.id.distance(&target);
            closest.insert(metric, QueryPeer::new(contact, now));
        }
        Query {
            target,
            flags,
            state: QueryState::Querying,
            created_at: now,
            search_duration_on_finish: None,
            closest,
            potential_closest: BTreeMap::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.flags & flags::IDLE != 0
    }

    pub fn is_disguise(&self) -> bool {
        self.flags & flags::DISGUISE != 0
    }

    pub fn closest_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.closest.values().map(|p| &p.contact)
    }

    /// Backoff period for IDLE re-polls: starts at
    /// [`IDLE_RETRY_PERIOD_START`] and grows as `(now - created_at) / 2`
    /// (§4.6 step 2).
    fn idle_retry_period(&self, now: Instant) -> Duration {
        let age = now.duration_since(self.created_at);
        IDLE_RETRY_PERIOD_START.max(age / 2)
    }

    /// §4.6 `nextQuery`.
    pub fn next_query(&mut self, now: Instant) -> Option<(Contact, NodeId)> {
        if self.state != QueryState::Querying && !self.is_idle() {
            return None;
        }

        let retry_period = self.idle_retry_period(now);
        let idle = self.is_idle();
        let candidate = self.closest.iter_mut().find(|(_, peer)| match peer.last_send {
            None => true,
            Some(sent) => idle && sent + retry_period < now,
        });

        if let Some((_, peer)) = candidate {
            peer.last_send = Some(now);
            let contact = peer.contact;
            let advertised = if self.is_disguise() {
                self.target.random_midpoint(&contact.id)
            } else {
                self.target
            };
            return Some((contact, advertised));
        }

        self.evaluate_termination(now);
        None
    }

    /// Only reached once `next_query` has scanned `closest` and found no
    /// untried (or, for IDLE queries, due-for-retry) candidate -- so
    /// "closest is full" in the sense of §4.6 step 4 coincides with "there
    /// is nothing left to ask", independent of how many entries it actually
    /// holds.
    fn evaluate_termination(&mut self, now: Instant) {
        if self.state != QueryState::Querying {
            return;
        }
        let age = now.duration_since(self.created_at);
        if age < MIN_QUERY_AGE {
            return;
        }

        if self.closest.is_empty() {
            if age > MAX_QUERY_AGE {
                self.finish(QueryState::Failure, now);
            }
            return;
        }

        if !self.closest.values().all(|p| p.has_replied()) {
            return;
        }

        let exact_in_closest = self.closest.keys().any(|m| m.is_zero());
        let exact_in_potential_first = self
            .potential_closest
            .keys()
            .next()
            .map(|m| m.is_zero())
            .unwrap_or(false);

        if exact_in_closest {
            self.finish(QueryState::Success, now);
        } else if exact_in_potential_first {
            self.finish(QueryState::PeerUnreachable, now);
        } else {
            self.finish(QueryState::FoundClosest, now);
        }
    }

    fn finish(&mut self, state: QueryState, now: Instant) {
        self.state = state;
        self.search_duration_on_finish = Some(now.duration_since(self.created_at));
    }

    /// §4.6 `addPeer`: called on a REPLY_NODE reporting `contact` as one of
    /// the nodes it itself knows. Drops stale, unresponsive entries first
    /// to keep the expected-reply window advancing.
    pub fn add_peer(&mut self, contact: Contact, now: Instant) {
        self.expire_unresponsive(now);
        let metric = contact.id.distance(&self.target);
        let peer = self
            .closest
            .entry(metric)
            .or_insert_with(|| QueryPeer::new(contact, now));
        peer.last_recv = Some(now);

        while self.closest.len() > K - 1 {
            let worst_key = *self.closest.keys().next_back().unwrap();
            self.closest.remove(&worst_key);
        }
    }

    fn expire_unresponsive(&mut self, now: Instant) {
        let expired: Vec<Metric> = self
            .closest
            .iter()
            .filter(|(_, p)| match p.last_send {
                Some(sent) => {
                    now.duration_since(sent) > EXPECTED_REPLY_WINDOW
                        && p.last_recv.map_or(true, |recv| recv < sent)
                }
                None => false,
            })
            .map(|(m, _)| *m)
            .collect();
        for m in expired {
            self.closest.remove(&m);
        }
    }

    /// §4.6 `addPotentialPeer`. Returns whether the caller should also
    /// ping the peer (true when freshly admitted).
    pub fn add_potential_peer(&mut self, contact: Contact, now: Instant) -> bool {
        let metric = contact.id.distance(&self.target);
        if self.closest.contains_key(&metric) {
            return false;
        }
        if self.potential_closest.len() < K {
            self.potential_closest
                .entry(metric)
                .or_insert_with(|| QueryPeer::new(contact, now));
            return true;
        }
        let worst_key = *self.potential_closest.keys().next_back().unwrap();
        if metric < worst_key {
            self.potential_closest.remove(&worst_key);
            self.potential_closest.insert(metric, QueryPeer::new(contact, now));
            return true;
        }
        false
    }

    /// §4.6 `result`: contacts in `closest`, up to `limit` (0 = exact match
    /// only).
    pub fn result(&self, limit: usize) -> Vec<Contact> {
        if limit == 0 {
            return self.match_result();
        }
        self.closest.values().take(limit).map(|p| p.contact).collect()
    }

    /// §4.6 `matchResult`: the subset of both bags whose id equals the
    /// exact target.
    pub fn match_result(&self) -> Vec<Contact> {
        self.closest
            .values()
            .chain(self.potential_closest.values())
            .filter(|p| p.contact.id == self.target)
            .map(|p| p.contact)
            .collect()
    }

    pub fn on_failure(&mut self, node_id: &NodeId, now: Instant) {
        let metric = node_id.distance(&self.target);
        self.closest.remove(&metric);
        self.expire_unresponsive(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Endpoint;
    use std::net::Ipv4Addr;

    fn contact(byte: u8, port: u16) -> Contact {
        Contact::new(NodeId([byte; 20]), Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), port))
    }

    #[test]
    fn closest_is_capped_and_ordered_by_distance() {
        let target = NodeId([0u8; 20]);
        let start: Vec<Contact> = (1..30u8).map(|i| contact(i, i as u16)).collect();
        let now = Instant::now();
        let q = Query::new(target, start, 0, now);
        assert!(q.closest_contacts().count() <= K);

        let mut last: Option<Metric> = None;
        for c in q.closest_contacts() {
            let m = c.id.distance(&target);
            if let Some(prev) = last {
                assert!(prev <= m);
            }
            last = Some(m);
        }
    }

    #[test]
    fn query_terminates_found_closest_when_no_closer_peers_scenario_3() {
        let target = NodeId([0xffu8; 20]);
        let seeds = vec![contact(1, 1), contact(2, 2), contact(3, 3)];
        let mut now = Instant::now();
        let mut q = Query::new(target, seeds.clone(), 0, now);

        // Three rounds of send+receive with each contact replying with
        // no peers closer than itself (an empty NODES list).
        for _ in 0..3 {
            now += MIN_QUERY_AGE + Duration::from_secs(1);
            while let Some((contact, _)) = q.next_query(now) {
                q.add_peer(contact, now);
            }
        }

        now += MIN_QUERY_AGE + Duration::from_secs(1);
        let next = q.next_query(now);
        assert!(next.is_none());
        assert_eq!(q.state, QueryState::FoundClosest);
    }

    #[test]
    fn disguise_advertises_within_half_space_scenario_4() {
        let target = NodeId::random();
        let peer = contact(7, 7);

        for i in 0..1000 {
            let now = Instant::now() + Duration::from_secs(i as u64 * (IDLE_RETRY_PERIOD_START.as_secs() + 1));
            let mut q = Query::new(target, vec![peer], flags::DISGUISE, now);
            let (returned_contact, advertised) = q.next_query(now).expect("first call must return the seed peer");
            assert_eq!(returned_contact, peer);
            let tp = target.distance(&peer.id).bucket_index_or_zero();
            let ta = target.distance(&advertised).bucket_index_or_zero();
            assert!(ta <= tp);
        }
    }

    #[test]
    fn add_peer_then_add_peer_is_idempotent_on_membership() {
        let target = NodeId([0u8; 20]);
        let mut q = Query::new(target, vec![], 0, Instant::now());
        let c = contact(9, 9);
        let now = Instant::now();
        q.add_peer(c, now);
        q.add_peer(c, now);
        assert_eq!(q.closest_contacts().count(), 1);
    }

    #[test]
    fn match_result_finds_exact_target() {
        let target = NodeId([5u8; 20]);
        let mut q = Query::new(target, vec![], 0, Instant::now());
        let exact = Contact::new(target, Endpoint::new(Ipv4Addr::new(9, 9, 9, 9), 1));
        q.add_peer(exact, Instant::now());
        let matched = q.match_result();
        assert_eq!(matched, vec![exact]);
    }
}
