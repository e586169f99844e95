//! The lifecycle state machine (§4.8): drives the node through
//! startup/self-find/refresh/active/failed, owns the user-visible lookup
//! map, and reconciles query status into callback events.

use crate::callback::PeerStatus;
use crate::config::Config;
use crate::id::{Endpoint, NodeId};
use crate::node::Node;
use crate::query::{flags as query_flags, QueryState};
use fnv::FnvHashMap;
use log::debug;
use std::time::{Duration, Instant};

/// Routing-table occupancy at or above which FIND_SELF promotes to REFRESH,
/// or the relaxed age+occupancy alternative (§4.8 diagram).
const REFRESH_SPACE_SIZE: usize = 100;
const RELAXED_AGE: Duration = Duration::from_secs(60);
const RELAXED_SPACE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Off,
    Startup,
    FindSelf,
    Refresh,
    Active,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupStatus {
    Ready,
    Querying,
    Failure,
    FoundClosest,
    PeerUnreachable,
    Success,
}

struct ManagerQuery {
    flags: u32,
    status: LookupStatus,
    last_reported_address: Option<Endpoint>,
    /// The status last delivered to a callback, so reconciliation only fires
    /// on change (§8 scenario 6).
    last_notified: Option<LookupStatus>,
}

pub struct Manager {
    state: LifecycleState,
    entered_state_at: Instant,
    lookups: FnvHashMap<NodeId, ManagerQuery>,
}

impl Manager {
    pub fn new() -> Self {
        Manager {
            state: LifecycleState::Off,
            entered_state_at: Instant::now(),
            lookups: FnvHashMap::default(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn enter(&mut self, state: LifecycleState, now: Instant) {
        debug!("manager transition {:?} -> {:?}", self.state, state);
        self.state = state;
        self.entered_state_at = now;
    }

    pub fn start_dht(&mut self, now: Instant) {
        if self.state == LifecycleState::Off {
            self.enter(LifecycleState::Startup, now);
        }
    }

    /// §5, "Cancellation": clears queries, resets lookups to READY, returns
    /// to OFF. Idempotent.
    pub fn stop_dht(&mut self, node: &mut Node, now: Instant) {
        node.clear_queries();
        node.routing_mut().clear();
        for lookup in self.lookups.values_mut() {
            lookup.status = LookupStatus::Ready;
            lookup.last_notified = None;
        }
        self.enter(LifecycleState::Off, now);
    }

    /// §4.8 `addFindNode`: idempotent insert of a READY lookup.
    pub fn add_find_node(&mut self, target: NodeId, flags: u32) {
        self.lookups.entry(target).or_insert(ManagerQuery {
            flags,
            status: LookupStatus::Ready,
            last_reported_address: None,
            last_notified: None,
        });
    }

    /// §4.8 `removeFindNode`.
    pub fn remove_find_node(&mut self, node: &mut Node, target: &NodeId) {
        node.remove_query(target);
        self.lookups.remove(target);
    }

    pub fn last_reported_address(&self, target: &NodeId) -> Option<Endpoint> {
        self.lookups.get(target).and_then(|l| l.last_reported_address)
    }

    /// §4.8 lifecycle diagram, advanced once per second alongside
    /// [`Node::iteration`].
    pub fn tick(&mut self, node: &mut Node, config: &Config, now: Instant) {
        match self.state {
            LifecycleState::Off => {}
            LifecycleState::Startup => {
                if now.duration_since(self.entered_state_at) > config.max_startup_time {
                    self.enter(LifecycleState::FindSelf, now);
                    node.add_query(node.local_id(), query_flags::IDLE | query_flags::DISGUISE, now);
                }
            }
            LifecycleState::FindSelf => {
                if self.space_size_satisfied(node, now) {
                    self.enter(LifecycleState::Refresh, now);
                } else if now.duration_since(self.entered_state_at) > RELAXED_AGE
                    && node.routing().space_size() < RELAXED_SPACE_SIZE
                {
                    self.enter(LifecycleState::Failed, now);
                }
            }
            LifecycleState::Refresh => {
                self.start_queued_lookups(node, now);
                node.peer_store_mut().persist();
                self.enter(LifecycleState::Active, now);
            }
            LifecycleState::Active => {
                if now.duration_since(self.entered_state_at) > config.max_refresh_time {
                    self.enter(LifecycleState::Refresh, now);
                } else if now.duration_since(self.entered_state_at) > RELAXED_AGE
                    && node.routing().space_size() < RELAXED_SPACE_SIZE
                {
                    self.enter(LifecycleState::Failed, now);
                }
            }
            LifecycleState::Failed => {
                self.stop_dht(node, now);
                self.start_dht(now);
            }
        }

        if matches!(self.state, LifecycleState::Refresh | LifecycleState::Active) {
            self.reconcile(node, now);
        }
    }

    fn space_size_satisfied(&self, node: &Node, now: Instant) -> bool {
        let size = node.routing().space_size();
        size >= REFRESH_SPACE_SIZE
            || (size >= RELAXED_SPACE_SIZE && now.duration_since(self.entered_state_at) > RELAXED_AGE)
    }

    fn start_queued_lookups(&mut self, node: &mut Node, now: Instant) {
        for (target, lookup) in self.lookups.iter_mut() {
            if lookup.status == LookupStatus::Ready {
                lookup.status = LookupStatus::Querying;
                node.add_query(*target, lookup.flags | query_flags::DISGUISE, now);
            }
        }
    }

    /// §4.8, "Status reconciliation": snapshot per-query status, map to
    /// callback codes, fire only on change.
    fn reconcile(&mut self, node: &mut Node, now: Instant) {
        let snapshot = node.query_status_snapshot();
        for (target, state, is_idle) in snapshot {
            let lookup = match self.lookups.get_mut(&target) {
                Some(l) => l,
                None => continue,
            };
            let (new_status, callback) = match state {
                QueryState::Querying => (LookupStatus::Querying, None),
                QueryState::Failure => (LookupStatus::Failure, Some(PeerStatus::QueryFailure)),
                QueryState::FoundClosest => (LookupStatus::FoundClosest, Some(PeerStatus::PeerOffline)),
                QueryState::PeerUnreachable => {
                    (LookupStatus::PeerUnreachable, Some(PeerStatus::PeerUnreachable))
                }
                QueryState::Success => (LookupStatus::Success, Some(PeerStatus::PeerOnline)),
            };

            lookup.status = new_status;
            if new_status == LookupStatus::Success {
                lookup.last_reported_address = node.query_result(&target).map(|c| c.endpoint);
            }

            if let Some(code) = callback {
                if lookup.last_notified != Some(new_status) {
                    node.callbacks_mut()
                        .notify_peer(target, code, lookup.last_reported_address);
                    lookup.last_notified = Some(new_status);
                }
                if !is_idle && new_status != LookupStatus::Querying {
                    node.remove_query(&target);
                    self.lookups.remove(&target);
                }
            }
        }
        let _ = now;
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Contact;
    use std::net::Ipv4Addr;

    fn fresh_node() -> Node {
        Node::new(NodeId([1u8; 20]), Config::new())
    }

    #[test]
    fn startup_promotes_to_find_self_after_timeout_scenario_5() {
        let mut manager = Manager::new();
        let mut node = fresh_node();
        let config = Config::new();
        let now = Instant::now();
        manager.start_dht(now);
        assert_eq!(manager.state(), LifecycleState::Startup);

        let later = now + config.max_startup_time + Duration::from_secs(1);
        manager.tick(&mut node, &config, later);
        assert_eq!(manager.state(), LifecycleState::FindSelf);
        assert_eq!(node.query_status_snapshot().len(), 1);
    }

    #[test]
    fn find_self_promotes_to_refresh_once_space_grows_scenario_5() {
        let mut manager = Manager::new();
        let mut node = fresh_node();
        let config = Config::new();
        let mut now = Instant::now();
        manager.start_dht(now);
        now += config.max_startup_time + Duration::from_secs(1);
        manager.tick(&mut node, &config, now);
        assert_eq!(manager.state(), LifecycleState::FindSelf);

        // Scatter contacts across many buckets so none of them collide and
        // get capped by K, growing reported space size past the threshold.
        for i in 0..120u16 {
            let mut bytes = [0u8; 20];
            bytes[0] = (i % 255) as u8 + 1;
            bytes[1] = (i / 255) as u8;
            let contact = Contact::new(
                NodeId(bytes),
                Endpoint::new(Ipv4Addr::new(1, 1, (i / 256) as u8, (i % 256) as u8), 2000 + i),
            );
            node.routing_mut().add_peer(contact, 0);
        }

        manager.tick(&mut node, &config, now);
        assert_eq!(manager.state(), LifecycleState::Refresh);
    }

    #[test]
    fn add_find_node_is_idempotent() {
        let mut manager = Manager::new();
        let target = NodeId([4u8; 20]);
        manager.add_find_node(target, 0);
        manager.add_find_node(target, 0);
        assert_eq!(manager.lookups.len(), 1);
    }
}
