//! The callback contract (§6): three entry points a host application
//! implements to learn about routing-table churn and lookup status
//! changes. Specified only by its contract -- the registry here is a thin
//! `Vec<Box<dyn Callbacks>>`, not a full pub/sub bus.

use crate::id::{Contact, Endpoint, NodeId};

/// Status codes the manager surfaces to the application (§4.8, §7
/// "Propagation policy": "The manager surfaces only four codes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    QueryFailure,
    PeerOffline,
    PeerUnreachable,
    PeerOnline,
}

/// The application-supplied sink. A callback implementation must not block
/// the worker (§5, "Cancellation"): callbacks are invoked synchronously
/// from within the node's tick while holding its state.
pub trait Callbacks: Send {
    /// Every peer the routing table learns about.
    fn on_node(&mut self, contact: Contact, flags: u32) {
        let _ = (contact, flags);
    }

    /// A manager lookup's status changed.
    fn on_peer(&mut self, target: NodeId, status: PeerStatus, endpoint: Option<Endpoint>) {
        let _ = (target, status, endpoint);
    }

    /// Reserved, currently unused (§6).
    fn on_value(&mut self, target: NodeId, key: NodeId, status: PeerStatus) {
        let _ = (target, key, status);
    }
}

/// Ordered collection of subscribers. `Node` owns the registry; the
/// manager reaches it through `Node::callbacks_mut` when reconciling lookup
/// status, so there is exactly one sink per node/manager pair. The tunnel
/// subsystem keeps its own instance, since it is a peer component with its
/// own contract, not a layer above the node core.
#[derive(Default)]
pub struct CallbackRegistry {
    subscribers: Vec<Box<dyn Callbacks>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback: Box<dyn Callbacks>) {
        self.subscribers.push(callback);
    }

    pub fn notify_node(&mut self, contact: Contact, flags: u32) {
        for sub in self.subscribers.iter_mut() {
            sub.on_node(contact, flags);
        }
    }

    pub fn notify_peer(&mut self, target: NodeId, status: PeerStatus, endpoint: Option<Endpoint>) {
        for sub in self.subscribers.iter_mut() {
            sub.on_peer(target, status, endpoint);
        }
    }
}
