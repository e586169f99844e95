//! The k-bucket routing table (§4.5): 160 buckets indexed by XOR distance
//! from the local node, each an LRU list with priority-weighted eviction.

use crate::id::{Contact, Endpoint, NodeId, ID_BITS};
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Default bucket capacity `K` from the identifier algebra component.
pub const K: usize = 10;

/// How long a bucket's head entry may go unseen before it is considered
/// stale and evictable outright (§3, "Lifecycle").
pub const BUCKET_STALE_PERIOD: Duration = Duration::from_secs(15 * 60);

/// How long an entry may go unprobed before `out_of_date_peer` offers it up
/// for a refresh ping (§4.5).
pub const SEND_REFRESH_PERIOD: Duration = Duration::from_secs(14 * 60);

/// Cumulative bit-OR flags recorded against a [`BucketEntry`] (§3).
pub mod flags {
    pub const RECV_PONG: u32 = 1 << 0;
    pub const RECV_NODES: u32 = 1 << 1;
    pub const DHT_ENGINE: u32 = 1 << 2;
    pub const DHT_APPL: u32 = 1 << 3;
    pub const DHT_VERSION: u32 = 1 << 4;
}

/// An entry resident in a bucket.
#[derive(Clone, Debug)]
pub struct BucketEntry {
    pub contact: Contact,
    pub last_seen: Instant,
    pub last_probed: Option<Instant>,
    pub flags: u32,
}

impl BucketEntry {
    fn new(contact: Contact, flags: u32, now: Instant) -> Self {
        BucketEntry {
            contact,
            last_seen: now,
            last_probed: None,
            flags,
        }
    }

    /// Number of set flag bits: higher flag words rank higher for eviction
    /// (§3, "Higher flag words are ranked higher for eviction").
    fn score(&self) -> u32 {
        self.flags.count_ones()
    }
}

/// An ordered sequence of [`BucketEntry`], head = least-recently-seen, tail
/// = most-recently-seen, capped at [`K`] entries.
#[derive(Default)]
pub struct Bucket {
    entries: SmallVec<[BucketEntry; K]>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= K
    }

    pub fn iter(&self) -> impl Iterator<Item = &BucketEntry> {
        self.entries.iter()
    }

    fn position_of(&self, contact: &Contact) -> Option<usize> {
        self.entries.iter().position(|e| e.contact == *contact)
    }
}

/// Owns the 160 buckets indexed by distance from the local id.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(Bucket::default());
        }
        RoutingTable { local_id, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.local_id.bucket_distance(id)
    }

    /// §4.5 `addPeer`. Returns whether the contact is resident afterwards.
    pub fn add_peer(&mut self, contact: Contact, new_flags: u32) -> bool {
        self.add_peer_at(contact, new_flags, Instant::now())
    }

    fn add_peer_at(&mut self, contact: Contact, new_flags: u32, now: Instant) -> bool {
        if contact.id == self.local_id {
            return false;
        }
        let index = self.bucket_index(&contact.id);
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.position_of(&contact) {
            let mut entry = bucket.entries.remove(pos);
            entry.flags |= new_flags;
            entry.last_seen = now;
            bucket.entries.push(entry);
            return true;
        }

        if !bucket.is_full() {
            bucket.entries.push(BucketEntry::new(contact, new_flags, now));
            return true;
        }

        // Bucket full: evict the stale head, if any.
        if let Some(head) = bucket.entries.first() {
            if now.duration_since(head.last_seen) > BUCKET_STALE_PERIOD {
                bucket.entries.remove(0);
                bucket.entries.push(BucketEntry::new(contact, new_flags, now));
                return true;
            }
        }

        // Otherwise, evict the lowest-scored entry if the newcomer outranks it.
        let incoming_score = BucketEntry::new(contact.clone(), new_flags, now).score();
        if let Some((min_pos, _)) = bucket
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.score())
        {
            let min_score = bucket.entries[min_pos].score();
            if incoming_score > min_score {
                bucket.entries.remove(min_pos);
                bucket.entries.push(BucketEntry::new(contact, new_flags, now));
                return true;
            }
        }

        false
    }

    /// §4.5 `nearestNodes`. O(N) scan sufficient for N ≤ 160·K.
    pub fn nearest_nodes(&self, target: &NodeId, k: usize, exclude: &[NodeId]) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter())
            .map(|e| e.contact)
            .filter(|c| !exclude.contains(&c.id))
            .collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(k);
        all
    }

    /// §4.5 `outOfDatePeer`. Touches `last_probed` so the same entry is
    /// not returned twice before a response lands.
    pub fn out_of_date_peer(&mut self) -> Option<Contact> {
        self.out_of_date_peer_at(Instant::now())
    }

    fn out_of_date_peer_at(&mut self, now: Instant) -> Option<Contact> {
        for bucket in self.buckets.iter_mut() {
            for entry in bucket.entries.iter_mut() {
                let overdue = match entry.last_probed {
                    None => now.duration_since(entry.last_seen) > SEND_REFRESH_PERIOD,
                    Some(t) => now.duration_since(t) > SEND_REFRESH_PERIOD,
                };
                if overdue {
                    entry.last_probed = Some(now);
                    return Some(entry.contact);
                }
            }
        }
        None
    }

    /// §4.5 `calcSpaceSize`.
    pub fn space_size(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// §4.5 `calcNetworkSize`: for each non-empty, non-full bucket `i`,
    /// observed entries occupy `1 / 2^(ID_BITS - i)` of the id space;
    /// extrapolate and average.
    pub fn calc_network_size(&self) -> f64 {
        self.calc_network_size_with(|_| true)
    }

    pub fn calc_network_size_with_flag(&self, mask: u32) -> f64 {
        self.calc_network_size_with(|e| e.flags & mask == mask)
    }

    fn calc_network_size_with(&self, predicate: impl Fn(&BucketEntry) -> bool) -> f64 {
        let mut estimates = Vec::new();
        for (i, bucket) in self.buckets.iter().enumerate() {
            let observed = bucket.entries.iter().filter(|e| predicate(e)).count();
            if observed == 0 || bucket.is_full() {
                continue;
            }
            let fraction_of_space = 2f64.powi((ID_BITS - i) as i32);
            estimates.push(observed as f64 * fraction_of_space);
        }
        if estimates.is_empty() {
            return 0.0;
        }
        estimates.iter().sum::<f64>() / estimates.len() as f64
    }

    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.entries.clear();
        }
    }

    pub fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    pub fn contains(&self, contact: &Contact) -> bool {
        let idx = self.bucket_index(&contact.id);
        self.buckets[idx].position_of(contact).is_some()
    }
}
