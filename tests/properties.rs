//! Property-based tests for the invariants listed in §8, driven by
//! `quickcheck` for randomized structural checks rather than encode/decode
//! grids.

use bitdht::id::{Contact, Endpoint, NodeId};
use bitdht::query::Query;
use bitdht::routing::{RoutingTable, K};
use quickcheck::quickcheck;
use std::net::Ipv4Addr;
use std::time::Instant;

fn id_from_seed(seed: u64) -> NodeId {
    let src = seed.to_le_bytes();
    let mut bytes = [0u8; 20];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = src[i % 8] ^ (i as u8);
    }
    NodeId(bytes)
}

fn contact_from_seed(seed: u64) -> Contact {
    let id = id_from_seed(seed);
    let port = (seed % 60000) as u16 + 1;
    Contact::new(id, Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), port))
}

quickcheck! {
    /// Every resident entry's bucket distance to the local id matches the
    /// index of the bucket that holds it.
    fn bucket_distance_matches_index(seeds: Vec<u64>) -> bool {
        let local = NodeId::zero();
        let mut table = RoutingTable::new(local);
        for s in seeds {
            table.add_peer(contact_from_seed(s), 0);
        }
        (0..bitdht::id::ID_BITS).all(|i| {
            table.bucket(i).iter().all(|e| local.bucket_distance(&e.contact.id) == i)
        })
    }

    /// No contact is ever resident in more than one bucket.
    fn no_duplicate_contact_across_buckets(seeds: Vec<u64>) -> bool {
        let local = NodeId::zero();
        let mut table = RoutingTable::new(local);
        let contacts: Vec<Contact> = seeds.into_iter().map(contact_from_seed).collect();
        for c in &contacts {
            table.add_peer(*c, 0);
        }
        contacts.iter().all(|c| {
            let occurrences: usize = (0..bitdht::id::ID_BITS)
                .map(|i| table.bucket(i).iter().filter(|e| e.contact == *c).count())
                .sum();
            occurrences <= 1
        })
    }

    /// Re-adding the same contact with new flags never grows the bucket and
    /// always leaves the flags OR'd together.
    fn add_peer_repeated_ors_flags_without_growth(seed: u64, flags_a: u32, flags_b: u32) -> bool {
        let local = NodeId::zero();
        let mut table = RoutingTable::new(local);
        let c = contact_from_seed(seed);
        table.add_peer(c, flags_a);
        let before = table.space_size();
        table.add_peer(c, flags_b);
        let after = table.space_size();
        let idx = local.bucket_distance(&c.id);
        let entry = table.bucket(idx).iter().find(|e| e.contact == c).unwrap();
        before == after && entry.flags == flags_a | flags_b
    }

    /// `nearestNodes(target, k)` is always a prefix of the full
    /// distance-sorted contact list.
    fn nearest_nodes_is_prefix_of_sorted(seeds: Vec<u64>, target_seed: u64, k: u8) -> bool {
        let local = NodeId::zero();
        let mut table = RoutingTable::new(local);
        for s in &seeds {
            table.add_peer(contact_from_seed(*s), 0);
        }
        let target = id_from_seed(target_seed);
        let k = k as usize;

        let mut all: Vec<Contact> = (0..bitdht::id::ID_BITS)
            .flat_map(|i| table.bucket(i).iter().map(|e| e.contact).collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|c| c.id.distance(&target));

        let nearest = table.nearest_nodes(&target, k, &[]);
        nearest == all.into_iter().take(k).collect::<Vec<_>>()
    }

    /// `randomMidpoint(a, b)` never diverges from `a` further than `b` does.
    fn random_midpoint_never_diverges_further(seed_a: u64, seed_b: u64) -> bool {
        let a = id_from_seed(seed_a);
        let b = id_from_seed(seed_b);
        let mid = a.random_midpoint(&b);
        let ab = a.distance(&b).bucket_index_or_zero();
        let amid = a.distance(&mid).bucket_index_or_zero();
        amid <= ab
    }

    /// A query's `closest` bag never exceeds `K - 1` entries and stays
    /// ordered by XOR distance to the target, across an arbitrary sequence
    /// of `addPeer` calls.
    fn query_closest_stays_bounded_and_ordered(target_seed: u64, peer_seeds: Vec<u64>) -> bool {
        let target = id_from_seed(target_seed);
        let mut q = Query::new(target, vec![], 0, Instant::now());
        let now = Instant::now();
        for s in peer_seeds {
            q.add_peer(contact_from_seed(s), now);
        }
        let contacts: Vec<Contact> = q.closest_contacts().copied().collect();
        if contacts.len() > K - 1 {
            return false;
        }
        contacts.windows(2).all(|w| w[0].id.distance(&target) <= w[1].id.distance(&target))
    }
}
