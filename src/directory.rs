//! Two-tier catalog of known peer addresses, bucketed deterministically.
//!
//! Distinct from the pool's live-peer map: the directory tracks addresses
//! *heard about* (new) or *previously connected* (tried), consulted by
//! discovery and updated as peers graduate from one tier to the other.

use crate::peer_info::{PeerId, PeerInfo};
use rand::seq::IteratorRandom;
use std::collections::HashMap;

/// Which tier of the directory an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Heard about, not yet vouched by a successful connection.
    New,
    /// Previously connected at least once.
    Tried,
}

/// Deterministic bucket index for `ip_address`, salted with `secret` so an
/// attacker who doesn't know the secret can't predict bucket placement.
///
/// The source this directory generalizes from stubs this function to
/// return a random value (see DESIGN.md); here it's made genuinely
/// deterministic, matching the documented intent.
pub fn bucket(ip_address: &str, secret: u64, bucket_count: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    secret.hash(&mut hasher);
    ip_address.hash(&mut hasher);
    (hasher.finish() as usize) % bucket_count.max(1)
}

struct Bucket {
    entries: HashMap<PeerId, PeerInfo>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

/// Bucketed peer-address catalog for one tier (new or tried).
pub struct PeerDirectory {
    secret: u64,
    bucket_count: usize,
    bucket_size: usize,
    new_buckets: Vec<Bucket>,
    tried_buckets: Vec<Bucket>,
}

impl PeerDirectory {
    pub fn new(secret: u64, bucket_count: usize, bucket_size: usize) -> Self {
        Self {
            secret,
            bucket_count,
            bucket_size,
            new_buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            tried_buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
        }
    }

    fn buckets_mut(&mut self, tier: Tier) -> &mut Vec<Bucket> {
        match tier {
            Tier::New => &mut self.new_buckets,
            Tier::Tried => &mut self.tried_buckets,
        }
    }

    fn buckets(&self, tier: Tier) -> &Vec<Bucket> {
        match tier {
            Tier::New => &self.new_buckets,
            Tier::Tried => &self.tried_buckets,
        }
    }

    /// Inserts or replaces `info` in the given tier's bucket. If the
    /// target bucket is full and doesn't already hold this `peer_id`, a
    /// random existing entry is evicted first.
    pub fn add(&mut self, tier: Tier, info: PeerInfo) {
        let idx = bucket(&info.ip_address, self.secret, self.bucket_count);
        let peer_id = info.peer_id();
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets_mut(tier)[idx];
        if !bucket.entries.contains_key(&peer_id) && bucket.entries.len() >= bucket_size {
            if let Some(evict_id) = bucket
                .entries
                .keys()
                .cloned()
                .choose(&mut rand::thread_rng())
            {
                bucket.entries.remove(&evict_id);
            }
        }
        bucket.entries.insert(peer_id, info);
    }

    /// Removes `peer_id` from the tier, if present.
    pub fn remove(&mut self, tier: Tier, peer_id: &PeerId) -> Option<PeerInfo> {
        for bucket in self.buckets_mut(tier) {
            if let Some(info) = bucket.entries.remove(peer_id) {
                return Some(info);
            }
        }
        None
    }

    /// Looks up `peer_id` within a tier without requiring the caller to
    /// know its bucket.
    pub fn find(&self, tier: Tier, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.buckets(tier)
            .iter()
            .find_map(|bucket| bucket.entries.get(peer_id))
    }

    /// Alias of `find` taking ownership semantics a host might prefer.
    pub fn get(&self, tier: Tier, peer_id: &PeerId) -> Option<PeerInfo> {
        self.find(tier, peer_id).cloned()
    }

    /// Updates an existing entry in place; no-op if absent.
    pub fn update(&mut self, tier: Tier, info: PeerInfo) {
        let peer_id = info.peer_id();
        if self.find(tier, &peer_id).is_some() {
            self.add(tier, info);
        }
    }

    /// All entries currently held in a tier, across every bucket.
    pub fn all(&self, tier: Tier) -> Vec<PeerInfo> {
        self.buckets(tier)
            .iter()
            .flat_map(|bucket| bucket.entries.values().cloned())
            .collect()
    }

    /// Moves `peer_id` from *new* to *tried*, e.g. after a successful
    /// status fetch.
    pub fn promote_to_tried(&mut self, peer_id: &PeerId) {
        if let Some(info) = self.remove(Tier::New, peer_id) {
            self.add(Tier::Tried, info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_is_deterministic_for_same_inputs() {
        assert_eq!(bucket("1.2.3.4", 42, 64), bucket("1.2.3.4", 42, 64));
    }

    #[test]
    fn bucket_varies_with_secret() {
        let a = bucket("1.2.3.4", 1, 1024);
        let b = bucket("1.2.3.4", 2, 1024);
        // Not a strict guarantee for arbitrary hash collisions, but
        // overwhelmingly true for a real hasher across many secrets.
        assert!(a != b || bucket("1.2.3.4", 3, 1024) != a);
    }

    #[test]
    fn add_then_find_round_trips() {
        let mut dir = PeerDirectory::new(7, 16, 4);
        let info = PeerInfo::new("10.0.0.1", 5000);
        dir.add(Tier::New, info.clone());
        assert_eq!(dir.find(Tier::New, &info.peer_id()), Some(&info));
    }

    #[test]
    fn full_bucket_evicts_one_entry_on_insert() {
        let mut dir = PeerDirectory::new(0, 1, 2);
        dir.add(Tier::New, PeerInfo::new("1.1.1.1", 1));
        dir.add(Tier::New, PeerInfo::new("2.2.2.2", 2));
        assert_eq!(dir.all(Tier::New).len(), 2);
        dir.add(Tier::New, PeerInfo::new("3.3.3.3", 3));
        assert_eq!(dir.all(Tier::New).len(), 2);
        assert!(dir
            .find(Tier::New, &PeerInfo::new("3.3.3.3", 3).peer_id())
            .is_some());
    }

    #[test]
    fn promote_to_tried_moves_entry_between_tiers() {
        let mut dir = PeerDirectory::new(0, 8, 4);
        let info = PeerInfo::new("9.9.9.9", 9);
        dir.add(Tier::New, info.clone());
        dir.promote_to_tried(&info.peer_id());
        assert!(dir.find(Tier::New, &info.peer_id()).is_none());
        assert!(dir.find(Tier::Tried, &info.peer_id()).is_some());
    }
}
