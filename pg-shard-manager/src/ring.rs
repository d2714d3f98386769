use crate::{Error, ShardIndex};
use siphasher::sip::SipHasher24;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;

/// Consistent hash ring over shard indices.
///
/// Each shard is placed at `virtual_nodes` positions, hashed from
/// `"{index}:{ordinal}"`. A key belongs to the first position clockwise from
/// its own hash. Lookups go through `BTreeMap::range`, so they stay
/// logarithmic in the number of positions.
///
/// The ring is only mutated when topology changes; routing works on a
/// shared immutable snapshot (see [`ShardManager`](crate::ShardManager)).
#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u64, ShardIndex>,
    placements: HashMap<ShardIndex, Vec<u64>>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            placements: HashMap::new(),
            virtual_nodes,
        }
    }

    /// Place a shard on the ring. No-op if it is already present.
    pub fn add_node(&mut self, shard: ShardIndex) {
        if self.placements.contains_key(&shard) {
            return;
        }

        let mut placed = Vec::with_capacity(self.virtual_nodes);
        for ordinal in 0..self.virtual_nodes {
            let mut hash = hash_key(&format!("{}:{}", shard, ordinal));
            // Linear probe on the (rare) collision so every shard keeps
            // exactly `virtual_nodes` positions.
            while self.ring.contains_key(&hash) {
                hash = hash.wrapping_add(1);
            }
            self.ring.insert(hash, shard);
            placed.push(hash);
        }
        self.placements.insert(shard, placed);
    }

    /// Remove every position owned by `shard`. Returns `false` if the shard
    /// was not on the ring.
    pub fn remove_node(&mut self, shard: ShardIndex) -> bool {
        match self.placements.remove(&shard) {
            Some(placed) => {
                for hash in placed {
                    self.ring.remove(&hash);
                }
                true
            }
            None => false,
        }
    }

    /// Resolve the shard owning `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the ring has no shards.
    pub fn get_node(&self, key: &str) -> Result<ShardIndex, Error> {
        let hash = hash_key(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, shard)| *shard)
            .ok_or_else(|| Error::configuration("hash ring is empty; add a shard first"))
    }

    pub fn contains_node(&self, shard: ShardIndex) -> bool {
        self.placements.contains_key(&shard)
    }

    /// Number of shards on the ring.
    pub fn node_count(&self) -> usize {
        self.placements.len()
    }

    /// Number of virtual positions on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Shard indices on the ring, ascending.
    pub fn nodes(&self) -> impl Iterator<Item = ShardIndex> + '_ {
        let mut nodes: Vec<ShardIndex> = self.placements.keys().copied().collect();
        nodes.sort_unstable();
        nodes.into_iter()
    }
}

#[inline]
fn hash_key(key: &str) -> u64 {
    let mut hasher = SipHasher24::new();
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ring_with(shards: &[ShardIndex], virtual_nodes: usize) -> HashRing {
        let mut ring = HashRing::new(virtual_nodes);
        for &shard in shards {
            ring.add_node(shard);
        }
        ring
    }

    #[test]
    fn test_empty_ring_is_configuration_error() {
        let ring = HashRing::new(150);
        assert!(matches!(
            ring.get_node("user:1"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_single_shard_owns_everything() {
        let ring = ring_with(&[7], 150);
        for i in 0..100 {
            assert_eq!(ring.get_node(&format!("key-{}", i)).unwrap(), 7);
        }
    }

    #[test]
    fn test_ring_holds_v_times_s_entries() {
        let mut ring = ring_with(&[0, 1, 2], 150);
        assert_eq!(ring.len(), 450);
        assert_eq!(ring.node_count(), 3);

        // Re-adding is a no-op
        ring.add_node(1);
        assert_eq!(ring.len(), 450);

        assert!(ring.remove_node(1));
        assert_eq!(ring.len(), 300);
        assert!(!ring.contains_node(1));
        assert!(!ring.remove_node(1));
        assert_eq!(ring.nodes().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = ring_with(&[0, 1, 2], 150);
        let twin = ring_with(&[2, 0, 1], 150);

        for i in 0..1000 {
            let key = format!("user:{}", i);
            let first = ring.get_node(&key).unwrap();
            for _ in 0..5 {
                assert_eq!(ring.get_node(&key).unwrap(), first);
            }
            // Insertion order does not matter
            assert_eq!(twin.get_node(&key).unwrap(), first);
        }
    }

    #[test]
    fn test_remove_restores_previous_assignment() {
        let before = ring_with(&[0, 1, 2], 150);
        let mut after = ring_with(&[0, 1, 2], 150);
        after.add_node(3);
        after.remove_node(3);

        for i in 0..1000 {
            let key = format!("order:{}", i);
            assert_eq!(before.get_node(&key).unwrap(), after.get_node(&key).unwrap());
        }
    }

    #[test]
    fn test_three_shards_even_distribution() {
        let ring = ring_with(&[0, 1, 2], 150);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let total = 100_000;
        let mut counts = [0usize; 3];

        for _ in 0..total {
            let key = format!("key-{:016x}", rng.gen::<u64>());
            counts[ring.get_node(&key).unwrap()] += 1;
        }

        let mean = total as f64 / 3.0;
        for (shard, &count) in counts.iter().enumerate() {
            let deviation = (count as f64 - mean).abs() / mean;
            assert!(
                deviation <= 0.15,
                "Shard {} got {} keys ({:.1}% off the mean)",
                shard,
                count,
                deviation * 100.0
            );
        }
        assert_eq!(counts.iter().sum::<usize>(), total);
    }

    #[test]
    fn test_scale_up_minimal_remapping() {
        let before = ring_with(&[0, 1, 2], 150);
        let after = ring_with(&[0, 1, 2, 3], 150);
        let total = 10_000;
        let mut moved = 0;

        for i in 0..total {
            let key = format!("user:{}", i);
            let old = before.get_node(&key).unwrap();
            let new = after.get_node(&key).unwrap();
            if old != new {
                assert_eq!(new, 3, "Key {} moved between surviving shards", key);
                moved += 1;
            }
        }

        // ~1/4 expected; allow 1.5x for virtual node variance
        let moved_pct = moved as f64 / total as f64;
        assert!(
            moved_pct <= 1.5 / 4.0,
            "Expected <=37.5% keys remapped after scale-up, got {:.1}%",
            moved_pct * 100.0
        );
        assert!(moved > 0);
    }

    #[test]
    fn test_scale_down_minimal_remapping() {
        let before = ring_with(&[0, 1, 2], 150);
        let after = ring_with(&[0, 2], 150);
        let total = 10_000;
        let mut moved = 0;

        for i in 0..total {
            let key = format!("user:{}", i);
            let old = before.get_node(&key).unwrap();
            let new = after.get_node(&key).unwrap();
            if old != new {
                assert_eq!(old, 1, "Key {} moved off a surviving shard", key);
                moved += 1;
            }
        }

        let moved_pct = moved as f64 / total as f64;
        assert!(
            moved_pct <= 1.5 / 3.0,
            "Expected <=50% keys remapped after scale-down, got {:.1}%",
            moved_pct * 100.0
        );
    }

    #[test]
    fn test_ten_shards_every_shard_gets_keys() {
        let shards: Vec<ShardIndex> = (0..10).collect();
        let ring = ring_with(&shards, 150);
        let mut counts = [0usize; 10];

        for i in 0..10_000 {
            counts[ring.get_node(&format!("tenant:{:032x}", i)).unwrap()] += 1;
        }

        for (shard, &count) in counts.iter().enumerate() {
            let pct = count as f64 / 100.0;
            assert!(
                pct > 6.0 && pct < 14.0,
                "Shard {} has {:.1}% of keys (expected ~10%)",
                shard,
                pct
            );
        }
    }
}
