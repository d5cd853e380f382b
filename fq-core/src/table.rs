use std::collections::BTreeMap;

use crate::config::NSEC_PER_SEC;
use crate::flow::{FlowArena, FlowId};
use crate::packet::FlowKey;

/// Most flows collected per opportunistic GC pass.
const GC_MAX: usize = 8;
/// Detached flows older than this are GC candidates.
pub(crate) const GC_AGE_NS: u64 = 3 * NSEC_PER_SEC;

/// Golden-ratio multiplicative hash truncated to `log` bits.
fn hash_bits(raw: u64, log: u32) -> usize {
    const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;
    (raw.wrapping_mul(GOLDEN_RATIO_64) >> (64 - log)) as usize
}

/// Hash-bucketed flow index: `2^log` buckets, each an ordered tree keyed by
/// the raw flow key. Keys are unique across the table.
pub(crate) struct FlowTable {
    buckets: Vec<BTreeMap<u64, FlowId>>,
    log: u32,
}

impl FlowTable {
    pub fn new(log: u32) -> Self {
        Self { buckets: (0..1usize << log).map(|_| BTreeMap::new()).collect(), log }
    }

    pub fn log(&self) -> u32 {
        self.log
    }

    pub fn buckets(&self) -> u32 {
        1 << self.log
    }

    fn bucket_of(&self, key: FlowKey) -> usize {
        hash_bits(key.raw(), self.log)
    }

    pub fn get(&self, key: FlowKey) -> Option<FlowId> {
        self.buckets[self.bucket_of(key)].get(&key.raw()).copied()
    }

    pub fn insert(&mut self, key: FlowKey, id: FlowId) {
        let bucket = self.bucket_of(key);
        let prev = self.buckets[bucket].insert(key.raw(), id);
        debug_assert!(prev.is_none(), "duplicate flow key");
    }

    /// Walks the bucket `probe` hashes to and reclaims up to [`GC_MAX`]
    /// detached flows older than [`GC_AGE_NS`]. The walk stops early when it
    /// reaches the probe key. Returns the number of flows reclaimed.
    pub fn gc(&mut self, arena: &mut FlowArena, probe: FlowKey, now_ns: u64) -> u32 {
        let bucket = self.bucket_of(probe);
        let probe_raw = probe.raw();
        let mut victims = Vec::new();

        for (&raw, &id) in &self.buckets[bucket] {
            if raw == probe_raw {
                break;
            }
            if gc_candidate(arena, id, now_ns) {
                victims.push(raw);
                if victims.len() == GC_MAX {
                    break;
                }
            }
        }

        for raw in &victims {
            let id = self.buckets[bucket].remove(raw).expect("victim vanished");
            let flow = arena.remove(id);
            debug_assert_eq!(flow.qlen, 0);
        }
        victims.len() as u32
    }

    /// Rebuilds the table with `2^new_log` buckets, dropping GC candidates
    /// along the way. Returns how many flows were dropped.
    pub fn rehash(&mut self, arena: &mut FlowArena, new_log: u32, now_ns: u64) -> u32 {
        let mut fresh: Vec<BTreeMap<u64, FlowId>> =
            (0..1usize << new_log).map(|_| BTreeMap::new()).collect();
        let mut dropped = 0;

        for bucket in self.buckets.drain(..) {
            for (raw, id) in bucket {
                if gc_candidate(arena, id, now_ns) {
                    arena.remove(id);
                    dropped += 1;
                    continue;
                }
                let slot = hash_bits(raw, new_log);
                let prev = fresh[slot].insert(raw, id);
                debug_assert!(prev.is_none(), "duplicate flow key during rehash");
            }
        }

        self.buckets = fresh;
        self.log = new_log;
        dropped
    }

    /// Empties the table, returning every flow id it held.
    pub fn take_all(&mut self) -> Vec<FlowId> {
        let mut ids = Vec::new();
        for bucket in &mut self.buckets {
            ids.extend(std::mem::take(bucket).into_values());
        }
        ids
    }
}

fn gc_candidate(arena: &FlowArena, id: FlowId, now_ns: u64) -> bool {
    match arena[id].state {
        crate::flow::FlowState::Detached { age_ns } => now_ns > age_ns + GC_AGE_NS,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;

    fn seed(arena: &mut FlowArena, table: &mut FlowTable, key: FlowKey, age_ns: u64) -> FlowId {
        let id = arena.insert(Flow::new(key, 0, 0, age_ns)).unwrap();
        table.insert(key, id);
        id
    }

    #[test]
    fn lookup_round_trips() {
        let mut arena = FlowArena::new();
        let mut table = FlowTable::new(4);

        let key = FlowKey::Endpoint(42);
        assert_eq!(table.get(key), None);
        let id = seed(&mut arena, &mut table, key, 0);
        assert_eq!(table.get(key), Some(id));
        assert_eq!(table.get(FlowKey::Synthetic(42)), None);
    }

    #[test]
    fn gc_reclaims_only_old_detached_flows() {
        let mut arena = FlowArena::new();
        let mut table = FlowTable::new(1);
        let now = 10 * NSEC_PER_SEC;

        let stale = seed(&mut arena, &mut table, FlowKey::Synthetic(1), 0);
        let fresh = seed(&mut arena, &mut table, FlowKey::Synthetic(2), now - 1);
        let _ = stale;

        // Probe with an absent key that hashes into the stale flow's bucket,
        // so the walk covers the whole bucket without stopping early.
        let stale_bucket = hash_bits(FlowKey::Synthetic(1).raw(), table.log());
        let probe = (100..)
            .find(|&k| {
                hash_bits(FlowKey::Synthetic(k).raw(), table.log()) == stale_bucket
            })
            .unwrap();

        let collected = table.gc(&mut arena, FlowKey::Synthetic(probe), now);
        assert_eq!(collected, 1);
        assert_eq!(table.get(FlowKey::Synthetic(1)), None);
        assert_eq!(table.get(FlowKey::Synthetic(2)), Some(fresh));
    }

    #[test]
    fn gc_stops_at_probe_key() {
        let mut arena = FlowArena::new();
        let mut table = FlowTable::new(1);
        let now = 10 * NSEC_PER_SEC;

        // All keys land in one of two buckets; probing with an existing key
        // must never collect entries at or beyond it.
        for k in 0..16u32 {
            seed(&mut arena, &mut table, FlowKey::Synthetic(k), 0);
        }
        let before: usize = (0..16u32).filter(|&k| table.get(FlowKey::Synthetic(k)).is_some()).count();
        assert_eq!(before, 16);

        table.gc(&mut arena, FlowKey::Synthetic(0), now);
        // Key 0 itself survives: the walk stops when it reaches the probe.
        assert!(table.get(FlowKey::Synthetic(0)).is_some());
    }

    #[test]
    fn rehash_moves_survivors_and_drops_candidates() {
        let mut arena = FlowArena::new();
        let mut table = FlowTable::new(2);
        let now = 10 * NSEC_PER_SEC;

        seed(&mut arena, &mut table, FlowKey::Synthetic(1), 0); // stale
        let kept_a = seed(&mut arena, &mut table, FlowKey::Endpoint(2), now);
        let kept_b = seed(&mut arena, &mut table, FlowKey::Synthetic(3), now);

        let dropped = table.rehash(&mut arena, 6, now);
        assert_eq!(dropped, 1);
        assert_eq!(table.log(), 6);
        assert_eq!(table.get(FlowKey::Endpoint(2)), Some(kept_a));
        assert_eq!(table.get(FlowKey::Synthetic(3)), Some(kept_b));
        assert_eq!(table.get(FlowKey::Synthetic(1)), None);
    }
}
