//! Snowflake-style unique id generation
//!
//! Every locally-originated object id comes from one generator seeded with
//! the node id obtained at registration, so ids are unique across the
//! cluster without further coordination.

use chrono::Utc;
use parking_lot::Mutex;

const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Custom epoch (2024-01-01T00:00:00Z) keeps the 41-bit timestamp field
/// usable for ~69 years.
const EPOCH_MS: i64 = 1_704_067_200_000;

#[derive(Debug)]
struct GeneratorState {
    last_ms: i64,
    sequence: u64,
}

/// Generator of 64-bit ids: 41-bit millisecond timestamp, 10-bit node id,
/// 12-bit per-millisecond sequence.
#[derive(Debug)]
pub struct SnowflakeIdGenerator {
    node_id: u64,
    state: Mutex<GeneratorState>,
}

impl SnowflakeIdGenerator {
    /// Create a generator for the given node id. Ids from generators seeded
    /// with distinct node ids never collide.
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id: node_id & NODE_MASK,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Next id. Never returns the same value twice; a wall clock running
    /// backward is absorbed by holding the high-water millisecond.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let now = (Utc::now().timestamp_millis() - EPOCH_MS).max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; move to the next.
                state.last_ms += 1;
            }
        } else {
            state.last_ms = now;
            state.sequence = 0;
        }
        ((state.last_ms as u64) << (NODE_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_increasing() {
        let generator = SnowflakeIdGenerator::new(3);
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(seen.insert(id));
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn node_id_embedded_in_ids() {
        let generator = SnowflakeIdGenerator::new(42);
        let id = generator.next_id();
        assert_eq!((id >> SEQUENCE_BITS) & NODE_MASK, 42);
    }

    #[test]
    fn distinct_nodes_never_collide() {
        let a = SnowflakeIdGenerator::new(1);
        let b = SnowflakeIdGenerator::new(2);
        let ids_a: HashSet<u64> = (0..1000).map(|_| a.next_id()).collect();
        let ids_b: HashSet<u64> = (0..1000).map(|_| b.next_id()).collect();
        assert!(ids_a.is_disjoint(&ids_b));
    }
}
