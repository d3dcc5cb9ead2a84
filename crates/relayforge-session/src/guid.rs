//! Unique id generation for sessions and requests.
//!
//! Ids are `u64`. Zero is reserved as "no id" on the wire, so no
//! generator ever returns it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Source of unique, non-zero 64-bit ids.
///
/// One generator is shared by every event loop of a node, so `next` must be
/// safe to call concurrently and must never hand out the same id twice.
pub trait GuidGenerator: Send + Sync + 'static {
    /// Human-readable name, for logs.
    fn name(&self) -> &str;

    /// Returns a fresh id. Never zero.
    fn next(&self) -> u64;
}

/// Process-local counter: 1, 2, 3, …
///
/// Unique within one process only. Good for tests and single-node setups.
#[derive(Debug)]
pub struct SequentialGuid {
    counter: AtomicU64,
}

impl SequentialGuid {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// A generator whose first id is `first` (or 1 if `first` is 0).
    pub fn starting_at(first: u64) -> Self {
        Self {
            counter: AtomicU64::new(first.max(1)),
        }
    }
}

impl Default for SequentialGuid {
    fn default() -> Self {
        Self::new()
    }
}

impl GuidGenerator for SequentialGuid {
    fn name(&self) -> &str {
        "sequential"
    }

    fn next(&self) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // Wrapped around; skip the reserved value.
            self.counter.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }
}

// ---------------------------------------------------------------------------
// SnowflakeGuid
// ---------------------------------------------------------------------------

/// Bits of the per-millisecond sequence.
const SEQUENCE_BITS: u32 = 12;
/// Bits of the node id.
const NODE_BITS: u32 = 10;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
/// Largest node id a [`SnowflakeGuid`] accepts.
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

/// Custom epoch: 2024-01-01T00:00:00Z, in milliseconds since the Unix epoch.
const EPOCH_MILLIS: u64 = 1_704_067_200_000;

/// Cluster-unique ids: `41 bits millis | 10 bits node | 12 bits sequence`.
///
/// Unique across nodes as long as every node gets a distinct node id. Ids
/// from one generator increase monotonically. When the 4096 ids of one
/// millisecond are used up the generator borrows from the next millisecond
/// rather than blocking.
///
/// ```rust
/// use relayforge_session::{GuidGenerator, SnowflakeGuid};
///
/// let guid = SnowflakeGuid::new("gateway", 7);
/// let a = guid.next();
/// let b = guid.next();
/// assert!(b > a);
/// assert_eq!(SnowflakeGuid::node_of(a), 7);
/// ```
#[derive(Debug)]
pub struct SnowflakeGuid {
    name: String,
    node: u64,
    /// `last_millis << SEQUENCE_BITS | last_sequence`, updated by CAS.
    state: AtomicU64,
}

impl SnowflakeGuid {
    /// Creates a generator for `node` (masked to 10 bits).
    pub fn new(name: impl Into<String>, node: u16) -> Self {
        Self {
            name: name.into(),
            node: u64::from(node & MAX_NODE_ID),
            state: AtomicU64::new(0),
        }
    }

    /// Creates a generator with a random node id.
    ///
    /// Collisions between nodes are possible (1 in 1024 per pair), so
    /// clusters should assign node ids explicitly.
    pub fn with_random_node(name: impl Into<String>) -> Self {
        let node = rand::rng().random_range(0..=MAX_NODE_ID);
        Self::new(name, node)
    }

    /// The node id encoded in `id`.
    pub fn node_of(id: u64) -> u16 {
        ((id >> SEQUENCE_BITS) & u64::from(MAX_NODE_ID)) as u16
    }

    fn now_millis() -> u64 {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        (since_unix.as_millis() as u64).saturating_sub(EPOCH_MILLIS).max(1)
    }
}

impl GuidGenerator for SnowflakeGuid {
    fn name(&self) -> &str {
        &self.name
    }

    fn next(&self) -> u64 {
        let mut prev = self.state.load(Ordering::Acquire);
        loop {
            let prev_millis = prev >> SEQUENCE_BITS;
            let prev_seq = prev & MAX_SEQUENCE;
            let now = Self::now_millis();

            // Never go backwards, even if the wall clock does.
            let (millis, seq) = if now > prev_millis {
                (now, 0)
            } else if prev_seq < MAX_SEQUENCE {
                (prev_millis, prev_seq + 1)
            } else {
                (prev_millis + 1, 0)
            };

            let next = (millis << SEQUENCE_BITS) | seq;
            match self
                .state
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return (millis << (NODE_BITS + SEQUENCE_BITS))
                        | (self.node << SEQUENCE_BITS)
                        | seq;
                }
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_sequential_starts_at_one_and_increments() {
        let guid = SequentialGuid::new();
        assert_eq!(guid.next(), 1);
        assert_eq!(guid.next(), 2);
        assert_eq!(guid.next(), 3);
    }

    #[test]
    fn test_sequential_starting_at_zero_skips_zero() {
        let guid = SequentialGuid::starting_at(0);
        assert_eq!(guid.next(), 1);
    }

    #[test]
    fn test_snowflake_ids_are_unique_across_threads() {
        let guid = Arc::new(SnowflakeGuid::new("test", 3));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let guid = Arc::clone(&guid);
                thread::spawn(move || (0..10_000).map(|_| guid.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert_ne!(id, 0);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 40_000);
    }

    #[test]
    fn test_snowflake_ids_are_monotonic_within_one_generator() {
        let guid = SnowflakeGuid::new("test", 1);
        let mut last = 0;
        // More than one millisecond's worth of sequence numbers.
        for _ in 0..10_000 {
            let id = guid.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_snowflake_different_nodes_never_collide() {
        let a = SnowflakeGuid::new("a", 1);
        let b = SnowflakeGuid::new("b", 2);
        let from_a: HashSet<u64> = (0..1_000).map(|_| a.next()).collect();
        assert!((0..1_000).map(|_| b.next()).all(|id| !from_a.contains(&id)));
    }

    #[test]
    fn test_snowflake_node_id_is_masked() {
        let guid = SnowflakeGuid::new("wide", u16::MAX);
        assert_eq!(SnowflakeGuid::node_of(guid.next()), MAX_NODE_ID);
    }
}
