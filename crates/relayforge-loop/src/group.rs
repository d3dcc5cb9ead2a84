//! A fixed pool of event loops with deterministic placement.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::{EventLoop, LoopConfig, LoopError, LoopHandle, LoopId, LoopState};

/// A fixed pool of [`EventLoop`]s.
///
/// Every session is placed on exactly one loop for its whole lifetime.
/// [`next`](Self::next) spreads new work round-robin;
/// [`next_for`](Self::next_for) hashes a key so the same logical peer
/// always lands on the same loop.
pub struct EventLoopGroup<S: LoopState> {
    loops: Vec<EventLoop<S>>,
    cursor: AtomicUsize,
}

impl<S: LoopState + Send> EventLoopGroup<S> {
    /// Builds and starts `size` loops, creating each loop's state with
    /// `factory`. A size of 0 is bumped to 1.
    ///
    /// # Errors
    /// [`LoopError::Spawn`] if a worker thread cannot be started; loops
    /// started before the failure are shut down again.
    pub fn new(
        size: usize,
        config: LoopConfig,
        mut factory: impl FnMut(LoopId) -> S,
    ) -> Result<Self, LoopError> {
        let size = if size == 0 {
            warn!("event loop group size of 0 is not allowed, using 1");
            1
        } else {
            size
        };

        let loops: Vec<EventLoop<S>> = (0..size)
            .map(|i| {
                let id = LoopId(i);
                EventLoop::new(id, config.clone(), factory(id))
            })
            .collect();

        for event_loop in &loops {
            if let Err(e) = event_loop.start() {
                for started in &loops {
                    started.shutdown();
                }
                return Err(e);
            }
        }

        info!(size, "event loop group started");
        Ok(Self {
            loops,
            cursor: AtomicUsize::new(0),
        })
    }
}

impl<S: LoopState> EventLoopGroup<S> {
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Round-robin index of the next loop.
    pub fn next_index(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len()
    }

    /// Round-robin pick.
    pub fn next(&self) -> LoopHandle<S> {
        self.loops[self.next_index()].handle()
    }

    /// Deterministic index for `key`: equal keys always map to the same loop.
    pub fn index_for<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.loops.len() as u64) as usize
    }

    /// Hash-affinity pick.
    pub fn next_for<K: Hash + ?Sized>(&self, key: &K) -> LoopHandle<S> {
        self.loops[self.index_for(key)].handle()
    }

    pub fn get(&self, index: usize) -> Option<LoopHandle<S>> {
        self.loops.get(index).map(EventLoop::handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = LoopHandle<S>> + '_ {
        self.loops.iter().map(EventLoop::handle)
    }

    /// Signals every loop to shut down without waiting.
    pub fn shutdown(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
    }

    /// Shuts every loop down and waits for each within its grace period.
    ///
    /// # Errors
    /// [`LoopError::GroupTermination`] listing every loop that was still
    /// running after its grace period. The group does not retry.
    pub fn terminate(&self) -> Result<(), LoopError> {
        self.shutdown();

        let failed: Vec<LoopId> = self
            .loops
            .iter()
            .filter(|event_loop| !event_loop.await_termination(event_loop.grace()))
            .map(EventLoop::id)
            .collect();

        if failed.is_empty() {
            info!(size = self.loops.len(), "event loop group terminated");
            Ok(())
        } else {
            warn!(?failed, "event loops failed to terminate in time");
            Err(LoopError::GroupTermination { failed })
        }
    }
}
