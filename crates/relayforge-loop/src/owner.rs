//! Loop identity and the per-thread ownership tag.
//!
//! Every worker thread records which loop it runs. Session code uses
//! [`debug_assert_owner`] to check, in debug builds, that it is only ever
//! touched from the loop that owns it.

use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of an event loop inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopId(pub usize);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

thread_local! {
    static CURRENT_LOOP: Cell<Option<LoopId>> = const { Cell::new(None) };
}

/// The loop whose worker is running on this thread, if any.
pub fn current_loop() -> Option<LoopId> {
    CURRENT_LOOP.with(Cell::get)
}

/// Whether the calling thread is the worker of `id`.
pub fn is_current(id: LoopId) -> bool {
    current_loop() == Some(id)
}

/// Panics in debug builds unless called from the worker of `owner`.
#[track_caller]
pub fn debug_assert_owner(owner: LoopId) {
    debug_assert_eq!(
        current_loop(),
        Some(owner),
        "loop-confined state touched outside its owning loop"
    );
}

/// Marks the current thread as the worker of a loop until dropped.
pub struct OwnerGuard {
    previous: Option<LoopId>,
}

/// Tags the calling thread as the worker of `id` until the guard drops.
///
/// Workers do this on startup. Outside a worker it lets loop-confined
/// state be driven directly, e.g. from a unit test or a custom executor.
pub fn enter_loop(id: LoopId) -> OwnerGuard {
    let previous = CURRENT_LOOP.with(|c| c.replace(Some(id)));
    OwnerGuard { previous }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|c| c.set(self.previous));
    }
}
