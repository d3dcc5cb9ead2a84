//! Single-threaded event loops for relayforge.
//!
//! An [`EventLoop`] owns one worker thread, one bounded FIFO queue of
//! [`Event`]s, a deadline-ordered set of delayed tasks, and a periodic
//! sweep. Its [`LoopState`] lives only on that thread: other threads reach
//! it by enqueuing events, never by touching fields. That confinement is
//! what lets session code run without locks.
//!
//! An [`EventLoopGroup`] is a fixed pool of loops with round-robin and
//! hash-affinity placement.
//!
//! ```text
//! producer threads ──execute──▶ LoopHandle ──queue──▶ worker (LoopState + LoopContext)
//! ```

mod config;
mod error;
mod event;
mod event_loop;
mod group;
mod owner;
mod schedule;

pub use config::LoopConfig;
pub use error::{LoopError, RejectReason};
pub use event::{Event, Executor, Job, LoopState, RejectedJob, Task};
pub use event_loop::{EventLoop, LoopContext, LoopHandle, LoopMetrics, LoopStatus};
pub use group::EventLoopGroup;
pub use owner::{LoopId, OwnerGuard, current_loop, debug_assert_owner, enter_loop, is_current};
pub use schedule::{ScheduledTask, TaskHandle, deadline_after};
