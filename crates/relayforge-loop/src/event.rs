//! Events: the unit of work moved through a loop's queue.
//!
//! Events are plain values. A producer builds one, moves it into the
//! queue, and the worker consumes it by value, so nothing is pooled and
//! nothing needs clearing after dispatch.

use std::fmt;

use crate::{LoopContext, LoopError, LoopId, ScheduledTask};

/// A closure run on the worker without access to loop state.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A closure run on the worker with exclusive access to the loop state.
pub type Task<S> = Box<dyn FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static>;

/// State owned by one event loop and only ever touched on its worker.
///
/// The state value is moved into the worker thread when the loop starts;
/// other threads reach it exclusively by enqueuing [`Event`]s.
pub trait LoopState: Sized + 'static {
    /// Application message type delivered through [`Event::Message`].
    type Message: Send + 'static;

    /// Runs once on the worker before the first event.
    fn on_start(&mut self, ctx: &mut LoopContext<Self>) {
        let _ = ctx;
    }

    /// Handles one application message.
    fn on_message(&mut self, ctx: &mut LoopContext<Self>, msg: Self::Message);

    /// Periodic housekeeping, every `sweep_interval`. `ctx.now()` is the
    /// loop's coarse tick clock.
    fn on_sweep(&mut self, ctx: &mut LoopContext<Self>) {
        let _ = ctx;
    }

    /// Runs once after the queue has been drained during shutdown.
    fn on_shutdown(&mut self, ctx: &mut LoopContext<Self>) {
        let _ = ctx;
    }
}

/// One unit of work for a loop.
pub enum Event<S: LoopState> {
    /// Application message for [`LoopState::on_message`].
    Message(S::Message),
    /// Closure with access to the loop state.
    Task(Task<S>),
    /// Closure without access to the loop state (future listeners).
    Job(Job),
    /// Registers a delayed task with the loop's scheduler.
    Schedule(ScheduledTask<S>),
}

impl<S: LoopState> Event<S> {
    /// Wraps a closure as a [`Event::Task`].
    pub fn task(f: impl FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static) -> Self {
        Self::Task(Box::new(f))
    }

    /// Wraps a closure as a [`Event::Job`].
    pub fn job(f: impl FnOnce() + Send + 'static) -> Self {
        Self::Job(Box::new(f))
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Task(_) => "task",
            Self::Job(_) => "job",
            Self::Schedule(_) => "schedule",
        }
    }
}

impl<S: LoopState> fmt::Debug for Event<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("kind", &self.kind()).finish()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// A job the loop refused, handed back to the caller.
pub struct RejectedJob {
    pub job: Job,
    pub error: LoopError,
}

impl fmt::Debug for RejectedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedJob").field("error", &self.error).finish()
    }
}

/// Type-erased view of a loop that can run plain jobs.
///
/// Futures use this to re-dispatch listeners onto the loop that owns the
/// session, without knowing the loop's state type.
pub trait Executor: Send + Sync + 'static {
    /// Identity of the loop behind this executor.
    fn loop_id(&self) -> LoopId;

    /// Enqueues a job; returns it back if the loop refuses.
    fn execute_job(&self, job: Job) -> Result<(), RejectedJob>;
}
