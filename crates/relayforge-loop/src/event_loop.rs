//! The event loop: one worker thread draining one bounded FIFO queue.
//!
//! ```text
//!  any thread ──execute(Event)──▶ [ bounded queue ] ──▶ worker thread
//!                                                        │
//!                 ┌──────────────────────────────────────┘
//!                 ▼
//!   loop {
//!     refresh tick clock
//!     drain ≤ max_batch events FIFO      (panics caught + logged)
//!     run due scheduled tasks            (deadline order, ties FIFO)
//!     sweep every sweep_interval         (LoopState::on_sweep)
//!     park until: event │ next deadline │ shutdown signal
//!   }
//! ```
//!
//! The worker runs a current-thread Tokio runtime so it can park on the
//! queue and on timers at the same time, the same way a room actor sits in
//! `tokio::select!`. The loop state never leaves the worker thread.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::owner;
use crate::schedule::{Scheduler, deadline_after};
use crate::{
    Event, Executor, Job, LoopConfig, LoopError, LoopId, LoopState, RejectReason, RejectedJob,
    ScheduledTask, TaskHandle,
};

// ---------------------------------------------------------------------------
// LoopStatus
// ---------------------------------------------------------------------------

/// Lifecycle of an event loop.
///
/// ```text
/// New → Starting → Running → ShuttingDown → Terminated
///  └───────────────(shutdown before start)──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopStatus {
    New,
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

impl LoopStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }

    /// Whether `execute` still accepts events in this status.
    pub fn accepts_work(self) -> bool {
        self < Self::ShuttingDown
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counters for one loop, readable from any thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    /// Events dispatched (all kinds).
    pub dispatched: u64,
    /// Events or tasks whose handler panicked.
    pub failures: u64,
    /// Submissions refused with [`LoopError::Rejected`].
    pub rejected: u64,
    /// Scheduled tasks that ran.
    pub timers_fired: u64,
    /// Sweeps performed.
    pub sweeps: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
    timers_fired: AtomicU64,
    sweeps: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LoopMetrics {
        LoopMetrics {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Shared state + handle
// ---------------------------------------------------------------------------

struct Shared<S: LoopState> {
    id: LoopId,
    status: AtomicU8,
    tx: mpsc::Sender<Event<S>>,
    shutdown_signal: Notify,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
    counters: Counters,
}

impl<S: LoopState> Shared<S> {
    fn status(&self) -> LoopStatus {
        LoopStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: LoopStatus, to: LoopStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_terminated(&self) {
        self.status.store(LoopStatus::Terminated as u8, Ordering::Release);
        let mut done = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.terminated_cv.notify_all();
    }
}

/// Cloneable, thread-safe handle for submitting work to a loop.
pub struct LoopHandle<S: LoopState> {
    shared: Arc<Shared<S>>,
}

impl<S: LoopState> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: LoopState> fmt::Debug for LoopHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.shared.id)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl<S: LoopState> LoopHandle<S> {
    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    pub fn status(&self) -> LoopStatus {
        self.shared.status()
    }

    /// Whether the calling thread is this loop's worker.
    pub fn in_loop(&self) -> bool {
        owner::is_current(self.shared.id)
    }

    pub fn metrics(&self) -> LoopMetrics {
        self.shared.counters.snapshot()
    }

    /// Enqueues an event from any thread.
    ///
    /// # Errors
    /// [`LoopError::Rejected`] when the loop is shutting down, terminated,
    /// or its queue is full. A rejected event is never silently dropped:
    /// the caller always learns about it.
    pub fn execute(&self, event: Event<S>) -> Result<(), LoopError> {
        self.try_execute(event).map_err(|(err, _event)| err)
    }

    /// Like [`execute`](Self::execute) but hands a refused event back.
    pub fn try_execute(&self, event: Event<S>) -> Result<(), (LoopError, Event<S>)> {
        let status = self.shared.status();
        if !status.accepts_work() {
            Counters::bump(&self.shared.counters.rejected);
            let reason = if status == LoopStatus::Terminated {
                RejectReason::Terminated
            } else {
                RejectReason::ShuttingDown
            };
            return Err((LoopError::rejected(self.shared.id, reason), event));
        }
        self.shared.tx.try_send(event).map_err(|e| {
            Counters::bump(&self.shared.counters.rejected);
            match e {
                mpsc::error::TrySendError::Full(ev) => (
                    LoopError::rejected(self.shared.id, RejectReason::QueueFull),
                    ev,
                ),
                mpsc::error::TrySendError::Closed(ev) => (
                    LoopError::rejected(self.shared.id, RejectReason::ShuttingDown),
                    ev,
                ),
            }
        })
    }

    /// Enqueues a closure with access to the loop state.
    pub fn execute_task(
        &self,
        task: impl FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static,
    ) -> Result<(), LoopError> {
        self.execute(Event::task(task))
    }

    /// Delivers an application message.
    pub fn send(&self, msg: S::Message) -> Result<(), LoopError> {
        self.execute(Event::Message(msg))
    }

    /// Schedules `task` to run on the loop after `delay`.
    ///
    /// The returned handle can be cancelled from any thread, even before the
    /// loop has registered the task.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static,
    ) -> Result<TaskHandle, LoopError> {
        self.schedule_at(deadline_after(Instant::now(), delay), task)
    }

    /// Schedules `task` to run on the loop at `deadline`.
    pub fn schedule_at(
        &self,
        deadline: Instant,
        task: impl FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static,
    ) -> Result<TaskHandle, LoopError> {
        let (scheduled, handle) = ScheduledTask::new(deadline, task);
        self.execute(Event::Schedule(scheduled))?;
        Ok(handle)
    }

    /// Asks the loop to stop. Idempotent; returns immediately.
    ///
    /// New submissions are rejected from this point on; queued events are
    /// drained by the worker within `shutdown_grace`.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.transition(LoopStatus::New, LoopStatus::Terminated) {
            info!(loop_id = %shared.id, "event loop terminated before start");
            shared.mark_terminated();
            return;
        }
        if shared.transition(LoopStatus::Starting, LoopStatus::ShuttingDown)
            || shared.transition(LoopStatus::Running, LoopStatus::ShuttingDown)
        {
            debug!(loop_id = %shared.id, "event loop shutting down");
            shared.shutdown_signal.notify_one();
        }
    }

    /// Blocks until the loop has terminated or `timeout` elapses.
    /// Returns `true` if the loop terminated.
    ///
    /// # Panics
    /// When called from the loop's own worker, which would never return.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        assert!(
            !self.in_loop(),
            "await_termination called from inside {}",
            self.shared.id
        );
        let guard = self
            .shared
            .terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (done, _timeout) = self
            .shared
            .terminated_cv
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }
}

impl<S: LoopState> Executor for LoopHandle<S> {
    fn loop_id(&self) -> LoopId {
        self.shared.id
    }

    fn execute_job(&self, job: Job) -> Result<(), RejectedJob> {
        match self.try_execute(Event::Job(job)) {
            Ok(()) => Ok(()),
            Err((error, Event::Job(job))) => Err(RejectedJob { job, error }),
            Err((error, _)) => unreachable!("loop returned a different event: {error}"),
        }
    }
}

// ---------------------------------------------------------------------------
// LoopContext
// ---------------------------------------------------------------------------

/// Worker-side context handed to every task and [`LoopState`] callback.
pub struct LoopContext<S: LoopState> {
    now: Instant,
    scheduler: Scheduler<S>,
    handle: LoopHandle<S>,
}

impl<S: LoopState> LoopContext<S> {
    fn new(handle: LoopHandle<S>) -> Self {
        Self {
            now: Instant::now(),
            scheduler: Scheduler::new(),
            handle,
        }
    }

    pub fn id(&self) -> LoopId {
        self.handle.id()
    }

    /// The loop's tick clock: refreshed once per iteration, not per read.
    ///
    /// Always at or before the real time, so deadline checks against it can
    /// fire late but never early.
    pub fn now(&self) -> Instant {
        self.now
    }

    fn refresh_clock(&mut self) {
        self.now = Instant::now();
    }

    /// Handle for this loop, e.g. to give to futures or other threads.
    pub fn handle(&self) -> &LoopHandle<S> {
        &self.handle
    }

    /// Schedules `task` on this loop after `delay`. Never blocks.
    pub fn schedule(
        &mut self,
        delay: Duration,
        task: impl FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static,
    ) -> TaskHandle {
        self.schedule_at(deadline_after(Instant::now(), delay), task)
    }

    /// Schedules `task` on this loop at `deadline`.
    pub fn schedule_at(
        &mut self,
        deadline: Instant,
        task: impl FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static,
    ) -> TaskHandle {
        let (scheduled, handle) = ScheduledTask::new(deadline, task);
        self.scheduler.insert(scheduled);
        handle
    }

    /// Number of delayed tasks waiting (including cancelled ones not yet purged).
    pub fn pending_tasks(&self) -> usize {
        self.scheduler.len()
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

/// A single-threaded event loop.
///
/// Created in [`LoopStatus::New`]; events submitted before
/// [`start`](Self::start) are queued and run once the worker is up.
pub struct EventLoop<S: LoopState> {
    handle: LoopHandle<S>,
    config: LoopConfig,
    pending_start: Mutex<Option<(S, mpsc::Receiver<Event<S>>)>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S: LoopState + Send> EventLoop<S> {
    pub fn new(id: LoopId, config: LoopConfig, state: S) -> Self {
        let config = config.validated();
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(Shared {
            id,
            status: AtomicU8::new(LoopStatus::New as u8),
            tx,
            shutdown_signal: Notify::new(),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
            counters: Counters::default(),
        });
        Self {
            handle: LoopHandle { shared },
            config,
            pending_start: Mutex::new(Some((state, rx))),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the worker thread.
    ///
    /// # Errors
    /// [`LoopError::Rejected`] if the loop was already started or shut
    /// down; [`LoopError::Spawn`] if the OS refused the thread.
    pub fn start(&self) -> Result<(), LoopError> {
        let shared = &self.handle.shared;
        if !shared.transition(LoopStatus::New, LoopStatus::Starting) {
            let reason = match shared.status() {
                LoopStatus::Terminated => RejectReason::Terminated,
                _ => RejectReason::ShuttingDown,
            };
            return Err(LoopError::rejected(shared.id, reason));
        }

        let Some((state, rx)) = self
            .pending_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(LoopError::rejected(shared.id, RejectReason::Terminated));
        };

        let worker = Worker {
            state,
            rx,
            ctx: LoopContext::new(self.handle.clone()),
            config: self.config.clone(),
        };
        let name = format!("{}-{}", self.config.thread_name_prefix, shared.id.0);
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run_on_thread());

        match spawned {
            Ok(join) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
                Ok(())
            }
            Err(e) => {
                shared.mark_terminated();
                Err(LoopError::Spawn {
                    loop_id: shared.id,
                    message: e.to_string(),
                })
            }
        }
    }
}

impl<S: LoopState> EventLoop<S> {
    pub fn id(&self) -> LoopId {
        self.handle.id()
    }

    pub fn status(&self) -> LoopStatus {
        self.handle.status()
    }

    pub fn handle(&self) -> LoopHandle<S> {
        self.handle.clone()
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Waits up to `timeout` for the worker to finish, then joins it.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        if !self.handle.await_termination(timeout) {
            return false;
        }
        if let Some(join) = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if join.join().is_err() {
                warn!(loop_id = %self.id(), "event loop worker panicked during teardown");
            }
        }
        true
    }

    pub(crate) fn grace(&self) -> Duration {
        self.config.shutdown_grace
    }
}

impl<S: LoopState> Drop for EventLoop<S> {
    fn drop(&mut self) {
        if self.status() != LoopStatus::Terminated && !self.handle.in_loop() {
            self.handle.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum Wake<S: LoopState> {
    Shutdown,
    Event(Option<Event<S>>),
    Timer,
}

struct Worker<S: LoopState> {
    state: S,
    rx: mpsc::Receiver<Event<S>>,
    ctx: LoopContext<S>,
    config: LoopConfig,
}

impl<S: LoopState> Worker<S> {
    fn run_on_thread(self) {
        let shared = Arc::clone(&self.ctx.handle.shared);
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!(loop_id = %shared.id, error = %e, "failed to build loop runtime");
                shared.mark_terminated();
                return;
            }
        };
        let _owner = owner::enter_loop(shared.id);
        runtime.block_on(self.run());
    }

    async fn run(mut self) {
        let shared = Arc::clone(&self.ctx.handle.shared);
        shared.transition(LoopStatus::Starting, LoopStatus::Running);
        info!(loop_id = %shared.id, "event loop running");

        self.guarded("on_start", |state, ctx| state.on_start(ctx));
        let mut next_sweep = deadline_after(self.ctx.now, self.config.sweep_interval);

        loop {
            if !shared.status().accepts_work() {
                break;
            }

            self.ctx.refresh_clock();
            self.drain_batch();

            self.ctx.refresh_clock();
            self.run_due_tasks();

            if self.ctx.now >= next_sweep {
                self.sweep();
                next_sweep = deadline_after(self.ctx.now, self.config.sweep_interval);
            }

            let wake_at = self
                .ctx
                .scheduler
                .next_deadline()
                .map_or(next_sweep, |deadline| deadline.min(next_sweep));

            let wake = tokio::select! {
                biased;
                _ = shared.shutdown_signal.notified() => Wake::Shutdown,
                event = self.rx.recv() => Wake::Event(event),
                _ = tokio::time::sleep_until(wake_at) => Wake::Timer,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Event(Some(event)) => {
                    self.ctx.refresh_clock();
                    self.dispatch(event);
                }
                // Unreachable while `shared` holds a sender.
                Wake::Event(None) => break,
                Wake::Timer => {}
            }
        }

        self.shut_down(&shared);
    }

    fn drain_batch(&mut self) {
        for _ in 0..self.config.max_batch {
            match self.rx.try_recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => break,
            }
        }
    }

    fn run_due_tasks(&mut self) {
        let now = self.ctx.now;
        while let Some(scheduled) = self.ctx.scheduler.pop_due(now) {
            if !scheduled.handle.try_fire() {
                trace!(loop_id = %self.ctx.id(), "skipping cancelled task");
                continue;
            }
            Counters::bump(&self.ctx.handle.shared.counters.timers_fired);
            let task = scheduled.task;
            self.guarded("scheduled task", task);
        }
    }

    fn sweep(&mut self) {
        Counters::bump(&self.ctx.handle.shared.counters.sweeps);
        let purged = self.ctx.scheduler.purge_cancelled();
        if purged > 0 {
            trace!(loop_id = %self.ctx.id(), purged, "purged cancelled tasks");
        }
        self.guarded("on_sweep", |state, ctx| state.on_sweep(ctx));
    }

    fn dispatch(&mut self, event: Event<S>) {
        Counters::bump(&self.ctx.handle.shared.counters.dispatched);
        trace!(loop_id = %self.ctx.id(), kind = event.kind(), "dispatching event");
        match event {
            Event::Message(msg) => self.guarded("message", |state, ctx| state.on_message(ctx, msg)),
            Event::Task(task) => self.guarded("task", task),
            Event::Job(job) => self.guarded("job", |_, _| job()),
            Event::Schedule(scheduled) => self.ctx.scheduler.insert(scheduled),
        }
    }

    /// Runs `f` against the loop state, containing panics so one failing
    /// handler cannot take the loop (or its other sessions) down.
    fn guarded(&mut self, what: &'static str, f: impl FnOnce(&mut S, &mut LoopContext<S>)) {
        let Self { state, ctx, .. } = self;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(state, ctx))) {
            Counters::bump(&ctx.handle.shared.counters.failures);
            error!(
                loop_id = %ctx.id(),
                what,
                panic = panic_message(panic.as_ref()),
                "event handler failed"
            );
        }
    }

    fn shut_down(mut self, shared: &Shared<S>) {
        shared.transition(LoopStatus::Running, LoopStatus::ShuttingDown);
        // Later submissions fail with `Closed`, which `try_execute` reports
        // as a rejection.
        self.rx.close();

        let deadline = std::time::Instant::now().checked_add(self.config.shutdown_grace);
        let mut drained = 0usize;
        let mut dropped = 0usize;
        while let Ok(event) = self.rx.try_recv() {
            if deadline.is_some_and(|deadline| std::time::Instant::now() > deadline) {
                dropped += 1;
                continue;
            }
            self.ctx.refresh_clock();
            self.dispatch(event);
            drained += 1;
        }
        if dropped > 0 {
            warn!(
                loop_id = %shared.id,
                dropped,
                "shutdown grace elapsed, dropped queued events"
            );
        }

        let abandoned = self.ctx.scheduler.len();
        if abandoned > 0 {
            debug!(loop_id = %shared.id, abandoned, "discarding scheduled tasks");
        }

        self.ctx.refresh_clock();
        self.guarded("on_shutdown", |state, ctx| state.on_shutdown(ctx));

        info!(loop_id = %shared.id, drained, "event loop terminated");
        shared.mark_terminated();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering_and_accepts_work() {
        assert!(LoopStatus::New.accepts_work());
        assert!(LoopStatus::Running.accepts_work());
        assert!(!LoopStatus::ShuttingDown.accepts_work());
        assert!(!LoopStatus::Terminated.accepts_work());
        assert_eq!(LoopStatus::from_u8(LoopStatus::ShuttingDown as u8), LoopStatus::ShuttingDown);
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
