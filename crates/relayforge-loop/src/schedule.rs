//! Delayed tasks: cancellable handles and the per-loop deadline queue.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::{LoopContext, LoopState, Task};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Roughly 30 years. Deadlines past this are treated as "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + delay`, saturating at a far-future instant instead of
/// overflowing. `Duration::MAX` is a valid way to ask for no deadline.
pub fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay.min(FAR_FUTURE))
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Handle to a scheduled task.
///
/// Cancelling and firing race on one atomic: whichever moves the task out
/// of "pending" first wins, so a task is never both cancelled and run.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
    deadline: Instant,
}

impl TaskHandle {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
            deadline,
        }
    }

    /// Cancels the task.
    ///
    /// Returns `true` if the task is now guaranteed never to run, `false`
    /// if it already ran (or was already cancelled).
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the task for execution. Only the worker calls this.
    pub(crate) fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether the task has started running.
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// When the task is due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("TaskHandle")
            .field("state", &state)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// A task waiting for its deadline.
pub struct ScheduledTask<S: LoopState> {
    pub(crate) handle: TaskHandle,
    pub(crate) task: Task<S>,
}

impl<S: LoopState> ScheduledTask<S> {
    pub(crate) fn new(
        deadline: Instant,
        task: impl FnOnce(&mut S, &mut LoopContext<S>) + Send + 'static,
    ) -> (Self, TaskHandle) {
        let handle = TaskHandle::new(deadline);
        let scheduled = Self {
            handle: handle.clone(),
            task: Box::new(task),
        };
        (scheduled, handle)
    }

    pub fn deadline(&self) -> Instant {
        self.handle.deadline
    }
}

/// Deadline-ordered set of tasks owned by one worker.
///
/// Keyed by `(deadline, insertion number)` so equal deadlines run in the
/// order they were scheduled.
pub(crate) struct Scheduler<S: LoopState> {
    entries: BTreeMap<(Instant, u64), ScheduledTask<S>>,
    next_insertion: u64,
}

impl<S: LoopState> Scheduler<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_insertion: 0,
        }
    }

    pub(crate) fn insert(&mut self, task: ScheduledTask<S>) {
        let key = (task.deadline(), self.next_insertion);
        self.next_insertion += 1;
        self.entries.insert(key, task);
    }

    /// Removes and returns the earliest task due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<ScheduledTask<S>> {
        let (&(deadline, _), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.entries.pop_first().map(|(_, task)| task)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(&(deadline, _), _)| deadline)
    }

    /// Drops entries whose handles were cancelled. Returns how many.
    pub(crate) fn purge_cancelled(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, task| !task.handle.is_cancelled());
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl LoopState for Noop {
        type Message = ();
        fn on_message(&mut self, _ctx: &mut LoopContext<Self>, _msg: ()) {}
    }

    fn task(deadline: Instant) -> (ScheduledTask<Noop>, TaskHandle) {
        ScheduledTask::new(deadline, |_, _| {})
    }

    #[test]
    fn test_deadline_after_duration_max_saturates() {
        let now = Instant::now();
        let deadline = deadline_after(now, Duration::MAX);
        assert!(deadline > now + Duration::from_secs(86_400 * 365));
        assert_eq!(deadline, deadline_after(now, FAR_FUTURE * 2));
    }

    #[test]
    fn test_deadline_after_small_delay_is_exact() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_millis(5)), now + Duration::from_millis(5));
    }

    #[test]
    fn test_cancel_before_fire_wins() {
        let handle = TaskHandle::new(Instant::now());
        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.try_fire(), "cancelled task must never fire");
    }

    #[test]
    fn test_fire_before_cancel_wins() {
        let handle = TaskHandle::new(Instant::now());
        assert!(handle.try_fire());
        assert!(!handle.cancel(), "cancel after fire must report failure");
        assert!(handle.has_fired());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = TaskHandle::new(Instant::now());
        assert!(handle.cancel());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_pop_due_respects_deadline_then_insertion_order() {
        let base = Instant::now();
        let mut sched = Scheduler::<Noop>::new();

        let (late, late_h) = task(base + Duration::from_millis(30));
        let (tie_a, tie_a_h) = task(base + Duration::from_millis(10));
        let (tie_b, tie_b_h) = task(base + Duration::from_millis(10));
        sched.insert(late);
        sched.insert(tie_a);
        sched.insert(tie_b);

        assert_eq!(sched.next_deadline(), Some(base + Duration::from_millis(10)));
        assert!(sched.pop_due(base).is_none(), "nothing is due yet");

        let now = base + Duration::from_millis(50);
        let first = sched.pop_due(now).unwrap();
        let second = sched.pop_due(now).unwrap();
        let third = sched.pop_due(now).unwrap();
        assert!(Arc::ptr_eq(&first.handle.state, &tie_a_h.state));
        assert!(Arc::ptr_eq(&second.handle.state, &tie_b_h.state));
        assert!(Arc::ptr_eq(&third.handle.state, &late_h.state));
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn test_purge_cancelled_drops_only_cancelled() {
        let base = Instant::now();
        let mut sched = Scheduler::<Noop>::new();
        let (a, a_h) = task(base);
        let (b, _b_h) = task(base);
        sched.insert(a);
        sched.insert(b);

        a_h.cancel();
        assert_eq!(sched.purge_cancelled(), 1);
        assert_eq!(sched.len(), 1);
    }
}
