//! RPC futures: single-assignment results with loop-affine listeners.
//!
//! [`promise`] creates a connected pair. The engine keeps the
//! [`Promise`] and resolves it exactly once; callers hold the
//! [`RpcFuture`] and observe the outcome by
//!
//! - `.await`ing it (it implements [`Future`]),
//! - registering a listener with [`RpcFuture::add_listener`], or
//! - blocking on [`RpcFuture::wait`] from a thread that is *not* the
//!   owning loop.
//!
//! Listeners registered before resolution are not run on the resolving
//! thread. They are handed to the owning loop's [`Executor`] as one job,
//! so they run on the loop in registration order. If the loop refuses the
//! job (it is shutting down), they run inline instead of being lost.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use relayforge_loop::{Executor, LoopId, is_current};
use tracing::{debug, trace, warn};

use crate::SessionError;

/// What an RPC future resolves to.
pub type Outcome<T> = Result<T, SessionError>;

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

enum Slot<T> {
    Pending {
        listeners: Vec<Listener<T>>,
        wakers: Vec<Waker>,
    },
    Done(Arc<Outcome<T>>),
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    resolved: Condvar,
    executor: Option<Arc<dyn Executor>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// Stores the outcome if none is stored yet. On conflict, returns the
    /// outcome that won.
    fn resolve(&self, outcome: Outcome<T>) -> Result<(), Arc<Outcome<T>>> {
        let done = Arc::new(outcome);
        let (listeners, wakers) = {
            let mut slot = self.lock();
            if let Slot::Done(existing) = &*slot {
                return Err(Arc::clone(existing));
            }
            match mem::replace(&mut *slot, Slot::Done(Arc::clone(&done))) {
                Slot::Pending { listeners, wakers } => (listeners, wakers),
                Slot::Done(_) => (Vec::new(), Vec::new()),
            }
        };

        self.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
        self.dispatch(listeners, done);
        Ok(())
    }

    fn dispatch(&self, listeners: Vec<Listener<T>>, done: Arc<Outcome<T>>) {
        if listeners.is_empty() {
            return;
        }
        let job = move || {
            for listener in listeners {
                listener(&done);
            }
        };
        match &self.executor {
            Some(executor) => {
                if let Err(rejected) = executor.execute_job(Box::new(job)) {
                    warn!(
                        error = %rejected.error,
                        "owning loop refused future listeners, running them inline"
                    );
                    (rejected.job)();
                }
            }
            None => job(),
        }
    }
}

/// Creates an unresolved promise/future pair.
///
/// `executor` is the owning loop; listeners registered before resolution
/// are dispatched to it. With `None`, listeners run on the resolving
/// thread.
pub fn promise<T: Send + Sync + 'static>(
    executor: Option<Arc<dyn Executor>>,
) -> (Promise<T>, RpcFuture<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(Slot::Pending {
            listeners: Vec::new(),
            wakers: Vec::new(),
        }),
        resolved: Condvar::new(),
        executor,
    });
    (
        Promise {
            inner: Arc::clone(&inner),
        },
        RpcFuture { inner },
    )
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

/// The write side of an [`RpcFuture`].
///
/// Dropping an unresolved promise fails its future with
/// [`SessionError::Rejected`], so no caller waits forever on work that
/// was discarded.
pub struct Promise<T: Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Resolves the future. Returns `false` if it was already resolved.
    ///
    /// A second resolution is a bug in the caller and is logged, except
    /// when the first was a cancellation: racing a cancel is expected.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        match self.inner.resolve(outcome) {
            Ok(()) => true,
            Err(existing) => {
                if matches!(*existing, Err(SessionError::Cancelled)) {
                    trace!("promise already cancelled, dropping outcome");
                } else {
                    warn!("promise resolved twice, keeping the first outcome");
                }
                false
            }
        }
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, err: SessionError) -> bool {
        self.complete(Err(err))
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.lock(), Slot::Done(_))
    }

    /// Whether the future was cancelled by its holder.
    pub fn is_cancelled(&self) -> bool {
        match &*self.inner.lock() {
            Slot::Done(outcome) => matches!(**outcome, Err(SessionError::Cancelled)),
            Slot::Pending { .. } => false,
        }
    }

    /// Another read handle on the same outcome.
    pub fn future(&self) -> RpcFuture<T> {
        RpcFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.is_done() {
            return;
        }
        let dropped = SessionError::Rejected("promise dropped before completion".to_string());
        if self.inner.resolve(Err(dropped)).is_ok() {
            debug!("promise dropped unresolved");
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("done", &self.is_done()).finish()
    }
}

// ---------------------------------------------------------------------------
// RpcFuture
// ---------------------------------------------------------------------------

/// The read side of a pending result: a send, a call, or a close.
///
/// Cloning gives another handle on the same outcome.
pub struct RpcFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RpcFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for RpcFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.inner.lock(), Slot::Done(_));
        f.debug_struct("RpcFuture")
            .field("done", &done)
            .field("owner", &self.inner.executor.as_ref().map(|e| e.loop_id()))
            .finish()
    }
}

impl<T: Send + Sync + 'static> RpcFuture<T> {
    /// A future that is already resolved.
    pub fn ready(outcome: Outcome<T>) -> Self {
        let (promise, future) = promise(None);
        promise.complete(outcome);
        future
    }

    /// The loop this future's listeners run on, if any.
    pub fn owner(&self) -> Option<LoopId> {
        self.inner.executor.as_ref().map(|e| e.loop_id())
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.lock(), Slot::Done(_))
    }

    /// The outcome, if resolved. Never blocks.
    pub fn try_outcome(&self) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        match &*self.inner.lock() {
            Slot::Done(outcome) => Some((**outcome).clone()),
            Slot::Pending { .. } => None,
        }
    }

    /// Registers a completion callback.
    ///
    /// Already resolved: runs right now on the calling thread. Otherwise
    /// runs on the owning loop once the future resolves.
    pub fn add_listener(&self, listener: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let done = {
            let mut slot = self.inner.lock();
            match &mut *slot {
                Slot::Pending { listeners, .. } => {
                    listeners.push(Box::new(listener));
                    return;
                }
                Slot::Done(outcome) => Arc::clone(outcome),
            }
        };
        listener(&done);
    }

    /// Resolves the future with [`SessionError::Cancelled`].
    ///
    /// Returns `false` if it had already resolved. The engine notices the
    /// cancellation on its next sweep and drops the pending entry; a
    /// response arriving later is discarded.
    pub fn cancel(&self) -> bool {
        self.inner.resolve(Err(SessionError::Cancelled)).is_ok()
    }

    /// Blocks the calling thread until the future resolves or `timeout`
    /// passes. Returns `None` on timeout.
    ///
    /// # Panics
    /// When called on the future's owning loop: the loop could never
    /// resolve it while blocked, so this would deadlock.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        if let Some(owner) = self.owner() {
            assert!(
                !is_current(owner),
                "RpcFuture::wait called on its owning {owner}; this would deadlock"
            );
        }
        let slot = self.inner.lock();
        let (slot, _timed_out) = self
            .inner
            .resolved
            .wait_timeout_while(slot, timeout, |slot| matches!(slot, Slot::Pending { .. }))
            .unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            Slot::Done(outcome) => Some((**outcome).clone()),
            Slot::Pending { .. } => None,
        }
    }

    /// Maps the successful value once resolved, keeping the same owner.
    pub fn map<U, F>(&self, f: F) -> RpcFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let (mapped, future) = promise(self.inner.executor.clone());
        self.add_listener(move |outcome| {
            mapped.complete(outcome.as_ref().map(f).map_err(Clone::clone));
        });
        future
    }
}

impl<T: Clone + Send + Sync + 'static> Future for RpcFuture<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.inner.lock();
        match &mut *slot {
            Slot::Done(outcome) => Poll::Ready((**outcome).clone()),
            Slot::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    use relayforge_loop::{Job, RejectedJob, enter_loop};

    use super::*;

    /// Records jobs instead of running them, so tests control when
    /// listeners run.
    struct QueueExecutor {
        id: LoopId,
        jobs: Mutex<Vec<Job>>,
        refuse: bool,
    }

    impl QueueExecutor {
        fn new(refuse: bool) -> Arc<Self> {
            Arc::new(Self {
                id: LoopId(9),
                jobs: Mutex::new(Vec::new()),
                refuse,
            })
        }

        fn run_all(&self) -> usize {
            let jobs = mem::take(&mut *self.jobs.lock().unwrap());
            let n = jobs.len();
            for job in jobs {
                job();
            }
            n
        }
    }

    impl Executor for QueueExecutor {
        fn loop_id(&self) -> LoopId {
            self.id
        }

        fn execute_job(&self, job: Job) -> Result<(), RejectedJob> {
            if self.refuse {
                return Err(RejectedJob {
                    job,
                    error: relayforge_loop::LoopError::Rejected {
                        loop_id: self.id,
                        reason: relayforge_loop::RejectReason::Terminated,
                    },
                });
            }
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }

    #[test]
    fn test_complete_twice_keeps_first_outcome() {
        let (promise, future) = promise::<u32>(None);
        assert!(promise.succeed(1));
        assert!(!promise.succeed(2));
        assert_eq!(future.try_outcome(), Some(Ok(1)));
    }

    #[test]
    fn test_cancel_then_complete_is_quietly_ignored() {
        let (promise, future) = promise::<u32>(None);
        assert!(future.cancel());
        assert!(promise.is_cancelled());
        assert!(!promise.succeed(5));
        assert_eq!(future.try_outcome(), Some(Err(SessionError::Cancelled)));
        assert!(!future.cancel(), "second cancel reports already done");
    }

    #[test]
    fn test_listeners_are_dispatched_to_owning_loop_in_order() {
        let exec = QueueExecutor::new(false);
        let (promise, future) = promise::<u32>(Some(exec.clone()));

        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            future.add_listener(move |outcome| {
                order.lock().unwrap().push((tag, outcome.clone()));
            });
        }

        promise.succeed(7);
        assert!(order.lock().unwrap().is_empty(), "listeners must not run on the resolver");

        assert_eq!(exec.run_all(), 1, "all listeners travel as one job");
        assert_eq!(
            *order.lock().unwrap(),
            vec![(0, Ok(7)), (1, Ok(7)), (2, Ok(7))]
        );
    }

    #[test]
    fn test_listener_added_after_resolution_runs_immediately() {
        let exec = QueueExecutor::new(false);
        let (promise, future) = promise::<u32>(Some(exec.clone()));
        promise.succeed(3);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        future.add_listener(move |outcome| {
            assert_eq!(outcome, &Ok(3));
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(exec.run_all(), 0);
    }

    #[test]
    fn test_refused_dispatch_runs_listeners_inline() {
        let exec = QueueExecutor::new(true);
        let (promise, future) = promise::<u32>(Some(exec));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        future.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        promise.fail(SessionError::Cancelled);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "listener must not be lost");
    }

    #[test]
    fn test_wait_returns_outcome_resolved_from_another_thread() {
        let (promise, future) = promise::<String>(None);
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.succeed("pong".to_string());
        });
        assert_eq!(
            future.wait(Duration::from_secs(2)),
            Some(Ok("pong".to_string()))
        );
        resolver.join().unwrap();
    }

    #[test]
    fn test_dropped_promise_fails_future() {
        let (promise, future) = promise::<u32>(None);
        drop(promise);
        assert!(matches!(
            future.try_outcome(),
            Some(Err(SessionError::Rejected(_)))
        ));
    }

    #[test]
    fn test_wait_times_out_when_unresolved() {
        let (_promise, future) = promise::<u32>(None);
        assert_eq!(future.wait(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_wait_on_owning_loop_panics() {
        let exec = QueueExecutor::new(false);
        let (_promise, future) = promise::<u32>(Some(exec));
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _owner = enter_loop(LoopId(9));
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                future.wait(Duration::from_millis(1))
            }));
            tx.send(result.is_err()).unwrap();
        });
        assert!(rx.recv().unwrap(), "wait on the owning loop must panic");
    }

    #[tokio::test]
    async fn test_await_resolves_with_outcome() {
        let (promise, future) = promise::<u32>(None);
        let waiter = tokio::spawn(future);
        tokio::task::yield_now().await;
        promise.succeed(11);
        assert_eq!(waiter.await.unwrap(), Ok(11));
    }

    #[test]
    fn test_map_transforms_success_and_passes_errors() {
        let (promise, future) = promise::<u32>(None);
        let doubled = future.map(|v| v * 2);
        promise.succeed(21);
        assert_eq!(doubled.try_outcome(), Some(Ok(42)));

        let failed = RpcFuture::<u32>::ready(Err(SessionError::Remote("nope".into())));
        assert_eq!(
            failed.map(|v| v + 1).try_outcome(),
            Some(Err(SessionError::Remote("nope".into())))
        );
    }
}
