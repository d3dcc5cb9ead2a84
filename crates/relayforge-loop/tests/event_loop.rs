//! Integration tests for event loops and loop groups.
//!
//! Loops run on their own worker threads, so these are plain `#[test]`s
//! that observe the workers through shared recorders and poll with a
//! deadline instead of sleeping a fixed amount.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use relayforge_loop::{
    Event, EventLoop, EventLoopGroup, Executor, LoopConfig, LoopContext, LoopError, LoopId,
    LoopState, LoopStatus, RejectReason, current_loop,
};

// =========================================================================
// Helpers
// =========================================================================

/// Records every message it sees, in dispatch order.
#[derive(Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
    sweeps: Arc<AtomicUsize>,
}

impl LoopState for Recorder {
    type Message = u32;

    fn on_message(&mut self, _ctx: &mut LoopContext<Self>, msg: u32) {
        if msg == u32::MAX {
            panic!("poison message");
        }
        self.seen.lock().unwrap().push(msg);
    }

    fn on_sweep(&mut self, _ctx: &mut LoopContext<Self>) {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> LoopConfig {
    LoopConfig {
        sweep_interval: Duration::from_millis(5),
        shutdown_grace: Duration::from_secs(2),
        ..LoopConfig::default()
    }
}

fn started(id: usize, config: LoopConfig) -> (EventLoop<Recorder>, Arc<Mutex<Vec<u32>>>, Arc<AtomicUsize>) {
    let recorder = Recorder::default();
    let seen = Arc::clone(&recorder.seen);
    let sweeps = Arc::clone(&recorder.sweeps);
    let event_loop = EventLoop::new(LoopId(id), config, recorder);
    event_loop.start().expect("loop should start");
    (event_loop, seen, sweeps)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

// =========================================================================
// Ordering
// =========================================================================

#[test]
fn test_execute_dispatches_in_fifo_order() {
    let (event_loop, seen, _) = started(0, fast_config());
    let handle = event_loop.handle();

    for i in 0..500 {
        handle.send(i).expect("should accept");
    }

    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 500));
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..500).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_producers_keep_per_producer_order() {
    let (event_loop, seen, _) = started(0, fast_config());

    let producers: Vec<_> = (0..4u32)
        .map(|p| {
            let handle = event_loop.handle();
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    handle.send(p * 1_000 + i).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 800));
    let seen = seen.lock().unwrap();
    for p in 0..4u32 {
        let mine: Vec<u32> = seen.iter().copied().filter(|v| v / 1_000 == p).collect();
        assert_eq!(mine, (0..200).map(|i| p * 1_000 + i).collect::<Vec<_>>());
    }
}

#[test]
fn test_events_submitted_before_start_run_after_start() {
    let recorder = Recorder::default();
    let seen = Arc::clone(&recorder.seen);
    let event_loop = EventLoop::new(LoopId(0), fast_config(), recorder);
    assert_eq!(event_loop.status(), LoopStatus::New);

    event_loop.handle().send(7).unwrap();
    event_loop.start().unwrap();

    assert!(wait_until(Duration::from_secs(1), || *seen.lock().unwrap() == vec![7]));
    assert_eq!(event_loop.status(), LoopStatus::Running);
}

// =========================================================================
// Confinement
// =========================================================================

#[test]
fn test_tasks_run_on_the_owning_worker() {
    let (event_loop, _, _) = started(3, fast_config());
    let (tx, rx) = mpsc::channel();

    event_loop
        .handle()
        .execute_task(move |_state, ctx| {
            tx.send((current_loop(), ctx.id(), ctx.handle().in_loop())).unwrap();
        })
        .unwrap();

    let (current, ctx_id, in_loop) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(current, Some(LoopId(3)));
    assert_eq!(ctx_id, LoopId(3));
    assert!(in_loop);
    assert_eq!(current_loop(), None, "test thread is not a worker");
    assert!(!event_loop.handle().in_loop());
}

// =========================================================================
// Failure isolation
// =========================================================================

#[test]
fn test_handler_panic_does_not_stop_the_loop() {
    let (event_loop, seen, _) = started(0, fast_config());
    let handle = event_loop.handle();

    handle.send(1).unwrap();
    handle.send(u32::MAX).unwrap();
    handle.send(2).unwrap();

    assert!(wait_until(Duration::from_secs(1), || seen.lock().unwrap().len() == 2));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert!(wait_until(Duration::from_secs(1), || handle.metrics().failures == 1));
    assert_eq!(handle.status(), LoopStatus::Running);
}

// =========================================================================
// Scheduling
// =========================================================================

#[test]
fn test_scheduled_tasks_run_in_deadline_order() {
    let (event_loop, seen, _) = started(0, fast_config());
    let handle = event_loop.handle();

    handle
        .schedule(Duration::from_millis(60), |s: &mut Recorder, _| s.seen.lock().unwrap().push(3))
        .unwrap();
    handle
        .schedule(Duration::from_millis(20), |s: &mut Recorder, _| s.seen.lock().unwrap().push(1))
        .unwrap();
    handle
        .schedule(Duration::from_millis(40), |s: &mut Recorder, _| s.seen.lock().unwrap().push(2))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 3));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_equal_deadlines_run_in_insertion_order() {
    let (event_loop, seen, _) = started(0, fast_config());

    event_loop
        .handle()
        .execute_task(|_state, ctx: &mut LoopContext<Recorder>| {
            let at = ctx.now() + Duration::from_millis(20);
            for label in [10, 20, 30, 40] {
                ctx.schedule_at(at, move |s: &mut Recorder, _| s.seen.lock().unwrap().push(label));
            }
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 4));
    assert_eq!(*seen.lock().unwrap(), vec![10, 20, 30, 40]);
}

#[test]
fn test_scheduled_task_does_not_fire_early() {
    let (event_loop, _, _) = started(0, fast_config());
    let (tx, rx) = mpsc::channel();
    let issued = Instant::now();

    event_loop
        .handle()
        .schedule(Duration::from_millis(50), move |_, _| tx.send(Instant::now()).unwrap())
        .unwrap();

    let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(fired.duration_since(issued) >= Duration::from_millis(50));
}

#[test]
fn test_cancelled_task_never_runs() {
    let (event_loop, seen, _) = started(0, fast_config());
    let handle = event_loop.handle();

    let task = handle
        .schedule(Duration::from_millis(30), |s: &mut Recorder, _| s.seen.lock().unwrap().push(99))
        .unwrap();
    assert!(task.cancel(), "cancel before the deadline must succeed");

    // A later marker proves the deadline has passed.
    handle
        .schedule(Duration::from_millis(80), |s: &mut Recorder, _| s.seen.lock().unwrap().push(1))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()));
    assert_eq!(*seen.lock().unwrap(), vec![1]);
    assert!(!task.has_fired());
}

#[test]
fn test_schedule_with_duration_max_never_fires() {
    let (event_loop, seen, _) = started(0, fast_config());
    let handle = event_loop.handle();

    let never = handle
        .schedule(Duration::MAX, |s: &mut Recorder, _| s.seen.lock().unwrap().push(99))
        .expect("an unbounded delay is valid");
    handle
        .schedule(Duration::from_millis(20), |s: &mut Recorder, _| s.seen.lock().unwrap().push(1))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()));
    assert_eq!(*seen.lock().unwrap(), vec![1]);
    assert!(never.cancel(), "the far-future task is still pending");
}

#[test]
fn test_cancel_after_fire_reports_false() {
    let (event_loop, seen, _) = started(0, fast_config());
    let task = event_loop
        .handle()
        .schedule(Duration::from_millis(5), |s: &mut Recorder, _| s.seen.lock().unwrap().push(5))
        .unwrap();

    assert!(wait_until(Duration::from_secs(1), || seen.lock().unwrap().len() == 1));
    assert!(!task.cancel());
    assert!(task.has_fired());
}

#[test]
fn test_sweep_runs_periodically() {
    let (_event_loop, _, sweeps) = started(0, fast_config());
    assert!(wait_until(Duration::from_secs(1), || sweeps.load(Ordering::SeqCst) >= 3));
}

// =========================================================================
// Executor
// =========================================================================

#[test]
fn test_executor_runs_jobs_on_the_loop() {
    let (event_loop, _, _) = started(2, fast_config());
    let executor: Arc<dyn Executor> = Arc::new(event_loop.handle());
    let (tx, rx) = mpsc::channel();

    assert_eq!(executor.loop_id(), LoopId(2));
    executor
        .execute_job(Box::new(move || tx.send(current_loop()).unwrap()))
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(LoopId(2)));
}

// =========================================================================
// Backpressure and shutdown
// =========================================================================

#[test]
fn test_full_queue_rejects_with_queue_full() {
    let config = LoopConfig {
        queue_capacity: 1,
        ..fast_config()
    };
    let (event_loop, seen, _) = started(0, config);
    let handle = event_loop.handle();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    handle
        .execute_task(move |_, _| {
            entered_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
    entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();

    handle.send(1).expect("one slot is free");
    let err = handle.send(2).unwrap_err();
    assert_eq!(
        err,
        LoopError::Rejected {
            loop_id: LoopId(0),
            reason: RejectReason::QueueFull,
        }
    );

    release_tx.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || *seen.lock().unwrap() == vec![1]));
    assert!(handle.metrics().rejected >= 1);
}

#[test]
fn test_shutdown_drains_queue_then_rejects() {
    let (event_loop, seen, _) = started(0, fast_config());
    let handle = event_loop.handle();

    for i in 0..50 {
        handle.send(i).unwrap();
    }
    event_loop.shutdown();

    let err = handle.send(1_000).unwrap_err();
    assert!(matches!(err, LoopError::Rejected { .. }));

    assert!(event_loop.await_termination(Duration::from_secs(2)));
    assert_eq!(event_loop.status(), LoopStatus::Terminated);
    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());

    let err = handle.send(1_001).unwrap_err();
    assert_eq!(
        err,
        LoopError::Rejected {
            loop_id: LoopId(0),
            reason: RejectReason::Terminated,
        }
    );
}

#[test]
fn test_shutdown_before_start_terminates_immediately() {
    let event_loop = EventLoop::new(LoopId(0), fast_config(), Recorder::default());
    event_loop.shutdown();

    assert_eq!(event_loop.status(), LoopStatus::Terminated);
    assert!(event_loop.await_termination(Duration::from_millis(10)));
    assert!(event_loop.start().is_err());
}

#[test]
fn test_shutdown_is_idempotent() {
    let (event_loop, _, _) = started(0, fast_config());
    event_loop.shutdown();
    event_loop.shutdown();
    assert!(event_loop.await_termination(Duration::from_secs(2)));
}

#[test]
fn test_scheduling_after_shutdown_is_rejected() {
    let (event_loop, _, _) = started(0, fast_config());
    let handle = event_loop.handle();
    event_loop.shutdown();
    assert!(event_loop.await_termination(Duration::from_secs(2)));

    let result = handle.schedule(Duration::from_millis(1), |_: &mut Recorder, _| {});
    assert!(matches!(result, Err(LoopError::Rejected { .. })));
}

#[test]
fn test_job_events_run_without_state() {
    let (event_loop, _, _) = started(0, fast_config());
    let (tx, rx) = mpsc::channel();
    event_loop
        .handle()
        .execute(Event::job(move || tx.send(42).unwrap()))
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
}

// =========================================================================
// EventLoopGroup
// =========================================================================

fn group(size: usize, config: LoopConfig) -> EventLoopGroup<Recorder> {
    EventLoopGroup::new(size, config, |_| Recorder::default()).expect("group should start")
}

#[test]
fn test_group_next_is_round_robin() {
    let group = group(3, fast_config());
    let ids: Vec<LoopId> = (0..6).map(|_| group.next().id()).collect();
    assert_eq!(
        ids,
        vec![LoopId(0), LoopId(1), LoopId(2), LoopId(0), LoopId(1), LoopId(2)]
    );
    group.terminate().unwrap();
}

#[test]
fn test_group_next_for_is_sticky_per_key() {
    let group = group(4, fast_config());
    for key in ["scene-1", "login-2", "center"] {
        let first = group.next_for(key).id();
        for _ in 0..10 {
            assert_eq!(group.next_for(key).id(), first);
        }
    }
    group.terminate().unwrap();
}

#[test]
fn test_group_size_zero_is_bumped_to_one() {
    let group = group(0, fast_config());
    assert_eq!(group.len(), 1);
    group.terminate().unwrap();
}

#[test]
fn test_group_terminate_rejects_later_work() {
    let group = group(2, fast_config());
    let handles: Vec<_> = group.handles().collect();
    group.terminate().expect("all loops stop in time");

    for handle in handles {
        assert_eq!(handle.status(), LoopStatus::Terminated);
        assert!(handle.send(1).is_err());
    }
}

#[test]
fn test_group_terminate_reports_stuck_loops() {
    let config = LoopConfig {
        shutdown_grace: Duration::from_millis(50),
        ..fast_config()
    };
    let group = group(2, config);

    let (entered_tx, entered_rx) = mpsc::channel();
    group
        .get(1)
        .unwrap()
        .execute_task(move |_, _| {
            entered_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        })
        .unwrap();
    entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();

    let err = group.terminate().unwrap_err();
    assert_eq!(err, LoopError::GroupTermination { failed: vec![LoopId(1)] });
}
