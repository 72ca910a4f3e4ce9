// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! End-to-end engine behavior: synchronous starts, nested call chains,
//! direct waits with timeouts, yields, failures and script boundaries.
//! Each test runs on its own thread and so gets its own engine.

use std::cell::RefCell;
use std::rc::Rc;
use std::task::{ready, Poll};
use std::time::{Duration, Instant};

use phprt_core::{
    cancel_timer, fork, fork_external, fork_result, fork_running_time, from_fn, init_global, init_script,
    is_fork_finished, register_timer, resolve_fork, run_scheduler, sched_yield, start, stats, teardown_script, wait,
    EngineError, Failure, ForkId, ResumeCx, Resumable, RuntimeConfig, Storage,
};

type Log = Rc<RefCell<Vec<String>>>;

fn setup() -> Log {
    let _ = env_logger::builder().is_test(true).try_init();
    init_script();
    Rc::new(RefCell::new(Vec::new()))
}

fn resolve_after(delay: Duration, id: ForkId, value: u32) {
    register_timer(Instant::now() + delay, move || {
        resolve_fork(id, Storage::value(value)).unwrap();
    });
}

/// Innermost frame: waits on a background dependency, then returns its value.
struct Leaf {
    dep: ForkId,
    log: Log,
    waiting: bool,
}

impl Resumable for Leaf {
    type Output = u32;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<u32, Failure>> {
        self.log.borrow_mut().push("C".into());
        if !self.waiting {
            self.waiting = true;
            match cx.wait(self.dep, None) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(done) => assert_eq!(done, Ok(true)),
            }
        } else {
            assert!(ready!(cx.input::<bool>())?);
        }
        let value = fork_result::<u32>(self.dep).map_err(|err| Failure::new(-1, err.to_string()))?;
        Poll::Ready(Ok(value))
    }
}

/// Calls a child and adds one to its answer.
struct Caller<R> {
    name: &'static str,
    child: Option<R>,
    log: Log,
}

impl<R: Resumable<Output = u32>> Resumable for Caller<R> {
    type Output = u32;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<u32, Failure>> {
        self.log.borrow_mut().push(self.name.into());
        if let Some(child) = self.child.take() {
            let value = ready!(cx.call(child))?;
            return Poll::Ready(Ok(value + 1));
        }
        let value = ready!(cx.input::<u32>())?;
        Poll::Ready(Ok(value + 1))
    }
}

#[test]
fn start_without_suspension_leaves_no_record() {
    setup();
    for i in 0..10u64 {
        assert_eq!(start(from_fn(move |_cx| Poll::Ready(Ok::<_, Failure>(i * 2)))), Ok(i * 2));
    }
    assert_eq!(stats().live_calls, 0);
    assert_eq!(stats().calls_started, 10);
}

#[test]
fn three_deep_chain_resumes_inner_to_outer_once_each() {
    let log = setup();
    let dep = fork_external();
    resolve_after(Duration::from_millis(20), dep, 40);

    let c = Leaf {
        dep,
        log: log.clone(),
        waiting: false,
    };
    let b = Caller {
        name: "B",
        child: Some(c),
        log: log.clone(),
    };
    let a = Caller {
        name: "A",
        child: Some(b),
        log: log.clone(),
    };

    assert_eq!(start(a), Ok(42));
    assert_eq!(*log.borrow(), vec!["A", "B", "C", "C", "B", "A"]);

    let stats = stats();
    assert_eq!(stats.live_calls, 0);
    assert_eq!(stats.live_forks, 0);
    assert!(stats.results_propagated >= 3);
}

#[test]
fn chain_under_a_background_task_finishes_the_task() {
    let log = setup();
    let dep = fork_external();
    let task = fork(Caller {
        name: "B",
        child: Some(Leaf {
            dep,
            log: log.clone(),
            waiting: false,
        }),
        log: log.clone(),
    });
    assert_eq!(is_fork_finished(task), Ok(false));

    resolve_fork(dep, Storage::value(9u32)).unwrap();
    assert_eq!(is_fork_finished(task), Ok(true));
    assert_eq!(fork_result::<u32>(task), Ok(10));
}

#[test]
fn wait_delivered_before_timeout() {
    setup();
    let f = fork_external();
    resolve_after(Duration::from_millis(10), f, 7);

    assert_eq!(wait(f, Some(Duration::from_secs(5))), Ok(true));
    assert_eq!(stats().pending_timers, 0);
    assert_eq!(fork_result::<u32>(f), Ok(7));
    assert_eq!(fork_result::<u32>(f), Err(EngineError::AlreadyGotten(f)));
    assert_eq!(wait(f, Some(Duration::from_secs(1))), Err(EngineError::AlreadyGotten(f)));
}

#[test]
fn wait_times_out_without_late_wakeup() {
    setup();
    let f = fork_external();
    let started = Instant::now();
    assert_eq!(wait(f, Some(Duration::from_millis(30))), Ok(false));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(stats().pending_timers, 0);
    assert_eq!(stats().live_calls, 0);

    // The late answer is kept for whoever asks, nobody is woken.
    resolve_fork(f, Storage::value(1u32)).unwrap();
    assert_eq!(wait(f, Some(Duration::ZERO)), Ok(true));
    assert_eq!(fork_result::<u32>(f), Ok(1));
}

#[test]
fn wait_with_an_enormous_timeout() {
    setup();
    let f = fork_external();
    resolve_after(Duration::from_millis(5), f, 3);

    assert_eq!(wait(f, Some(Duration::MAX)), Ok(true));
    assert_eq!(stats().pending_timers, 0);
    assert_eq!(fork_result::<u32>(f), Ok(3));
}

#[test]
fn wrong_result_type_leaves_the_result_in_place() {
    setup();
    let task = fork(from_fn(|_cx| Poll::Ready(Ok::<_, Failure>(7u32))));
    assert_eq!(fork_result::<String>(task), Err(EngineError::WrongResultType(task)));
    assert_eq!(fork_result::<u32>(task), Ok(7));
}

#[test]
fn zero_timeout_only_checks() {
    setup();
    let f = fork_external();
    assert_eq!(wait(f, Some(Duration::ZERO)), Ok(false));
    assert_eq!(stats().live_calls, 0);
}

#[test]
fn resumable_wait_times_out() {
    setup();
    let f = fork_external();
    let mut waited = false;
    let out = start(from_fn(move |cx: &mut ResumeCx| {
        if !waited {
            waited = true;
            if let Poll::Ready(done) = cx.wait(f, Some(Duration::from_millis(10))) {
                return Poll::Ready(done.map_err(|err| Failure::new(-1, err.to_string())));
            }
            return Poll::Pending;
        }
        cx.input::<bool>()
    }));
    assert_eq!(out, Ok(false));
    assert_eq!(is_fork_finished(f), Ok(false));
}

#[test]
fn failure_surfaces_where_the_result_is_consumed() {
    setup();
    let failing = fork(from_fn(|_cx| Poll::Ready(Err::<u32, _>(Failure::new(5, "bad input")))));
    assert_eq!(is_fork_finished(failing), Ok(true));
    assert_eq!(
        fork_result::<u32>(failing),
        Err(EngineError::Failed(Failure::new(5, "bad input")))
    );

    let out = start(from_fn(|cx: &mut ResumeCx| {
        let inner = ready!(cx.call(from_fn(|_cx| Poll::Ready(Err::<u32, _>(Failure::new(6, "deep"))))));
        Poll::Ready(inner.map(|v| v + 1))
    }));
    assert_eq!(out, Err(Failure::new(6, "deep")));
}

#[test]
fn yields_round_robin_between_tasks() {
    let log = setup();
    let spawn = |name: &'static str| {
        let log = log.clone();
        let mut step = 0u32;
        fork(from_fn(move |cx: &mut ResumeCx| {
            log.borrow_mut().push(format!("{}:{}", name, step));
            if step == 2 {
                return Poll::Ready(Ok::<_, Failure>(step));
            }
            step += 1;
            let _ = cx.sched_yield(Duration::ZERO);
            Poll::Pending
        }))
    };
    let first = spawn("x");
    let second = spawn("y");

    assert_eq!(wait(second, None), Ok(true));
    assert_eq!(*log.borrow(), vec!["x:0", "y:0", "x:1", "y:1", "x:2", "y:2"]);
    assert_eq!(fork_result::<u32>(first), Ok(2));
    assert_eq!(fork_result::<u32>(second), Ok(2));
}

#[test]
fn delayed_yield_resumes_after_delay() {
    setup();
    let started = Instant::now();
    let mut yielded = false;
    let task = fork(from_fn(move |cx: &mut ResumeCx| {
        if yielded {
            return Poll::Ready(Ok::<_, Failure>(()));
        }
        yielded = true;
        let _ = cx.sched_yield(Duration::from_millis(25));
        Poll::Pending
    }));
    assert_eq!(wait(task, Some(Duration::from_secs(5))), Ok(true));
    assert!(started.elapsed() >= Duration::from_millis(25));
}

#[test]
fn main_thread_yield_runs_timers() {
    setup();
    let fired = Rc::new(RefCell::new(0));
    let counter = fired.clone();
    register_timer(Instant::now() + Duration::from_millis(5), move || *counter.borrow_mut() += 1);
    let cancelled = register_timer(Instant::now() + Duration::from_millis(5), || panic!("cancelled timer fired"));
    assert!(cancel_timer(cancelled));

    sched_yield(Duration::from_millis(20));
    assert_eq!(*fired.borrow(), 1);
    assert!(!cancel_timer(cancelled));
    assert_eq!(stats().timers_fired, 1);
}

#[test]
fn running_time_is_accounted_per_task() {
    setup();
    let task = fork(from_fn(|_cx| {
        std::thread::sleep(Duration::from_millis(5));
        Poll::Ready(Ok::<_, Failure>(()))
    }));
    assert!(fork_running_time(task).unwrap() >= Duration::from_millis(5));
}

#[test]
fn small_budget_still_drains_everything() {
    setup();
    init_global(RuntimeConfig {
        scheduler_budget: 1,
        ..RuntimeConfig::default()
    });
    let deps: Vec<ForkId> = (0..5).map(|_| fork_external()).collect();
    let tasks: Vec<ForkId> = deps
        .iter()
        .map(|&dep| {
            let mut waiting = false;
            fork(from_fn(move |cx: &mut ResumeCx| {
                if !waiting {
                    waiting = true;
                    let _ = cx.wait(dep, None);
                    return Poll::Pending;
                }
                cx.input::<bool>()
            }))
        })
        .collect();

    for (i, &dep) in deps.iter().enumerate() {
        resolve_after(Duration::from_millis(1 + i as u64), dep, i as u32);
    }
    for &task in &tasks {
        assert_eq!(wait(task, Some(Duration::from_secs(5))), Ok(true));
        assert_eq!(fork_result::<bool>(task), Ok(true));
    }
}

#[test]
fn zero_budget_from_json_still_delivers_results() {
    setup();
    init_global(RuntimeConfig::from_json_str(r#"{ "scheduler_budget": 0 }"#).unwrap());
    let dep = fork_external();
    let mut waiting = false;
    let task = fork(from_fn(move |cx: &mut ResumeCx| {
        if !waiting {
            waiting = true;
            let _ = cx.wait(dep, None);
            return Poll::Pending;
        }
        cx.input::<bool>()
    }));

    resolve_after(Duration::from_millis(2), dep, 1);
    assert_eq!(wait(task, Some(Duration::from_secs(5))), Ok(true));
    assert_eq!(fork_result::<bool>(task), Ok(true));
}

#[test]
fn chain_propagation_is_not_charged_to_the_budget() {
    let log = setup();
    init_global(RuntimeConfig {
        scheduler_budget: 1,
        ..RuntimeConfig::default()
    });
    let dep = fork_external();
    let task = fork(Caller {
        name: "A",
        child: Some(Caller {
            name: "B",
            child: Some(Leaf {
                dep,
                log: log.clone(),
                waiting: false,
            }),
            log: log.clone(),
        }),
        log: log.clone(),
    });

    let before = stats().scheduler_iterations;
    resolve_fork(dep, Storage::value(40u32)).unwrap();
    assert_eq!(stats().scheduler_iterations - before, 1);
    assert_eq!(is_fork_finished(task), Ok(true));
    assert_eq!(fork_result::<u32>(task), Ok(42));
    assert_eq!(*log.borrow(), vec!["A", "B", "C", "C", "B", "A"]);
}

#[test]
fn scheduler_stops_at_its_deadline() {
    setup();
    let tasks: Vec<ForkId> = (0..3)
        .map(|_| {
            let mut yielded = false;
            fork(from_fn(move |cx: &mut ResumeCx| {
                if yielded {
                    return Poll::Ready(Ok::<_, Failure>(()));
                }
                yielded = true;
                let _ = cx.sched_yield(Duration::ZERO);
                Poll::Pending
            }))
        })
        .collect();
    let finished = || tasks.iter().filter(|&&t| is_fork_finished(t) == Ok(true)).count();
    assert_eq!(finished(), 0);

    assert!(!run_scheduler(Some(Instant::now())));
    assert_eq!(finished(), 1);

    assert!(!run_scheduler(None));
    assert_eq!(finished(), 3);
}

#[test]
fn ids_from_a_previous_script_are_expired() {
    let log = setup();
    let unretrieved = fork_external();
    let in_flight = fork(Leaf {
        dep: unretrieved,
        log,
        waiting: false,
    });
    assert_eq!(stats().live_calls, 1);

    teardown_script();
    init_script();

    assert_eq!(stats().live_calls, 0);
    assert_eq!(stats().live_forks, 0);
    assert_eq!(
        fork_result::<u32>(unretrieved),
        Err(EngineError::ExpiredFork(unretrieved))
    );
    assert_eq!(wait(in_flight, None), Err(EngineError::ExpiredFork(in_flight)));

    let fresh = fork_external();
    assert!(fresh.generation() > in_flight.generation());
}
