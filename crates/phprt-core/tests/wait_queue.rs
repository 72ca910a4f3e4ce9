// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Wait queues: completion-order fan-in, exhaustion, timeouts, and
//! waiting from inside a resumable.

use std::collections::HashSet;
use std::task::Poll;
use std::time::{Duration, Instant};

use phprt_core::{
    fork, fork_external, fork_result, from_fn, init_script, register_timer, resolve_fork, start, stats,
    wait_queue_create, wait_queue_create_from, wait_queue_destroy, wait_queue_is_empty, wait_queue_next,
    wait_queue_push, EngineError, Failure, ForkId, ResumeCx, Storage,
};

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    init_script();
}

/// External tasks resolved by timers in the given order, 2ms apart.
fn resolved_in_order(order: &[usize]) -> Vec<ForkId> {
    let ids: Vec<ForkId> = (0..order.len()).map(|_| fork_external()).collect();
    let now = Instant::now();
    for (rank, &index) in order.iter().enumerate() {
        let id = ids[index];
        register_timer(now + Duration::from_millis(2 * (rank as u64 + 1)), move || {
            resolve_fork(id, Storage::value(index)).unwrap();
        });
    }
    ids
}

#[test]
fn next_follows_completion_order_then_exhausts() {
    setup();
    let order = [3, 1, 4, 0, 2];
    let ids = resolved_in_order(&order);
    let queue = wait_queue_create_from(&ids);
    assert_eq!(wait_queue_is_empty(queue), Ok(false));

    let mut seen = Vec::new();
    while let Some(id) = wait_queue_next(queue, Some(Duration::from_secs(5))).unwrap() {
        seen.push(fork_result::<usize>(id).unwrap());
    }
    assert_eq!(seen, order);
    assert_eq!(wait_queue_is_empty(queue), Ok(true));
    assert_eq!(wait_queue_next(queue, None), Ok(None));

    for id in ids {
        assert_eq!(fork_result::<usize>(id), Err(EngineError::AlreadyGotten(id)));
    }
    wait_queue_destroy(queue).unwrap();
    assert_eq!(stats().live_queues, 0);
}

#[test]
fn every_task_comes_out_exactly_once_for_any_order() {
    for order in [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]] {
        setup();
        let ids = resolved_in_order(&order);
        let queue = wait_queue_create_from(&ids);

        let mut distinct = HashSet::new();
        for _ in 0..ids.len() {
            let id = wait_queue_next(queue, None).unwrap().expect("queue exhausted early");
            assert!(distinct.insert(id));
            fork_result::<usize>(id).unwrap();
        }
        assert_eq!(wait_queue_next(queue, None), Ok(None));
        wait_queue_destroy(queue).unwrap();
    }
}

#[test]
fn already_finished_tasks_are_returned_first() {
    setup();
    let late = fork_external();
    let done = fork(from_fn(|_cx| Poll::Ready(Ok::<_, Failure>(1usize))));
    let queue = wait_queue_create();
    wait_queue_push(queue, late).unwrap();
    wait_queue_push(queue, done).unwrap();

    assert_eq!(wait_queue_next(queue, Some(Duration::ZERO)), Ok(Some(done)));
    assert_eq!(wait_queue_next(queue, Some(Duration::ZERO)), Ok(None));
    assert_eq!(wait_queue_is_empty(queue), Ok(false));
}

#[test]
fn next_times_out_and_the_queue_stays_usable() {
    setup();
    let task = fork_external();
    let queue = wait_queue_create_from(&[task]);

    let started = Instant::now();
    assert_eq!(wait_queue_next(queue, Some(Duration::from_millis(20))), Ok(None));
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(stats().pending_timers, 0);

    resolve_fork(task, Storage::value(5usize)).unwrap();
    assert_eq!(wait_queue_next(queue, Some(Duration::from_millis(20))), Ok(Some(task)));
    assert_eq!(fork_result::<usize>(task), Ok(5));
}

#[test]
fn task_can_be_on_one_queue_only() {
    setup();
    let task = fork_external();
    let first = wait_queue_create_from(&[task]);
    let second = wait_queue_create();
    assert_eq!(wait_queue_push(second, task), Err(EngineError::AlreadyWaited(task)));

    // Destroying the owner makes the task free again.
    wait_queue_destroy(first).unwrap();
    assert_eq!(wait_queue_push(second, task), Ok(()));
    assert_eq!(wait_queue_push(first, task), Err(EngineError::UnknownQueue(first)));
}

#[test]
fn create_from_skips_invalid_ids() {
    setup();
    let good = fork_external();
    let gone = fork(from_fn(|_cx| Poll::Ready(Ok::<_, Failure>(0usize))));
    fork_result::<usize>(gone).unwrap();

    let queue = wait_queue_create_from(&[good, gone]);
    resolve_fork(good, Storage::value(1usize)).unwrap();
    assert_eq!(wait_queue_next(queue, None), Ok(Some(good)));
    assert_eq!(wait_queue_next(queue, None), Ok(None));
}

#[test]
fn resumable_drains_queue_while_tasks_finish() {
    setup();
    let order = [1, 2, 0];
    let ids = resolved_in_order(&order);
    let queue = wait_queue_create_from(&ids);

    let mut collected = Vec::new();
    let mut waiting = false;
    let out = start(from_fn(move |cx: &mut ResumeCx| loop {
        let next = if waiting {
            waiting = false;
            match cx.input::<Option<ForkId>>() {
                Poll::Ready(next) => next?,
                Poll::Pending => return Poll::Pending,
            }
        } else {
            match cx.wait_queue_next(queue, None) {
                Poll::Ready(next) => next.map_err(|err| Failure::new(-1, err.to_string()))?,
                Poll::Pending => {
                    waiting = true;
                    return Poll::Pending;
                }
            }
        };
        match next {
            Some(id) => {
                let value = fork_result::<usize>(id).map_err(|err| Failure::new(-1, err.to_string()))?;
                collected.push(value);
            }
            None => return Poll::Ready(Ok(std::mem::take(&mut collected))),
        }
    }));
    assert_eq!(out, Ok(vec![1, 2, 0]));
}

#[test]
fn second_queue_waiter_is_rejected() {
    setup();
    let task = fork_external();
    let queue = wait_queue_create_from(&[task]);

    let mut parked = false;
    let waiter = fork(from_fn(move |cx: &mut ResumeCx| {
        if parked {
            return cx.input::<Option<ForkId>>();
        }
        parked = true;
        match cx.wait_queue_next(queue, None) {
            Poll::Ready(next) => Poll::Ready(next.map_err(|err| Failure::new(-1, err.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }));
    assert_eq!(
        wait_queue_next(queue, Some(Duration::ZERO)),
        Err(EngineError::QueueAlreadyWaited(queue))
    );

    resolve_fork(task, Storage::Void).unwrap();
    assert_eq!(fork_result::<Option<ForkId>>(waiter), Ok(Some(task)));
}
