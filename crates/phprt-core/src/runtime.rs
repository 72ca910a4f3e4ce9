// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The engine: process-global tables, execution of resumables, and the
//! main-thread API.
//!
//! All engine state lives in one thread-local [`Engine`] behind a
//! `RefCell`. The borrow is never held while user code runs: continuations
//! are taken out of their record before `resume()` and put back after.

use std::any::type_name;
use std::cell::RefCell;
use std::task::Poll;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::error::{EngineError, Failure};
use crate::forked::{ForkedRecord, ForkedTable};
use crate::id::{CallId, ForkId, Frame, QueueId};
use crate::resumable::{BoxContinuation, ResumeCx, Resumable};
use crate::scheduler::{run_scheduler, ReadyQueues};
use crate::started::{RecordKind, StartedRecord, StartedTable};
use crate::storage::Storage;
use crate::timer::{deadline_after, TimerAction, TimerId, TimerQueue};
use crate::wait::{Parked, Wake, WakeReason};
use crate::wait_queue::WaitQueueTable;

/// The network layer as seen by a blocked synchronous wait.
pub trait NetworkPoller {
    /// Wait up to `timeout` for network events and dispatch them.
    /// Returns true if anything happened.
    fn poll_network(&mut self, timeout: Duration) -> bool;

    /// Nothing is outstanding, so polling cannot make progress.
    fn is_idle(&self) -> bool {
        false
    }

    /// The script ended; forget requests issued by it.
    fn reset(&mut self) {}
}

/// Per-script counters plus current table occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub calls_started: u64,
    pub forks_started: u64,
    pub queues_created: u64,
    pub scheduler_iterations: u64,
    pub results_propagated: u64,
    pub timers_fired: u64,
    pub live_calls: usize,
    pub live_forks: usize,
    pub live_queues: usize,
    pub pending_timers: usize,
}

pub(crate) struct Engine {
    pub config: RuntimeConfig,
    pub started: StartedTable,
    pub forked: ForkedTable,
    pub queues: WaitQueueTable,
    pub ready: ReadyQueues,
    pub timers: TimerQueue,
    pub poller: Option<Box<dyn NetworkPoller>>,
    /// Frame whose `resume()` is on the stack.
    pub current: Frame,
    pub current_fork: Option<ForkId>,
    pub in_scheduler: bool,
    pub stats: RuntimeStats,
}

impl Engine {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            started: StartedTable::default(),
            forked: ForkedTable::default(),
            queues: WaitQueueTable::default(),
            ready: ReadyQueues::default(),
            timers: TimerQueue::default(),
            poller: None,
            current: Frame::Main,
            current_fork: None,
            in_scheduler: false,
            stats: RuntimeStats::default(),
        }
    }

    pub(crate) fn register_call(
        &mut self,
        continuation: BoxContinuation,
        parent: Option<Frame>,
        fork: Option<ForkId>,
        kind: RecordKind,
    ) -> CallId {
        let id = self.started.register(continuation, parent, fork, kind);
        if let Some(parent) = parent {
            self.set_child(parent, id);
        }
        self.stats.calls_started += 1;
        id
    }

    /// Free call-chain record `id` and unlink it from its parent.
    pub(crate) fn release_call(&mut self, id: CallId) -> StartedRecord {
        let record = self.started.finish(id);
        if let Some(parent) = record.parent {
            self.clear_child(parent, id);
        }
        if let Some(timer) = record.timer {
            self.timers.cancel(timer);
        }
        record
    }

    fn child_slot(&mut self, parent: Frame) -> &mut Option<CallId> {
        match parent {
            Frame::Call(id) => &mut self.started.get_mut(id).child,
            Frame::Fork(id) => &mut self.forked.get_mut(id).child,
            Frame::Main => panic!("the main thread does not own call-chain records"),
        }
    }

    fn set_child(&mut self, parent: Frame, child: CallId) {
        let slot = self.child_slot(parent);
        if let Some(existing) = *slot {
            panic!("{} already has live child {}, cannot add {}", parent, existing, child);
        }
        *slot = Some(child);
    }

    fn clear_child(&mut self, parent: Frame, child: CallId) {
        let slot = self.child_slot(parent);
        assert_eq!(*slot, Some(child), "{} does not own {}", parent, child);
        *slot = None;
    }

    /// How long a blocked synchronous wait may poll the network for.
    fn poll_timeout(&mut self, now: Instant, deadline: Option<Instant>) -> Duration {
        if !self.ready.is_empty() {
            return Duration::ZERO;
        }
        let next_timer = self.timers.next_at();
        let network_busy = self.poller.as_ref().is_some_and(|p| !p.is_idle());
        if next_timer.is_none() && deadline.is_none() && !network_busy {
            error!(
                "deadlock: {} call-chain records and {} background tasks wait on nothing",
                self.started.len(),
                self.forked.len()
            );
            panic!("synchronous wait can never finish: nothing is ready, no timers, no network activity");
        }
        [next_timer, deadline]
            .into_iter()
            .flatten()
            .map(|at| at.saturating_duration_since(now))
            .fold(self.config.max_wait_slice(), Duration::min)
    }

    /// Empty every table. The records are handed back so they are dropped
    /// after the borrow is released.
    fn reset(&mut self) -> Released {
        let released = Released {
            started: self.started.reset(),
            forked: self.forked.reset(),
            timers: self.timers.clear(),
        };
        self.queues.reset();
        self.ready.clear();
        self.current = Frame::Main;
        self.current_fork = None;
        released
    }
}

struct Released {
    started: Vec<StartedRecord>,
    forked: Vec<ForkedRecord>,
    timers: Vec<TimerAction>,
}

impl Released {
    fn len(&self) -> usize {
        self.started.len() + self.forked.len() + self.timers.len()
    }
}

thread_local! {
    pub(crate) static ENGINE: RefCell<Engine> = RefCell::new(Engine::new(RuntimeConfig::default()));
}

pub(crate) fn with_engine<T>(f: impl FnOnce(&mut Engine) -> T) -> T {
    ENGINE.with(|engine| f(&mut engine.borrow_mut()))
}

fn assert_main(op: &str) {
    let current = with_engine(|e| e.current);
    assert!(
        current.is_main(),
        "{}() is a main-thread call but {} is running; use the ResumeCx primitive",
        op,
        current
    );
}

/// Resume `frame` with `input`. Returns its output if it finished.
pub(crate) fn resume_frame(frame: Frame, input: Storage) -> Option<Storage> {
    let (mut continuation, fork, saved) = with_engine(|e| {
        let (continuation, fork) = match frame {
            Frame::Call(id) => {
                let record = e.started.get_mut(id);
                (record.continuation.take(), record.fork)
            }
            Frame::Fork(id) => (e.forked.get_mut(id).continuation.take(), Some(id)),
            Frame::Main => panic!("the main thread cannot be resumed"),
        };
        let Some(continuation) = continuation else {
            panic!("{} resumed while it is not suspended", frame);
        };
        let saved = (e.current, e.current_fork);
        e.current = frame;
        e.current_fork = fork;
        (continuation, fork, saved)
    });

    let started_at = Instant::now();
    let mut cx = ResumeCx::new(frame, fork, input);
    let poll = continuation.resume_erased(&mut cx);
    let elapsed = started_at.elapsed();
    drop(cx);

    with_engine(|e| {
        e.current = saved.0;
        e.current_fork = saved.1;
        // Nested resumes under the same task are already inside this span.
        if let Some(fork) = fork.filter(|f| saved.1 != Some(*f)) {
            if let Ok(record) = e.forked.lookup_mut(fork) {
                record.running_time += elapsed;
            }
        }
    });

    match poll {
        Poll::Ready(output) => Some(output),
        Poll::Pending => {
            with_engine(|e| match frame {
                Frame::Call(id) => e.started.get_mut(id).continuation = Some(continuation),
                Frame::Fork(id) => e.forked.get_mut(id).continuation = Some(continuation),
                Frame::Main => unreachable!(),
            });
            None
        }
    }
}

/// Start `child` below `parent`. Ready if it finished without suspending.
pub(crate) fn call_nested(parent: Frame, fork: Option<ForkId>, child: BoxContinuation) -> Poll<Storage> {
    let id = with_engine(|e| e.register_call(child, Some(parent), fork, RecordKind::Call));
    match resume_frame(Frame::Call(id), Storage::Empty) {
        Some(output) => {
            let record = with_engine(|e| e.release_call(id));
            drop(record);
            Poll::Ready(output)
        }
        None => Poll::Pending,
    }
}

pub(crate) fn finish_fork(id: ForkId, output: Storage) {
    if let Some(wake) = with_engine(|e| e.complete_fork(id, output)) {
        wake_call(wake);
    }
}

/// Resume a parked waiter. Its answer is queued for the scheduler, which
/// runs right away when the wake comes from plain main-thread code.
pub(crate) fn wake_call(wake: Wake) {
    let live = with_engine(|e| {
        if !e.started.contains(wake.call) || e.started.is_finished(wake.call) {
            return false;
        }
        if let Some(timer) = e.started.get_mut(wake.call).timer.take() {
            e.timers.cancel(timer);
        }
        true
    });
    if !live {
        trace!("dropping wake of {} ({:?})", wake.call, wake.reason);
        return;
    }

    trace!("waking {} ({:?})", wake.call, wake.reason);
    let Some(output) = resume_frame(Frame::Call(wake.call), Storage::value(wake.reason)) else {
        return;
    };
    let run_now = with_engine(|e| {
        e.mark_ready(wake.call, output);
        e.current.is_main() && !e.in_scheduler
    });
    if run_now {
        run_scheduler(None);
    }
}

fn fire_due_timers() -> usize {
    let mut fired = 0;
    let now = Instant::now();
    while let Some((id, action)) = with_engine(|e| e.timers.pop_at(now)) {
        fired += 1;
        with_engine(|e| e.stats.timers_fired += 1);
        trace!("{} fired: {:?}", id, action);
        match action {
            TimerAction::WaitTimeout(call) | TimerAction::QueueWaitTimeout(call) => wake_call(Wake {
                call,
                reason: WakeReason::TimedOut,
            }),
            TimerAction::YieldWakeup(call) => wake_call(Wake {
                call,
                reason: WakeReason::Ready,
            }),
            TimerAction::Callback(callback) => callback(),
        }
    }
    fired
}

fn poll_network(timeout: Duration) -> bool {
    let Some(mut poller) = with_engine(|e| e.poller.take()) else {
        std::thread::sleep(timeout);
        return false;
    };
    let progressed = poller.poll_network(timeout);
    with_engine(|e| {
        if e.poller.is_none() {
            e.poller = Some(poller);
        }
    });
    progressed
}

/// Drive the scheduler, timers and network until `done` holds or
/// `deadline` passes. Returns the final value of `done`.
fn wait_synchronously(mut done: impl FnMut(&Engine) -> bool, deadline: Option<Instant>) -> bool {
    loop {
        run_scheduler(deadline);
        if with_engine(|e| done(e)) {
            return true;
        }
        if fire_due_timers() > 0 {
            continue;
        }

        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            poll_network(Duration::ZERO);
            fire_due_timers();
            run_scheduler(None);
            return with_engine(|e| done(e));
        }
        let timeout = with_engine(|e| e.poll_timeout(now, deadline));
        poll_network(timeout);
    }
}

/// Wait on the main thread for parked record `call`, then release it.
fn block_on_call<T: 'static>(call: CallId) -> Result<T, Failure> {
    wait_synchronously(|e| e.started.is_finished(call), None);
    let mut record = with_engine(|e| e.release_call(call));
    record.output.load()
}

/// One-time process initialization.
pub fn init_global(config: RuntimeConfig) {
    info!(
        "engine initialized: scheduler budget {}, wait slice {:?}",
        config.budget(),
        config.max_wait_slice()
    );
    with_engine(|e| e.config = config);
}

/// Install the network layer consulted by blocked synchronous waits.
/// Returns the previous one.
pub fn set_network_poller(poller: Box<dyn NetworkPoller>) -> Option<Box<dyn NetworkPoller>> {
    with_engine(|e| e.poller.replace(poller))
}

pub fn take_network_poller() -> Option<Box<dyn NetworkPoller>> {
    with_engine(|e| e.poller.take())
}

/// Start a new script: empty tables, fresh epoch, zeroed counters.
/// Handles from earlier scripts report as expired.
pub fn init_script() {
    let released = with_engine(|e| {
        e.stats = RuntimeStats::default();
        e.reset()
    });
    debug!("script initialized, released {} stale entries", released.len());
}

/// End the current script. Chains still in flight are detached from their
/// parents and everything is released; nothing crosses into the next script.
/// The installed [`NetworkPoller`] is reset as well.
pub fn teardown_script() {
    let (in_flight, released) = with_engine(|e| {
        let in_flight = e.started.detach_all();
        let unretrieved = e.forked.len();
        if in_flight > 0 || unretrieved > 0 {
            debug!(
                "teardown: {} chains in flight, {} background tasks unretrieved",
                in_flight, unretrieved
            );
        }
        (in_flight, e.reset())
    });
    trace!("teardown released {} entries", released.len());
    drop(released);
    if let Some(mut poller) = take_network_poller() {
        poller.reset();
        with_engine(|e| {
            if e.poller.is_none() {
                e.poller = Some(poller);
            }
        });
    }
    if in_flight > 0 {
        warn!("script ended with {} suspended call chains", in_flight);
    }
}

/// Run `resumable` to completion on the main thread, driving the
/// scheduler while it is suspended.
pub fn start<R: Resumable>(resumable: R) -> Result<R::Output, Failure> {
    assert_main("start");
    let id = with_engine(|e| e.register_call(Box::new(resumable), None, None, RecordKind::Call));
    if let Some(mut output) = resume_frame(Frame::Call(id), Storage::Empty) {
        let record = with_engine(|e| e.release_call(id));
        drop(record);
        return output.load();
    }
    block_on_call(id)
}

/// Launch `resumable` as a background task. It runs until its first
/// suspension before this returns.
pub fn fork<R: Resumable>(resumable: R) -> ForkId {
    let id = with_engine(|e| {
        e.stats.forks_started += 1;
        e.forked.register(Some(Box::new(resumable)))
    });
    if let Some(output) = resume_frame(Frame::Fork(id), Storage::Empty) {
        finish_fork(id, output);
    }
    id
}

/// Register a background task completed from outside, by
/// [`resolve_fork`].
pub fn fork_external() -> ForkId {
    with_engine(|e| {
        e.stats.forks_started += 1;
        e.forked.register(None)
    })
}

/// Complete external task `id` with `output`, waking its waiter.
pub fn resolve_fork(id: ForkId, output: Storage) -> Result<(), EngineError> {
    assert!(!output.is_empty(), "{} resolved with an empty result", id);
    with_engine(|e| {
        let record = e.forked.lookup(id)?;
        if !record.external {
            return Err(EngineError::NotExternal(id));
        }
        if record.finished {
            return Err(EngineError::AlreadyResolved(id));
        }
        Ok(())
    })?;
    finish_fork(id, output);
    Ok(())
}

/// Wait on the main thread for background task `id`. `None` waits until
/// it finishes, `Some(Duration::ZERO)` only checks. Returns false on
/// timeout.
pub fn wait(id: ForkId, timeout: Option<Duration>) -> Result<bool, EngineError> {
    assert_main("wait");
    match with_engine(|e| e.park_on_fork(None, None, id, timeout))? {
        Parked::Done(finished) => Ok(finished),
        Parked::Waiting(call) => Ok(block_on_call::<bool>(call)?),
    }
}

pub fn is_fork_finished(id: ForkId) -> Result<bool, EngineError> {
    with_engine(|e| e.fork_finished(id))
}

/// Take the result of finished task `id` and release it. Works once;
/// afterwards the id reports [`EngineError::AlreadyGotten`]. Asking for the
/// wrong type leaves the result in place.
pub fn fork_result<T: 'static>(id: ForkId) -> Result<T, EngineError> {
    let mut record = with_engine(|e| {
        let record = e.forked.lookup(id)?;
        if record.finished && !record.output.holds::<T>() {
            warn!("{} result requested as {}", id, type_name::<T>());
            return Err(EngineError::WrongResultType(id));
        }
        e.forked.retrieve(id)
    })?;
    trace!("retrieved {}", id);
    Ok(record.output.load::<T>()?)
}

pub fn fork_running_time(id: ForkId) -> Result<Duration, EngineError> {
    with_engine(|e| e.forked.lookup(id).map(|r| r.running_time))
}

/// Background task the running code belongs to; `None` on the main thread.
pub fn get_running_fork_id() -> Option<ForkId> {
    with_engine(|e| e.current_fork)
}

pub fn wait_queue_create() -> QueueId {
    with_engine(|e| e.queue_create())
}

/// Queue over `ids`. Ids that cannot be pushed are skipped with a warning.
pub fn wait_queue_create_from(ids: &[ForkId]) -> QueueId {
    let queue = wait_queue_create();
    for &id in ids {
        if let Err(err) = wait_queue_push(queue, id) {
            warn!("{}: skipping {}: {}", queue, id, err);
        }
    }
    queue
}

pub fn wait_queue_push(queue: QueueId, id: ForkId) -> Result<(), EngineError> {
    if let Some(wake) = with_engine(|e| e.queue_push(queue, id))? {
        wake_call(wake);
    }
    Ok(())
}

/// Next finished task of `queue` in completion order, blocking the main
/// thread. `None` once the queue is exhausted or `timeout` ran out.
pub fn wait_queue_next(queue: QueueId, timeout: Option<Duration>) -> Result<Option<ForkId>, EngineError> {
    assert_main("wait_queue_next");
    match with_engine(|e| e.park_on_queue(None, None, queue, timeout))? {
        Parked::Done(next) => Ok(next),
        Parked::Waiting(call) => Ok(block_on_call::<Option<ForkId>>(call)?),
    }
}

pub fn wait_queue_is_empty(queue: QueueId) -> Result<bool, EngineError> {
    with_engine(|e| e.queue_is_empty(queue))
}

pub fn wait_queue_destroy(queue: QueueId) -> Result<(), EngineError> {
    with_engine(|e| e.queue_destroy(queue))
}

/// Let other ready work, timers and the network run for at least `delay`.
pub fn sched_yield(delay: Duration) {
    assert_main("sched_yield");
    wait_synchronously(|_| false, Some(deadline_after(delay)));
}

/// Run `callback` on the main thread once `deadline` has passed.
pub fn register_timer(deadline: Instant, callback: impl FnOnce() + 'static) -> TimerId {
    with_engine(|e| e.timers.add_at(deadline, TimerAction::Callback(Box::new(callback))))
}

/// Returns false if the timer already fired or was cancelled.
pub fn cancel_timer(id: TimerId) -> bool {
    let cancelled = with_engine(|e| e.timers.cancel(id));
    if !cancelled {
        trace!("{} was not pending", id);
    }
    cancelled
}

pub fn stats() -> RuntimeStats {
    with_engine(|e| RuntimeStats {
        live_calls: e.started.len(),
        live_forks: e.forked.len(),
        live_queues: e.queues.len(),
        pending_timers: e.timers.len(),
        ..e.stats
    })
}
