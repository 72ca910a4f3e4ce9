// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension primitives: waiting on one background task, on a wait
//! queue, and cooperative yields.
//!
//! Each primitive parks a small call-chain record (a waiter) as the child
//! of the suspending frame. The waiter is resumed with a [`WakeReason`]
//! when the awaited event happens or its timer fires, finishes at once,
//! and its answer travels up the chain through the scheduler like any
//! other result.

use std::task::{ready, Poll};
use std::time::Duration;

use log::{trace, warn};

use crate::error::{EngineError, Failure};
use crate::forked::Membership;
use crate::id::{CallId, ForkId, Frame, QueueId};
use crate::resumable::{ResumeCx, Resumable};
use crate::runtime::{with_engine, Engine};
use crate::started::RecordKind;
use crate::storage::Storage;
use crate::timer::TimerAction;

/// Why a parked waiter is being resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Ready,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wake {
    pub call: CallId,
    pub reason: WakeReason,
}

/// Outcome of trying to wait: answered on the spot, or a waiter was parked.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Parked<T> {
    Done(T),
    Waiting(CallId),
}

fn waiter_id(cx: &ResumeCx) -> CallId {
    match cx.frame() {
        Frame::Call(id) => id,
        other => panic!("waiter resumed as {}", other),
    }
}

struct ForkWaiter {
    target: ForkId,
}

impl Resumable for ForkWaiter {
    type Output = bool;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<bool, Failure>> {
        let reason = ready!(cx.input::<WakeReason>())?;
        if reason == WakeReason::TimedOut {
            let call = waiter_id(cx);
            with_engine(|e| e.release_fork_waiter(self.target, call));
            trace!("wait on {} timed out", self.target);
        }
        Poll::Ready(Ok(reason == WakeReason::Ready))
    }
}

struct QueueWaiter {
    queue: QueueId,
}

impl Resumable for QueueWaiter {
    type Output = Option<ForkId>;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<Option<ForkId>, Failure>> {
        let reason = ready!(cx.input::<WakeReason>())?;
        let call = waiter_id(cx);
        let next = with_engine(|e| {
            e.queue_clear_waiter(self.queue, call);
            match reason {
                // A queue cannot be destroyed while waited, so the pop succeeds.
                WakeReason::Ready => e.queue_pop(self.queue).ok().flatten(),
                WakeReason::TimedOut => None,
            }
        });
        Poll::Ready(Ok(next))
    }
}

struct YieldPoint;

impl Resumable for YieldPoint {
    type Output = ();

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<(), Failure>> {
        ready!(cx.input::<WakeReason>())?;
        Poll::Ready(Ok(()))
    }
}

impl Engine {
    /// Wait for background task `target` on behalf of `parent` (`None`:
    /// the main thread).
    pub(crate) fn park_on_fork(
        &mut self,
        parent: Option<Frame>,
        fork: Option<ForkId>,
        target: ForkId,
        timeout: Option<Duration>,
    ) -> Result<Parked<bool>, EngineError> {
        let record = self.forked.lookup(target)?;
        if record.finished {
            return Ok(Parked::Done(true));
        }
        if record.membership != Membership::Unowned {
            warn!("{} is already waited ({:?})", target, record.membership);
            return Err(EngineError::AlreadyWaited(target));
        }
        if timeout == Some(Duration::ZERO) {
            return Ok(Parked::Done(false));
        }

        let call = self.register_call(
            Box::new(ForkWaiter { target }),
            parent,
            fork,
            RecordKind::ForkWaiter(target),
        );
        self.forked.get_mut(target).membership = Membership::Waiter(call);
        if let Some(timeout) = timeout {
            let timer = self.timers.add_after(timeout, TimerAction::WaitTimeout(call));
            self.started.get_mut(call).timer = Some(timer);
        }
        trace!("{} waits on {} (timeout {:?})", call, target, timeout);
        Ok(Parked::Waiting(call))
    }

    pub(crate) fn park_on_queue(
        &mut self,
        parent: Option<Frame>,
        fork: Option<ForkId>,
        queue: QueueId,
        timeout: Option<Duration>,
    ) -> Result<Parked<Option<ForkId>>, EngineError> {
        if self.queues.lookup(queue)?.waiter.is_some() {
            warn!("{} is already waited", queue);
            return Err(EngineError::QueueAlreadyWaited(queue));
        }
        if let Some(next) = self.queue_pop(queue)? {
            return Ok(Parked::Done(Some(next)));
        }
        if self.queue_is_empty(queue)? || timeout == Some(Duration::ZERO) {
            return Ok(Parked::Done(None));
        }

        let call = self.register_call(
            Box::new(QueueWaiter { queue }),
            parent,
            fork,
            RecordKind::QueueWaiter(queue),
        );
        self.queues.lookup_mut(queue)?.waiter = Some(call);
        if let Some(timeout) = timeout {
            let timer = self.timers.add_after(timeout, TimerAction::QueueWaitTimeout(call));
            self.started.get_mut(call).timer = Some(timer);
        }
        trace!("{} waits on {} (timeout {:?})", call, queue, timeout);
        Ok(Parked::Waiting(call))
    }

    /// Park a yield point. A zero delay is ready at once and goes on the
    /// yielded queue; otherwise a timer wakes it.
    pub(crate) fn park_yield(&mut self, parent: Option<Frame>, fork: Option<ForkId>, delay: Duration) -> CallId {
        let call = self.register_call(Box::new(YieldPoint), parent, fork, RecordKind::Yield);
        if delay.is_zero() {
            self.mark_ready(call, Storage::Void);
        } else {
            let timer = self.timers.add_after(delay, TimerAction::YieldWakeup(call));
            self.started.get_mut(call).timer = Some(timer);
        }
        call
    }
}

fn suspended<T>(parked: Result<Parked<T>, EngineError>) -> Poll<Result<T, EngineError>> {
    match parked {
        Ok(Parked::Done(value)) => Poll::Ready(Ok(value)),
        Ok(Parked::Waiting(_)) => Poll::Pending,
        Err(err) => Poll::Ready(Err(err)),
    }
}

pub(crate) fn wait_in_resumable(
    frame: Frame,
    fork: Option<ForkId>,
    target: ForkId,
    timeout: Option<Duration>,
) -> Poll<Result<bool, EngineError>> {
    suspended(with_engine(|e| e.park_on_fork(Some(frame), fork, target, timeout)))
}

pub(crate) fn queue_next_in_resumable(
    frame: Frame,
    fork: Option<ForkId>,
    queue: QueueId,
    timeout: Option<Duration>,
) -> Poll<Result<Option<ForkId>, EngineError>> {
    suspended(with_engine(|e| e.park_on_queue(Some(frame), fork, queue, timeout)))
}

pub(crate) fn yield_in_resumable(frame: Frame, fork: Option<ForkId>, delay: Duration) {
    with_engine(|e| e.park_yield(Some(frame), fork, delay));
}
