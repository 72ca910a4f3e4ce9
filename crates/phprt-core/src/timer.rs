// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer queue: a min-heap of deadlines with cancellation.
//!
//! Engine wakeups (wait timeouts, yield delays) are plain enum variants
//! dispatched by the runtime; anything else registers a boxed callback.
//! Cancelled timers stay in the heap and are skipped when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use crate::id::CallId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Longest delay a deadline is computed for. Longer delays are clamped so
/// that `now + delay` stays representable.
pub const MAX_DELAY: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Instant `delay` from now, clamped to [`MAX_DELAY`].
pub fn deadline_after(delay: Duration) -> Instant {
    Instant::now() + delay.min(MAX_DELAY)
}

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

pub(crate) enum TimerAction {
    /// A direct wait on a background task ran out of time.
    WaitTimeout(CallId),
    /// A wait-queue `next()` ran out of time.
    QueueWaitTimeout(CallId),
    /// A delayed `sched_yield` is due.
    YieldWakeup(CallId),
    Callback(TimerCallback),
}

impl fmt::Debug for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerAction::WaitTimeout(id) => f.debug_tuple("WaitTimeout").field(id).finish(),
            TimerAction::QueueWaitTimeout(id) => f.debug_tuple("QueueWaitTimeout").field(id).finish(),
            TimerAction::YieldWakeup(id) => f.debug_tuple("YieldWakeup").field(id).finish(),
            TimerAction::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    // BinaryHeap is a max heap, we need a min heap.
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    actions: HashMap<TimerId, TimerAction>,
    next_id: u64,
}

impl TimerQueue {
    pub fn add_at(&mut self, at: Instant, action: TimerAction) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.heap.push(Reverse((at, id)));
        self.actions.insert(id, action);
        id
    }

    pub fn add_after(&mut self, after: Duration, action: TimerAction) -> TimerId {
        self.add_at(deadline_after(after), action)
    }

    /// Returns false if the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.actions.remove(&id).is_some()
    }

    fn skip_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.actions.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_at(&mut self) -> Option<Instant> {
        self.skip_cancelled();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop one timer due at or before `now`.
    pub fn pop_at(&mut self, now: Instant) -> Option<(TimerId, TimerAction)> {
        let next_at = self.next_at()?;
        if next_at > now {
            return None;
        }
        let Reverse((_, id)) = self.heap.pop()?;
        self.actions.remove(&id).map(|action| (id, action))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn clear(&mut self) -> Vec<TimerAction> {
        self.heap.clear();
        self.actions.drain().map(|(_, action)| action).collect()
    }
}
