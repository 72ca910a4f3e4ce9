// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The scheduler loop.
//!
//! Takes finished call-chain records off the ready queues and delivers
//! each result into its parent frame. A parent that finishes in turn is
//! propagated right away, without being charged to the tick budget.
//! Yielded records are always taken before ordinary completions.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, trace};

use crate::id::{CallId, Frame};
use crate::runtime::{finish_fork, resume_frame, with_engine, Engine, ENGINE};
use crate::started::{RecordKind, StartedRecord};
use crate::storage::Storage;

#[derive(Debug, Default)]
pub(crate) struct ReadyQueues {
    finished: VecDeque<CallId>,
    yielded: VecDeque<CallId>,
}

impl ReadyQueues {
    pub fn push(&mut self, id: CallId, yielded: bool) {
        if yielded {
            self.yielded.push_back(id);
        } else {
            self.finished.push_back(id);
        }
    }

    pub fn pop(&mut self) -> Option<CallId> {
        self.yielded.pop_front().or_else(|| self.finished.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.finished.is_empty() && self.yielded.is_empty()
    }

    pub fn len(&self) -> usize {
        self.finished.len() + self.yielded.len()
    }

    pub fn clear(&mut self) {
        self.finished.clear();
        self.yielded.clear();
    }
}

impl Engine {
    /// Store the result of call-chain record `id` and queue it for
    /// delivery to its parent.
    pub(crate) fn mark_ready(&mut self, id: CallId, output: Storage) {
        let record = self.started.get_mut(id);
        assert!(record.output.is_empty(), "{} finished twice", id);
        record.output = output;
        let yielded = record.kind == RecordKind::Yield;
        self.ready.push(id, yielded);
    }
}

/// Clears the re-entrancy flag on every exit path, unwinding included.
struct SchedulerGuard;

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        ENGINE.with(|engine| {
            if let Ok(mut engine) = engine.try_borrow_mut() {
                engine.in_scheduler = false;
            }
        });
    }
}

enum Step {
    /// The record vanished (script reset while it was queued).
    Stale,
    /// Awaited synchronously by the main thread.
    Main,
    Deliver(Frame, StartedRecord),
}

/// Drain ready records until nothing is ready, the tick budget is spent,
/// or `deadline` passes. Returns true when it stopped because a record
/// awaited by the main thread finished.
///
/// Re-entrant calls return false immediately.
pub fn run_scheduler(deadline: Option<Instant>) -> bool {
    let budget = with_engine(|e| {
        if e.in_scheduler {
            return None;
        }
        e.in_scheduler = true;
        Some(e.config.budget())
    });
    let Some(budget) = budget else {
        return false;
    };
    let _guard = SchedulerGuard;

    let mut spent = 0;
    while spent < budget {
        let Some(id) = with_engine(|e| e.ready.pop()) else {
            break;
        };
        spent += 1;
        with_engine(|e| e.stats.scheduler_iterations += 1);

        if propagate(id) {
            trace!("scheduler stopped: main-thread record {} finished", id);
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            debug!("scheduler stopped at deadline after {} records", spent);
            break;
        }
    }
    if spent == budget {
        debug!(
            "scheduler budget of {} spent, {} records still ready",
            budget,
            with_engine(|e| e.ready.len())
        );
    }
    false
}

/// Deliver finished record `id` to its parent, continuing up the chain
/// while parents finish. Returns true on reaching a main-thread record.
fn propagate(mut id: CallId) -> bool {
    loop {
        let step = with_engine(|e| {
            if !e.started.contains(id) {
                return Step::Stale;
            }
            match e.started.get(id).parent {
                None => Step::Main,
                Some(parent) => Step::Deliver(parent, e.release_call(id)),
            }
        });

        let (parent, mut record) = match step {
            Step::Stale => return false,
            Step::Main => return true,
            Step::Deliver(parent, record) => (parent, record),
        };
        let output = std::mem::take(&mut record.output);
        drop(record);
        with_engine(|e| e.stats.results_propagated += 1);
        trace!("{} delivers to {}", id, parent);

        let Some(parent_output) = resume_frame(parent, output) else {
            return false;
        };
        match parent {
            Frame::Call(parent_id) => {
                with_engine(|e| e.started.get_mut(parent_id).output = parent_output);
                id = parent_id;
            }
            Frame::Fork(fork) => {
                finish_fork(fork, parent_output);
                return false;
            }
            Frame::Main => unreachable!("records are never parented to the main thread"),
        }
    }
}
