// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Background ("forked") task records.
//!
//! A background task either runs a resumable or is bound to an external
//! event (a network reply). It lives until its result is retrieved or the
//! script ends. At most one waiter at a time: a single direct waiter or
//! membership in exactly one wait queue.

use std::time::Duration;

use log::{debug, trace};

use crate::arena::{Arena, Stale};
use crate::error::EngineError;
use crate::id::{CallId, ForkId, QueueId};
use crate::resumable::BoxContinuation;
use crate::runtime::Engine;
use crate::storage::Storage;
use crate::wait::{Wake, WakeReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Membership {
    #[default]
    Unowned,
    /// A call-chain record waits on this task directly.
    Waiter(CallId),
    /// Pushed to a queue, not finished yet.
    Queued(QueueId),
    /// Finished and linked on the queue's finished list.
    Linked { queue: QueueId, next: Option<ForkId> },
}

pub(crate) struct ForkedRecord {
    pub continuation: Option<BoxContinuation>,
    /// Completed from outside (network reply) rather than by a resumable.
    pub external: bool,
    pub output: Storage,
    pub finished: bool,
    pub membership: Membership,
    pub child: Option<CallId>,
    pub running_time: Duration,
}

#[derive(Default)]
pub(crate) struct ForkedTable {
    records: Arena<ForkedRecord>,
}

impl ForkedTable {
    pub fn register(&mut self, continuation: Option<BoxContinuation>) -> ForkId {
        let external = continuation.is_none();
        let id = ForkId(self.records.insert(ForkedRecord {
            continuation,
            external,
            output: Storage::Empty,
            finished: false,
            membership: Membership::Unowned,
            child: None,
            running_time: Duration::ZERO,
        }));
        trace!("registered {} external={}", id, external);
        id
    }

    pub fn lookup(&self, id: ForkId) -> Result<&ForkedRecord, EngineError> {
        self.records.get(id.0).map_err(|stale| stale_error(id, stale))
    }

    pub fn lookup_mut(&mut self, id: ForkId) -> Result<&mut ForkedRecord, EngineError> {
        self.records.get_mut(id.0).map_err(|stale| stale_error(id, stale))
    }

    /// For ids the engine itself holds; a miss is an engine bug.
    pub fn get_mut(&mut self, id: ForkId) -> &mut ForkedRecord {
        match self.lookup_mut(id) {
            Ok(record) => record,
            Err(err) => panic!("background record {} is not live: {}", id, err),
        }
    }

    /// Hand out a finished, unclaimed record and free its slot.
    pub fn retrieve(&mut self, id: ForkId) -> Result<ForkedRecord, EngineError> {
        let record = self.lookup(id)?;
        if !record.finished {
            return Err(EngineError::NotFinished(id));
        }
        if record.membership != Membership::Unowned {
            return Err(EngineError::AlreadyWaited(id));
        }
        self.records.remove(id.0).map_err(|stale| stale_error(id, stale))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ForkId, &mut ForkedRecord)> {
        self.records.iter_mut().map(|(h, r)| (ForkId(h), r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn reset(&mut self) -> Vec<ForkedRecord> {
        self.records.reset()
    }
}

fn stale_error(id: ForkId, stale: Stale) -> EngineError {
    match stale {
        Stale::Released => EngineError::AlreadyGotten(id),
        Stale::Expired => EngineError::ExpiredFork(id),
        Stale::Unknown => EngineError::UnknownFork(id),
    }
}

impl Engine {
    /// Store the result of background task `id` and hand it to whoever
    /// waits on it. Returns the call-chain record to wake, if any.
    pub(crate) fn complete_fork(&mut self, id: ForkId, output: Storage) -> Option<Wake> {
        let record = self.forked.get_mut(id);
        assert!(!record.finished, "background task {} finished twice", id);
        record.output = output;
        record.finished = true;
        record.continuation = None;
        let membership = std::mem::take(&mut record.membership);
        debug!("{} finished ({:?})", id, membership);

        match membership {
            Membership::Unowned => None,
            Membership::Waiter(call) => Some(Wake {
                call,
                reason: WakeReason::Ready,
            }),
            Membership::Queued(queue) => self.queue_link_finished(queue, id, true),
            Membership::Linked { .. } => unreachable!("unfinished task on a finished list"),
        }
    }

    /// Drop the direct waiter `call` of `id` after it gave up (timeout).
    pub(crate) fn release_fork_waiter(&mut self, id: ForkId, call: CallId) {
        if let Ok(record) = self.forked.lookup_mut(id) {
            if record.membership == Membership::Waiter(call) {
                record.membership = Membership::Unowned;
            }
        }
    }

    pub(crate) fn fork_finished(&self, id: ForkId) -> Result<bool, EngineError> {
        self.forked.lookup(id).map(|r| r.finished)
    }
}
