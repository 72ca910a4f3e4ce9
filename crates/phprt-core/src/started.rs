// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Call-chain ("started") records.
//!
//! One record per suspended frame of a nested call. A record knows the
//! frame its result goes to, the background task the chain runs under,
//! and its single live child.

use log::trace;

use crate::arena::{Arena, Stale};
use crate::id::{CallId, ForkId, Frame, QueueId};
use crate::resumable::BoxContinuation;
use crate::storage::Storage;
use crate::timer::TimerId;

/// What a call-chain record stands for. Decides which ready queue it
/// lands on when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    /// A resumable started with `start()` / `ResumeCx::call()`.
    Call,
    ForkWaiter(ForkId),
    QueueWaiter(QueueId),
    Yield,
}

pub(crate) struct StartedRecord {
    pub continuation: Option<BoxContinuation>,
    pub output: Storage,
    /// `None`: awaited synchronously by the main thread (or detached).
    pub parent: Option<Frame>,
    pub fork: Option<ForkId>,
    pub child: Option<CallId>,
    pub kind: RecordKind,
    /// Timer that wakes this record (wait timeout or yield delay).
    pub timer: Option<TimerId>,
}

impl StartedRecord {
    pub fn is_finished(&self) -> bool {
        !self.output.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct StartedTable {
    records: Arena<StartedRecord>,
}

impl StartedTable {
    pub fn register(
        &mut self,
        continuation: BoxContinuation,
        parent: Option<Frame>,
        fork: Option<ForkId>,
        kind: RecordKind,
    ) -> CallId {
        let id = CallId(self.records.insert(StartedRecord {
            continuation: Some(continuation),
            output: Storage::Empty,
            parent,
            fork,
            child: None,
            kind,
            timer: None,
        }));
        trace!("registered {} ({:?}) parent={:?} fork={:?}", id, kind, parent, fork);
        id
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.records.contains(id.0)
    }

    /// Unknown call ids are engine bugs.
    pub fn get(&self, id: CallId) -> &StartedRecord {
        match self.records.get(id.0) {
            Ok(record) => record,
            Err(stale) => invalid(id, stale),
        }
    }

    pub fn get_mut(&mut self, id: CallId) -> &mut StartedRecord {
        match self.records.get_mut(id.0) {
            Ok(record) => record,
            Err(stale) => invalid(id, stale),
        }
    }

    pub fn is_finished(&self, id: CallId) -> bool {
        self.records.get(id.0).map(StartedRecord::is_finished).unwrap_or(false)
    }

    /// Release the slot and hand back the record. The caller clears the
    /// parent's child pointer.
    pub fn finish(&mut self, id: CallId) -> StartedRecord {
        match self.records.remove(id.0) {
            Ok(record) => {
                trace!("finished {}", id);
                record
            }
            Err(stale) => invalid(id, stale),
        }
    }

    /// Make every record main-thread-owned so nothing delivers across
    /// the script boundary. Returns how many chains were in flight.
    pub fn detach_all(&mut self) -> usize {
        let mut in_flight = 0;
        for (_, record) in self.records.iter_mut() {
            if record.parent.is_some() || record.child.is_some() {
                in_flight += 1;
            }
            record.parent = None;
            record.child = None;
        }
        in_flight
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn reset(&mut self) -> Vec<StartedRecord> {
        self.records.reset()
    }
}

fn invalid(id: CallId, stale: Stale) -> ! {
    panic!("call-chain record {} is not live ({:?})", id, stale)
}
