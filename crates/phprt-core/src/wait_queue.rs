// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wait queues: fan-in over a set of background tasks.
//!
//! Finished tasks are threaded onto the queue's finished list through
//! their own `membership` field, so the list needs no allocation and
//! pops in completion order.
//!
//! Invariant: `pending + linked + retrieved == pushed`.

use log::{debug, warn};

use crate::arena::{Arena, Stale};
use crate::error::EngineError;
use crate::forked::Membership;
use crate::id::{CallId, ForkId, QueueId};
use crate::runtime::Engine;
use crate::wait::{Wake, WakeReason};

#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    pub pending: usize,
    pub head: Option<ForkId>,
    pub tail: Option<ForkId>,
    pub linked: usize,
    /// Call-chain record blocked in `next()` on this queue.
    pub waiter: Option<CallId>,
    pub pushed: usize,
    pub retrieved: usize,
}

impl WaitQueue {
    pub fn is_exhausted(&self) -> bool {
        self.head.is_none() && self.pending == 0
    }
}

#[derive(Default)]
pub(crate) struct WaitQueueTable {
    queues: Arena<WaitQueue>,
}

impl WaitQueueTable {
    pub fn create(&mut self) -> QueueId {
        QueueId(self.queues.insert(WaitQueue::default()))
    }

    pub fn lookup(&self, id: QueueId) -> Result<&WaitQueue, EngineError> {
        self.queues.get(id.0).map_err(|_| EngineError::UnknownQueue(id))
    }

    pub fn lookup_mut(&mut self, id: QueueId) -> Result<&mut WaitQueue, EngineError> {
        self.queues.get_mut(id.0).map_err(|_| EngineError::UnknownQueue(id))
    }

    fn get_mut(&mut self, id: QueueId) -> &mut WaitQueue {
        match self.queues.get_mut(id.0) {
            Ok(queue) => queue,
            Err(stale) => invalid(id, stale),
        }
    }

    fn remove(&mut self, id: QueueId) -> Result<WaitQueue, EngineError> {
        self.queues.remove(id.0).map_err(|_| EngineError::UnknownQueue(id))
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn reset(&mut self) -> Vec<WaitQueue> {
        self.queues.reset()
    }
}

fn invalid(id: QueueId, stale: Stale) -> ! {
    panic!("wait queue {} is not live ({:?})", id, stale)
}

impl Engine {
    pub(crate) fn queue_create(&mut self) -> QueueId {
        self.stats.queues_created += 1;
        let id = self.queues.create();
        debug!("created {}", id);
        id
    }

    /// Link `fork` to `queue`. A task that already finished goes straight
    /// onto the finished list (and may wake the queue's waiter).
    pub(crate) fn queue_push(&mut self, queue: QueueId, fork: ForkId) -> Result<Option<Wake>, EngineError> {
        self.queues.lookup(queue)?;
        let record = self.forked.lookup(fork)?;
        if record.membership != Membership::Unowned {
            warn!("{} pushed to {} while already waited", fork, queue);
            return Err(EngineError::AlreadyWaited(fork));
        }
        let finished = record.finished;

        self.queues.get_mut(queue).pushed += 1;
        if finished {
            return Ok(self.queue_link_finished(queue, fork, false));
        }

        self.forked.get_mut(fork).membership = Membership::Queued(queue);
        self.queues.get_mut(queue).pending += 1;
        Ok(None)
    }

    /// Thread finished `fork` onto the tail of `queue`'s finished list.
    /// `was_pending` is set when the task was counted in `pending`.
    pub(crate) fn queue_link_finished(&mut self, queue: QueueId, fork: ForkId, was_pending: bool) -> Option<Wake> {
        self.forked.get_mut(fork).membership = Membership::Linked { queue, next: None };

        let q = self.queues.get_mut(queue);
        if was_pending {
            q.pending -= 1;
        }
        let previous_tail = q.tail.replace(fork);
        if q.head.is_none() {
            q.head = Some(fork);
        }
        q.linked += 1;
        let waiter = q.waiter;

        if let Some(tail) = previous_tail {
            if let Membership::Linked { next, .. } = &mut self.forked.get_mut(tail).membership {
                *next = Some(fork);
            }
        }

        waiter.map(|call| Wake {
            call,
            reason: WakeReason::Ready,
        })
    }

    /// Pop the earliest finished task. The popped task becomes unowned and
    /// finished, ready for `fork_result`.
    pub(crate) fn queue_pop(&mut self, queue: QueueId) -> Result<Option<ForkId>, EngineError> {
        let q = self.queues.lookup_mut(queue)?;
        let Some(head) = q.head else {
            return Ok(None);
        };

        let record = self.forked.get_mut(head);
        let next = match record.membership {
            Membership::Linked { queue: owner, next } if owner == queue => next,
            other => panic!("{} on finished list of {} has membership {:?}", head, queue, other),
        };
        record.membership = Membership::Unowned;

        let q = self.queues.get_mut(queue);
        q.head = next;
        if next.is_none() {
            q.tail = None;
        }
        q.linked -= 1;
        q.retrieved += 1;
        Ok(Some(head))
    }

    pub(crate) fn queue_is_empty(&self, queue: QueueId) -> Result<bool, EngineError> {
        self.queues.lookup(queue).map(WaitQueue::is_exhausted)
    }

    pub(crate) fn queue_clear_waiter(&mut self, queue: QueueId, call: CallId) {
        if let Ok(q) = self.queues.lookup_mut(queue) {
            if q.waiter == Some(call) {
                q.waiter = None;
            }
        }
    }

    /// Release `queue` and unlink every task still attached to it.
    pub(crate) fn queue_destroy(&mut self, queue: QueueId) -> Result<(), EngineError> {
        let q = self.queues.lookup(queue)?;
        assert!(
            q.waiter.is_none(),
            "wait queue {} destroyed while {} waits on it",
            queue,
            q.waiter.map(|c| c.to_string()).unwrap_or_default()
        );
        self.queues.remove(queue)?;

        for (_, record) in self.forked.iter_mut() {
            let attached = match record.membership {
                Membership::Queued(owner) => owner == queue,
                Membership::Linked { queue: owner, .. } => owner == queue,
                _ => false,
            };
            if attached {
                record.membership = Membership::Unowned;
            }
        }
        debug!("destroyed {}", queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::storage::Storage;

    fn engine() -> Engine {
        Engine::new(RuntimeConfig::default())
    }

    #[test]
    fn finished_list_follows_completion_order() {
        let mut e = engine();
        let q = e.queue_create();
        let a = e.forked.register(None);
        let b = e.forked.register(None);
        let c = e.forked.register(None);
        for id in [a, b, c] {
            assert_eq!(e.queue_push(q, id), Ok(None));
        }
        assert_eq!(e.queues.lookup(q).unwrap().pending, 3);

        e.complete_fork(c, Storage::Void);
        e.complete_fork(a, Storage::Void);

        assert_eq!(e.queue_pop(q), Ok(Some(c)));
        assert_eq!(e.queue_pop(q), Ok(Some(a)));
        assert_eq!(e.queue_pop(q), Ok(None));
        assert_eq!(e.queue_is_empty(q), Ok(false));

        e.complete_fork(b, Storage::Void);
        assert_eq!(e.queue_pop(q), Ok(Some(b)));
        assert_eq!(e.queue_is_empty(q), Ok(true));

        let stats = e.queues.lookup(q).unwrap();
        assert_eq!(stats.pushed, 3);
        assert_eq!(stats.retrieved, 3);
        assert_eq!(stats.pending + stats.linked, 0);
    }

    #[test]
    fn pushing_finished_task_links_immediately() {
        let mut e = engine();
        let q = e.queue_create();
        let a = e.forked.register(None);
        e.complete_fork(a, Storage::value(1u8));
        assert_eq!(e.queue_push(q, a), Ok(None));
        assert_eq!(e.queues.lookup(q).unwrap().pending, 0);
        assert_eq!(e.queue_pop(q), Ok(Some(a)));
        assert_eq!(e.forked.lookup(a).unwrap().membership, Membership::Unowned);
    }

    #[test]
    fn second_queue_is_rejected() {
        let mut e = engine();
        let q1 = e.queue_create();
        let q2 = e.queue_create();
        let a = e.forked.register(None);
        e.queue_push(q1, a).unwrap();
        assert_eq!(e.queue_push(q2, a), Err(EngineError::AlreadyWaited(a)));
    }

    #[test]
    fn destroy_unlinks_members_and_invalidates_id() {
        let mut e = engine();
        let q = e.queue_create();
        let a = e.forked.register(None);
        let b = e.forked.register(None);
        e.queue_push(q, a).unwrap();
        e.queue_push(q, b).unwrap();
        e.complete_fork(b, Storage::Void);

        e.queue_destroy(q).unwrap();
        assert_eq!(e.forked.lookup(a).unwrap().membership, Membership::Unowned);
        assert_eq!(e.forked.lookup(b).unwrap().membership, Membership::Unowned);
        assert_eq!(e.queue_pop(q), Err(EngineError::UnknownQueue(q)));
        assert_eq!(e.queues.len(), 0);
    }
}
