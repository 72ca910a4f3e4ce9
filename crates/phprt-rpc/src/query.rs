// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Collecting the answers of many requests at once.

use std::task::Poll;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, warn};
use phprt_core::{
    deadline_after, fork_result, start, wait_queue_create_from, wait_queue_destroy, Failure, ForkId, QueueId,
    ResumeCx, Resumable,
};

use crate::error::RpcError;

pub type RpcAnswer = Result<Vec<u8>, RpcError>;

/// Resumable that drains a wait queue over `ids` and returns one answer
/// per requested id, in request order. Ids that never come out of the
/// queue (unknown, duplicated, or still pending at the deadline) get a
/// "no answer" error, as do tasks whose result is not an RPC answer.
pub struct QueryMany {
    ids: Vec<ForkId>,
    deadline: Option<Instant>,
    queue: Option<QueueId>,
    waiting: bool,
    // Completion order.
    answers: IndexMap<ForkId, RpcAnswer>,
}

pub fn query_many(ids: Vec<ForkId>, timeout: Option<Duration>) -> QueryMany {
    QueryMany {
        ids,
        deadline: timeout.map(deadline_after),
        queue: None,
        waiting: false,
        answers: IndexMap::new(),
    }
}

impl QueryMany {
    fn next_finished(&mut self, cx: &mut ResumeCx, queue: QueueId) -> Poll<Result<Option<ForkId>, Failure>> {
        if self.waiting {
            let next = cx.input::<Option<ForkId>>();
            if next.is_ready() {
                self.waiting = false;
            }
            return next;
        }
        let timeout = self.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match cx.wait_queue_next(queue, timeout) {
            Poll::Ready(next) => Poll::Ready(next.map_err(|err| RpcError::from_engine(err).into())),
            Poll::Pending => {
                self.waiting = true;
                Poll::Pending
            }
        }
    }

    fn collect(&mut self) -> Vec<RpcAnswer> {
        debug!("answers arrived in order {:?}", self.answers.keys().collect::<Vec<_>>());
        self.ids
            .iter()
            .map(|id| {
                self.answers
                    .shift_remove(id)
                    .unwrap_or_else(|| Err(RpcError::no_answer(*id)))
            })
            .collect()
    }
}

impl Resumable for QueryMany {
    type Output = Vec<RpcAnswer>;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<Vec<RpcAnswer>, Failure>> {
        let queue = *self.queue.get_or_insert_with(|| wait_queue_create_from(&self.ids));
        loop {
            let next = match self.next_finished(cx, queue) {
                Poll::Ready(next) => next?,
                Poll::Pending => return Poll::Pending,
            };
            let Some(id) = next else {
                break;
            };
            let answer = fork_result::<Vec<u8>>(id).map_err(RpcError::from_engine);
            self.answers.insert(id, answer);
        }

        if let Err(err) = wait_queue_destroy(queue) {
            warn!("cannot release {}: {}", queue, err);
        }
        self.queue = None;
        Poll::Ready(Ok(self.collect()))
    }
}

/// Main-thread form of [`query_many`].
pub fn query_many_synchronously(ids: Vec<ForkId>, timeout: Option<Duration>) -> Result<Vec<RpcAnswer>, RpcError> {
    start(query_many(ids, timeout)).map_err(RpcError::from)
}
