// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Resumable computations.
//!
//! A resumable is an explicit state machine: `resume()` either finishes
//! with a result or returns `Poll::Pending` after arranging to be resumed
//! later. Every suspension primitive on [`ResumeCx`] follows the same
//! shape:
//!
//! - `Poll::Ready(x)`: the answer was available immediately.
//! - `Poll::Pending`: return `Poll::Pending` from `resume()`. On the next
//!   resume the answer is delivered as input and read with
//!   [`ResumeCx::input`].
//!
//! ```ignore
//! fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<i64, Failure>> {
//!     loop {
//!         match self.state {
//!             State::Start => match cx.call(Child::new()) {
//!                 Poll::Ready(v) => return Poll::Ready(v.map(|v| v + 1)),
//!                 Poll::Pending => {
//!                     self.state = State::AwaitChild;
//!                     return Poll::Pending;
//!                 }
//!             },
//!             State::AwaitChild => {
//!                 let v = ready!(cx.input::<i64>())?;
//!                 return Poll::Ready(Ok(v + 1));
//!             }
//!         }
//!     }
//! }
//! ```

use std::task::Poll;
use std::time::Duration;

use crate::error::{EngineError, Failure};
use crate::id::{ForkId, Frame, QueueId};
use crate::storage::Storage;
use crate::{runtime, wait};

pub trait Resumable: 'static {
    type Output: 'static;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<Self::Output, Failure>>;
}

/// Type-erased resumable as stored in the record tables.
pub(crate) trait Continuation {
    fn resume_erased(&mut self, cx: &mut ResumeCx) -> Poll<Storage>;
}

impl<R: Resumable> Continuation for R {
    fn resume_erased(&mut self, cx: &mut ResumeCx) -> Poll<Storage> {
        self.resume(cx).map(Storage::from_result)
    }
}

pub(crate) type BoxContinuation = Box<dyn Continuation>;

/// Resumable built from a closure. Handy for leaf computations and tests.
pub struct FnResumable<F> {
    f: F,
}

pub fn from_fn<T, F>(f: F) -> FnResumable<F>
where
    T: 'static,
    F: FnMut(&mut ResumeCx) -> Poll<Result<T, Failure>> + 'static,
{
    FnResumable { f }
}

impl<T, F> Resumable for FnResumable<F>
where
    T: 'static,
    F: FnMut(&mut ResumeCx) -> Poll<Result<T, Failure>> + 'static,
{
    type Output = T;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<T, Failure>> {
        (self.f)(cx)
    }
}

/// Execution context handed to [`Resumable::resume`].
///
/// Knows which record is running and carries the result cell of
/// whatever that record was suspended on.
pub struct ResumeCx {
    frame: Frame,
    fork: Option<ForkId>,
    input: Storage,
}

impl ResumeCx {
    pub(crate) fn new(frame: Frame, fork: Option<ForkId>, input: Storage) -> Self {
        Self { frame, fork, input }
    }

    /// Record currently being resumed.
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Background task this call chain runs under (`None` on the main thread).
    pub fn fork_id(&self) -> Option<ForkId> {
        self.fork
    }

    pub fn has_input(&self) -> bool {
        !self.input.is_empty()
    }

    /// Read the answer delivered for the last suspension. `Pending` if
    /// nothing was delivered yet; the caller re-suspends at the same point.
    pub fn input<T: 'static>(&mut self) -> Poll<Result<T, Failure>> {
        if self.input.is_empty() {
            return Poll::Pending;
        }
        Poll::Ready(self.input.load())
    }

    /// Start a nested resumable as a child of this frame. Answer type on
    /// resumption: `R::Output`.
    pub fn call<R: Resumable>(&mut self, child: R) -> Poll<Result<R::Output, Failure>> {
        runtime::call_nested(self.frame, self.fork, Box::new(child)).map(|mut out| out.load())
    }

    /// Wait for background task `id` to finish. `None` waits forever,
    /// `Some(Duration::ZERO)` only checks. Answer type on resumption: `bool`
    /// (`false` on timeout).
    pub fn wait(&mut self, id: ForkId, timeout: Option<Duration>) -> Poll<Result<bool, EngineError>> {
        wait::wait_in_resumable(self.frame, self.fork, id, timeout)
    }

    /// Next finished task of `queue`, `None` once exhausted or timed out.
    /// Answer type on resumption: `Option<ForkId>`.
    pub fn wait_queue_next(
        &mut self,
        queue: QueueId,
        timeout: Option<Duration>,
    ) -> Poll<Result<Option<ForkId>, EngineError>> {
        wait::queue_next_in_resumable(self.frame, self.fork, queue, timeout)
    }

    /// Give other work a chance to run; resumes after at least `delay`.
    /// Always suspends. Answer type on resumption: `()`.
    pub fn sched_yield(&mut self, delay: Duration) -> Poll<()> {
        wait::yield_in_resumable(self.frame, self.fork, delay);
        Poll::Pending
    }
}

impl std::fmt::Debug for ResumeCx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeCx")
            .field("frame", &self.frame)
            .field("fork", &self.fork)
            .field("input", &self.input)
            .finish()
    }
}
