// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Waiting for the answer of a single request.

use std::task::{ready, Poll};
use std::time::Duration;

use phprt_core::{fork_result, start, Failure, ForkId, ResumeCx, Resumable};

use crate::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Waiting,
}

/// Resumable that waits for request `id` and yields its raw answer.
/// Errors come out as [`Failure`]s carrying the RPC error code.
#[derive(Debug)]
pub struct RpcGet {
    id: ForkId,
    timeout: Option<Duration>,
    state: State,
}

/// Wait for the answer of request `id`, giving up after `timeout`
/// (`None`: rely on the request's own network timeout).
pub fn wait_for_result(id: ForkId, timeout: Option<Duration>) -> RpcGet {
    RpcGet {
        id,
        timeout,
        state: State::Start,
    }
}

impl Resumable for RpcGet {
    type Output = Vec<u8>;

    fn resume(&mut self, cx: &mut ResumeCx) -> Poll<Result<Vec<u8>, Failure>> {
        let finished = match self.state {
            State::Start => match cx.wait(self.id, self.timeout) {
                Poll::Ready(finished) => finished.map_err(RpcError::from_engine)?,
                Poll::Pending => {
                    self.state = State::Waiting;
                    return Poll::Pending;
                }
            },
            State::Waiting => ready!(cx.input::<bool>())?,
        };
        if !finished {
            return Poll::Ready(Err(RpcError::timeout(format!("no answer for {} in time", self.id)).into()));
        }
        Poll::Ready(fork_result::<Vec<u8>>(self.id).map_err(|err| RpcError::from_engine(err).into()))
    }
}

/// Main-thread form of [`wait_for_result`].
pub fn rpc_get_synchronously(id: ForkId, timeout: Option<Duration>) -> Result<Vec<u8>, RpcError> {
    start(wait_for_result(id, timeout)).map_err(RpcError::from)
}
