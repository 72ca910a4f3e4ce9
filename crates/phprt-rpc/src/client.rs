// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Request bookkeeping between the transport and the engine.
//!
//! Every request that expects an answer becomes an external background
//! task. The reply, a transport error, or the request timer resolves it,
//! whichever comes first; anything arriving later is dropped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use phprt_core::{
    cancel_timer, deadline_after, fork_external, register_timer, resolve_fork, set_network_poller, Failure, ForkId,
    NetworkPoller, Storage, TimerId,
};
use serde::Serialize;

use crate::config::RpcConfig;
use crate::connection::{Connection, NetHandle};
use crate::error::{RpcError, TL_ERROR_NO_CONNECTIONS};
use crate::transport::{NetEvent, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RpcStats {
    pub sent: u64,
    pub fire_and_forget: u64,
    pub answered: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub dropped_late: u64,
}

struct PendingRequest {
    handle: NetHandle,
    timer: TimerId,
    sent_at: Instant,
}

struct RpcClient {
    transport: Box<dyn Transport>,
    config: RpcConfig,
    pending: HashMap<ForkId, PendingRequest>,
    by_handle: HashMap<NetHandle, ForkId>,
    stats: RpcStats,
}

impl RpcClient {
    fn forget(&mut self, id: ForkId) -> Option<PendingRequest> {
        let request = self.pending.remove(&id)?;
        self.by_handle.remove(&request.handle);
        Some(request)
    }
}

thread_local! {
    static CLIENT: RefCell<Option<RpcClient>> = const { RefCell::new(None) };
}

fn with_client<T>(f: impl FnOnce(&mut RpcClient) -> T) -> Result<T, RpcError> {
    CLIENT.with(|client| match client.borrow_mut().as_mut() {
        Some(client) => Ok(f(client)),
        None => Err(RpcError::new(TL_ERROR_NO_CONNECTIONS, "rpc client is not installed")),
    })
}

/// Install the client for this thread and make the engine poll `transport`
/// while a synchronous wait is blocked.
pub fn install(transport: impl Transport + 'static, config: RpcConfig) {
    debug!("rpc client installed, default timeout {:?}", config.default_timeout());
    CLIENT.with(|client| {
        *client.borrow_mut() = Some(RpcClient {
            transport: Box::new(transport),
            config,
            pending: HashMap::new(),
            by_handle: HashMap::new(),
            stats: RpcStats::default(),
        })
    });
    set_network_poller(Box::new(RpcPoller));
}

/// Forget every request of the finished script. `teardown_script()` runs
/// this through the installed poller.
pub fn reset_script() {
    let _ = with_client(|c| {
        if !c.pending.is_empty() {
            debug!("dropping {} requests still in flight", c.pending.len());
        }
        c.pending.clear();
        c.by_handle.clear();
        c.stats = RpcStats::default();
    });
}

pub fn stats() -> RpcStats {
    with_client(|c| c.stats).unwrap_or_default()
}

/// Send `payload` over `conn`. Returns the id of the background task the
/// answer will resolve. `timeout` is in seconds; see
/// [`RpcConfig::normalize_timeout`].
///
/// A fire-and-forget request is resolved at once with a timeout error, so
/// its bookkeeping is released without anyone waiting on it.
pub fn send(conn: &Connection, payload: &[u8], timeout: f64, fire_and_forget: bool) -> Result<ForkId, RpcError> {
    let (handle, timeout) = with_client(|c| {
        let fallback = conn.timeout.unwrap_or_else(|| c.config.default_timeout());
        let timeout = c.config.normalize_timeout(timeout, fallback);
        let handle = c.transport.send(conn, payload, !fire_and_forget)?;
        c.stats.sent += 1;
        Ok::<_, RpcError>((handle, timeout))
    })??;

    let id = fork_external();
    if fire_and_forget {
        with_client(|c| c.stats.fire_and_forget += 1)?;
        resolve_fork(id, Storage::Failed(RpcError::timeout("fire-and-forget request has no answer").into()))
            .map_err(RpcError::from_engine)?;
        trace!("{} sent as {} without waiting for an answer", handle, id);
        return Ok(id);
    }

    let timer = register_timer(deadline_after(timeout), move || on_timeout(id));
    with_client(|c| {
        c.pending.insert(
            id,
            PendingRequest {
                handle,
                timer,
                sent_at: Instant::now(),
            },
        );
        c.by_handle.insert(handle, id);
    })?;
    debug!("{} sent to {} as {}, timeout {:?}", handle, conn, id, timeout);
    Ok(id)
}

/// Transport callback: the answer for request `id` arrived.
pub fn on_reply(id: ForkId, bytes: Vec<u8>) {
    trace!("{}: reply of {} bytes", id, bytes.len());
    if settle(id, |stats| stats.answered += 1) {
        deliver(id, Storage::value(bytes));
    }
}

/// Transport callback: request `id` failed.
pub fn on_error(id: ForkId, code: i32, message: String) {
    debug!("{}: error {} ({})", id, code, message);
    if settle(id, |stats| stats.errors += 1) {
        deliver(id, Storage::Failed(RpcError::new(code, message).into()));
    }
}

fn on_timeout(id: ForkId) {
    let settled = with_client(|c| match c.forget(id) {
        Some(request) => {
            c.stats.timeouts += 1;
            warn!("{} ({}) timed out after {:?}", id, request.handle, request.sent_at.elapsed());
            true
        }
        None => false,
    })
    .unwrap_or(false);
    if settled {
        deliver(id, Storage::Failed(Failure::from(RpcError::timeout("rpc request timed out"))));
    }
}

/// Stop tracking `id`. False if it was already settled (late answer).
fn settle(id: ForkId, count: impl FnOnce(&mut RpcStats)) -> bool {
    let request = with_client(|c| {
        let request = c.forget(id);
        match request {
            Some(_) => count(&mut c.stats),
            None => c.stats.dropped_late += 1,
        }
        request
    })
    .ok()
    .flatten();

    let Some(request) = request else {
        debug!("{}: late answer dropped", id);
        return false;
    };
    cancel_timer(request.timer);
    true
}

fn deliver(id: ForkId, output: Storage) {
    if let Err(err) = resolve_fork(id, output) {
        warn!("cannot resolve {}: {}", id, err);
    }
}

/// Dispatches transport events while the engine waits.
struct RpcPoller;

impl NetworkPoller for RpcPoller {
    fn poll_network(&mut self, timeout: Duration) -> bool {
        let Ok(events) = with_client(|c| c.transport.poll(timeout)) else {
            std::thread::sleep(timeout);
            return false;
        };
        let progressed = !events.is_empty();
        for event in events {
            let id = with_client(|c| c.by_handle.get(&event.handle()).copied()).ok().flatten();
            let Some(id) = id else {
                debug!("{}: answer after timeout dropped", event.handle());
                let _ = with_client(|c| c.stats.dropped_late += 1);
                continue;
            };
            match event {
                NetEvent::Reply { bytes, .. } => on_reply(id, bytes),
                NetEvent::Error { code, message, .. } => on_error(id, code, message),
            }
        }
        progressed
    }

    fn is_idle(&self) -> bool {
        with_client(|c| c.pending.is_empty()).unwrap_or(true)
    }

    fn reset(&mut self) {
        reset_script();
    }
}
