// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The seam to the network layer, plus an in-process loopback transport.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use log::trace;
use phprt_core::deadline_after;

use crate::connection::{Connection, NetHandle};
use crate::error::{RpcError, TL_ERROR_NO_CONNECTIONS};

/// Something the network reported for a request in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Reply { handle: NetHandle, bytes: Vec<u8> },
    Error { handle: NetHandle, code: i32, message: String },
}

impl NetEvent {
    pub fn handle(&self) -> NetHandle {
        match self {
            NetEvent::Reply { handle, .. } | NetEvent::Error { handle, .. } => *handle,
        }
    }
}

pub trait Transport {
    /// Hand `payload` to the network. Fails when it cannot be sent at all.
    fn send(&mut self, conn: &Connection, payload: &[u8], expect_answer: bool) -> Result<NetHandle, RpcError>;

    /// Wait up to `timeout` for events and return what arrived.
    fn poll(&mut self, timeout: Duration) -> Vec<NetEvent>;
}

/// How the loopback answers one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    Reply { after: Duration, bytes: Vec<u8> },
    Error { after: Duration, code: i32, message: String },
    /// Never answers.
    Silent,
    /// The send itself fails.
    Refuse,
}

pub type Responder = Box<dyn FnMut(&Connection, &[u8]) -> Scripted>;

/// Answers requests in-process after scripted delays. Stands in for the
/// real network in tests and local runs.
pub struct LoopbackTransport {
    responder: Responder,
    scheduled: BinaryHeap<Reverse<(Instant, u64)>>,
    events: Vec<Option<NetEvent>>,
    next_handle: u64,
}

impl LoopbackTransport {
    pub fn new(responder: impl FnMut(&Connection, &[u8]) -> Scripted + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            scheduled: BinaryHeap::new(),
            events: Vec::new(),
            next_handle: 0,
        }
    }

    /// Echo every payload back after `delay`.
    pub fn echo(delay: Duration) -> Self {
        Self::new(move |_, payload| Scripted::Reply {
            after: delay,
            bytes: payload.to_vec(),
        })
    }

    /// Replies scheduled and not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.scheduled.len()
    }

    fn schedule(&mut self, at: Instant, event: NetEvent) {
        let slot = self.events.len() as u64;
        self.events.push(Some(event));
        self.scheduled.push(Reverse((at, slot)));
    }

    fn take_due(&mut self, now: Instant) -> Vec<NetEvent> {
        let mut due = Vec::new();
        while let Some(Reverse((at, slot))) = self.scheduled.peek().copied() {
            if at > now {
                break;
            }
            self.scheduled.pop();
            if let Some(event) = self.events[slot as usize].take() {
                due.push(event);
            }
        }
        if self.scheduled.is_empty() {
            self.events.clear();
        }
        due
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, conn: &Connection, payload: &[u8], expect_answer: bool) -> Result<NetHandle, RpcError> {
        self.next_handle += 1;
        let handle = NetHandle(self.next_handle);

        match (self.responder)(conn, payload) {
            Scripted::Refuse => {
                return Err(RpcError::new(
                    TL_ERROR_NO_CONNECTIONS,
                    format!("no connection to {}", conn),
                ))
            }
            _ if !expect_answer => {}
            Scripted::Reply { after, bytes } => {
                self.schedule(deadline_after(after), NetEvent::Reply { handle, bytes })
            }
            Scripted::Error { after, code, message } => {
                self.schedule(deadline_after(after), NetEvent::Error { handle, code, message })
            }
            Scripted::Silent => {}
        }
        trace!("loopback: {} sent to {} ({} bytes)", handle, conn, payload.len());
        Ok(handle)
    }

    fn poll(&mut self, timeout: Duration) -> Vec<NetEvent> {
        let now = Instant::now();
        let wait = match self.scheduled.peek() {
            Some(Reverse((at, _))) => at.saturating_duration_since(now).min(timeout),
            None => timeout,
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        self.take_due(Instant::now())
    }
}
