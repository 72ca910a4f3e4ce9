// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Typed handles for engine records.
//!
//! Every record lives in a generational arena and is referenced by a
//! `(slot, generation)` pair. Call-chain records, background tasks and
//! wait queues each get their own newtype, so a background id can never
//! be passed where a call-chain id is expected.

use std::fmt;

/// Raw arena handle. Generations are unique per arena for the whole
/// process, which is what lets a stale handle be told apart from a
/// recycled slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Handle {
    pub slot: u32,
    pub generation: u64,
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub(crate) Handle);

        impl $name {
            /// Arena slot this handle points at.
            pub fn slot(&self) -> u32 {
                self.0.slot
            }

            /// Allocation generation of the record.
            pub fn generation(&self) -> u64 {
                self.0.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}.{}", $prefix, self.0.slot, self.0.generation)
            }
        }
    };
}

handle_type!(
    /// A call-chain ("started") record: one suspended frame of a nested call.
    CallId,
    "call"
);

handle_type!(
    /// A background ("forked") task: nobody is necessarily waiting on it yet.
    ForkId,
    "fork"
);

handle_type!(
    /// A wait queue over a set of background tasks.
    QueueId,
    "queue"
);

/// The computation currently executing, or the parent a finished call
/// delivers its result into.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Frame {
    /// Plain code on the main thread (not inside any resumable).
    Main,
    Call(CallId),
    Fork(ForkId),
}

impl Frame {
    pub fn is_main(&self) -> bool {
        matches!(self, Frame::Main)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Main => write!(f, "main"),
            Frame::Call(id) => id.fmt(f),
            Frame::Fork(id) => id.fmt(f),
        }
    }
}
