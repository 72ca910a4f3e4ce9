// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative resumable engine for the compiled-PHP runtime.
//!
//! Gives generated code a sequential, single-threaded view over
//! asynchronous network I/O. Computations suspend only at explicit wait
//! points and are resumed later by the scheduler with their answer.
//!
//! Components:
//! - storage: the result cell of one suspended computation
//! - resumable: the state-machine contract and its execution context
//! - started/forked: call-chain records and background tasks
//! - wait_queue: fan-in over background tasks, in completion order
//! - scheduler: delivers finished results up call chains
//! - timer: wait timeouts, delayed yields, generic callbacks
//! - runtime: engine state, script lifecycle and the main-thread API

mod arena;
pub mod config;
pub mod error;
mod forked;
pub mod id;
pub mod resumable;
pub mod runtime;
pub mod scheduler;
mod started;
pub mod storage;
pub mod timer;
mod wait;
mod wait_queue;

pub use config::RuntimeConfig;
pub use error::{ConfigError, EngineError, Failure};
pub use id::{CallId, ForkId, Frame, QueueId};
pub use resumable::{from_fn, FnResumable, ResumeCx, Resumable};
pub use runtime::{
    cancel_timer, fork, fork_external, fork_result, fork_running_time, get_running_fork_id, init_global,
    init_script, is_fork_finished, register_timer, resolve_fork, sched_yield, set_network_poller, start, stats,
    take_network_poller, teardown_script, wait, wait_queue_create, wait_queue_create_from, wait_queue_destroy,
    wait_queue_is_empty, wait_queue_next, wait_queue_push, NetworkPoller, RuntimeStats,
};
pub use scheduler::run_scheduler;
pub use storage::Storage;
pub use timer::{deadline_after, TimerId};
