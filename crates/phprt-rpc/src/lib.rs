// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! RPC client on top of the resumable engine.
//!
//! A request becomes an external background task resolved by the network
//! reply, a transport error or its timeout. Callers wait on one answer
//! ([`wait_for_result`]) or many ([`query_many`]) from inside resumables,
//! or block the main thread with the `_synchronously` forms.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetch;
pub mod get;
pub mod query;
pub mod transport;

pub use client::{install, on_error, on_reply, reset_script, send, stats, RpcStats};
pub use config::RpcConfig;
pub use connection::{Connection, NetHandle};
pub use error::{ErrorClass, RpcError};
pub use fetch::{fetch_typed, fetch_untyped};
pub use get::{rpc_get_synchronously, wait_for_result, RpcGet};
pub use query::{query_many, query_many_synchronously, QueryMany, RpcAnswer};
pub use transport::{LoopbackTransport, NetEvent, Scripted, Transport};
