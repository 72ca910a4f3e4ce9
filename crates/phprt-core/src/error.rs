// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Engine errors.
//!
//! Invariant violations (double child, double load, resuming a record
//! that is not suspended) are panics. Everything here is recoverable and
//! crosses suspension points as a value.

use thiserror::Error;

use crate::id::{ForkId, QueueId};

/// Application failure captured by a resumable and re-raised where its
/// result is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct Failure {
    pub code: i64,
    pub message: String,
}

impl Failure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Recoverable errors reported by the background-task and wait-queue API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("resumable {0} does not exist")]
    UnknownFork(ForkId),

    #[error("resumable {0} belongs to a previous script")]
    ExpiredFork(ForkId),

    #[error("result of resumable {0} was already gotten")]
    AlreadyGotten(ForkId),

    #[error("resumable {0} is already waited by someone else")]
    AlreadyWaited(ForkId),

    #[error("resumable {0} has not finished yet")]
    NotFinished(ForkId),

    /// The caller asked for a different result type than the task produced.
    #[error("result of resumable {0} has a different type")]
    WrongResultType(ForkId),

    #[error("resumable {0} is not bound to an external event")]
    NotExternal(ForkId),

    #[error("resumable {0} was already resolved")]
    AlreadyResolved(ForkId),

    #[error("wait queue {0} does not exist")]
    UnknownQueue(QueueId),

    #[error("wait queue {0} is already waited by someone else")]
    QueueAlreadyWaited(QueueId),

    /// The task finished with an application failure.
    #[error(transparent)]
    Failed(#[from] Failure),
}

/// Errors while loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("environment variable {var} has invalid value `{value}`")]
    InvalidEnv { var: String, value: String },
}
