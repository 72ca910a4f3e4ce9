// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! RPC error values and the TL error-code taxonomy.
//!
//! Codes are negative and grouped by thousands: syntax (-1xxx), semantic
//! (-2xxx), execution (-3xxx) and generic (-4xxx). Any other code is an
//! application error reported by the remote service.

use phprt_core::{EngineError, Failure, ForkId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Syntax
pub const TL_ERROR_SYNTAX: i32 = -1000;
pub const TL_ERROR_EXTRA_DATA: i32 = -1001;
pub const TL_ERROR_HEADER: i32 = -1002;
pub const TL_ERROR_WRONG_QUERY_ID: i32 = -1003;
pub const TL_ERROR_NOT_ENOUGH_ARGS: i32 = -1004;

// Semantic
pub const TL_ERROR_UNKNOWN_FUNCTION_ID: i32 = -2000;
pub const TL_ERROR_PROXY_NO_TARGET: i32 = -2001;
pub const TL_ERROR_WRONG_ACTOR_ID: i32 = -2002;
pub const TL_ERROR_TOO_LONG_STRING: i32 = -2003;
pub const TL_ERROR_VALUE_NOT_IN_RANGE: i32 = -2004;
pub const TL_ERROR_QUERY_INCORRECT: i32 = -2005;
pub const TL_ERROR_BAD_VALUE: i32 = -2006;
pub const TL_ERROR_FEATURE_DISABLED: i32 = -2008;

// Execution
pub const TL_ERROR_QUERY_TIMEOUT: i32 = -3000;
pub const TL_ERROR_PROXY_INVALID_RESPONSE: i32 = -3001;
pub const TL_ERROR_NO_CONNECTIONS: i32 = -3002;
pub const TL_ERROR_INTERNAL: i32 = -3003;
pub const TL_ERROR_AIO_FAIL: i32 = -3004;
pub const TL_ERROR_AIO_TIMEOUT: i32 = -3005;
pub const TL_ERROR_NOT_READY: i32 = -3010;

// Generic
pub const TL_ERROR_UNKNOWN: i32 = -4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Syntax,
    Semantic,
    Execution,
    Generic,
    Application,
}

impl ErrorClass {
    pub fn of(code: i32) -> Self {
        match code {
            -1999..=-1000 => ErrorClass::Syntax,
            -2999..=-2000 => ErrorClass::Semantic,
            -3999..=-3000 => ErrorClass::Execution,
            -4999..=-4000 => ErrorClass::Generic,
            _ => ErrorClass::Application,
        }
    }
}

/// Structured RPC error: what a failed request resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TL_ERROR_QUERY_TIMEOUT, message)
    }

    pub fn no_answer(id: ForkId) -> Self {
        Self::new(TL_ERROR_WRONG_QUERY_ID, format!("no answer for {}", id))
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::of(self.code)
    }

    /// Map an engine error on a request id into the taxonomy.
    pub fn from_engine(err: EngineError) -> Self {
        match err {
            EngineError::Failed(failure) => failure.into(),
            EngineError::NotFinished(id) => Self::timeout(format!("request {} has no answer yet", id)),
            EngineError::UnknownQueue(_) | EngineError::QueueAlreadyWaited(_) => {
                Self::new(TL_ERROR_INTERNAL, err.to_string())
            }
            other => Self::new(TL_ERROR_WRONG_QUERY_ID, other.to_string()),
        }
    }
}

impl From<RpcError> for Failure {
    fn from(err: RpcError) -> Self {
        Failure::new(i64::from(err.code), err.message)
    }
}

impl From<Failure> for RpcError {
    fn from(failure: Failure) -> Self {
        let code = i32::try_from(failure.code).unwrap_or(TL_ERROR_UNKNOWN);
        RpcError::new(code, failure.message)
    }
}
