// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Response parsing.
//!
//! An answer is a JSON envelope, either `{"result": <value>}` or
//! `{"error": {"code": <int>, "message": <string>}}`.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{RpcError, TL_ERROR_SYNTAX};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Envelope<T> {
    Result(T),
    Error(RpcError),
}

/// Decode an answer into `T`.
pub fn fetch_typed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    let envelope: Envelope<T> = serde_json::from_slice(bytes)
        .map_err(|err| RpcError::new(TL_ERROR_SYNTAX, format!("cannot parse answer: {}", err)))?;
    match envelope {
        Envelope::Result(value) => Ok(value),
        Envelope::Error(err) => Err(err),
    }
}

/// Decode an answer without a schema.
pub fn fetch_untyped(bytes: &[u8]) -> Result<serde_json::Value, RpcError> {
    fetch_typed(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    #[test]
    fn typed_result() {
        let user: User = fetch_typed(br#"{"result": {"id": 3, "name": "ann"}}"#).unwrap();
        assert_eq!(
            user,
            User {
                id: 3,
                name: "ann".into()
            }
        );
    }

    #[test]
    fn untyped_result_and_remote_error() {
        assert_eq!(fetch_untyped(br#"{"result": [1, 2]}"#), Ok(json!([1, 2])));
        assert_eq!(
            fetch_untyped(br#"{"error": {"code": -2000, "message": "unknown function"}}"#),
            Err(RpcError::new(-2000, "unknown function"))
        );
    }

    #[test]
    fn garbage_is_a_syntax_error() {
        assert_eq!(fetch_untyped(b"\x00\x01").unwrap_err().code, TL_ERROR_SYNTAX);
        assert_eq!(fetch_typed::<User>(br#"{"result": {"id": "x"}}"#).unwrap_err().code, TL_ERROR_SYNTAX);
    }
}
