// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Connection descriptors and transport handles.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Where requests go. The transport owns the actual sockets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub actor_id: i64,
    /// Per-connection default; `None` uses the client configuration.
    #[serde(default, with = "opt_millis")]
    pub timeout: Option<Duration>,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            actor_id: 0,
            timeout: None,
        }
    }

    pub fn with_actor_id(mut self, actor_id: i64) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if self.actor_id != 0 {
            write!(f, " (actor {})", self.actor_id)?;
        }
        Ok(())
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Transport-side identity of one request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetHandle(pub u64);

impl fmt::Display for NetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}
