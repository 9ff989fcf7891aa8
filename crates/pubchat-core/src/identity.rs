//! Transport identity.
//!
//! The transport hands out one opaque handle per node. pubchat never parses
//! it; it is only stored, compared and displayed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle naming a node on the pubsub transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a transport-provided handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The handle as bytes, e.g. for building seqno prefixes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identity {
    fn from(handle: String) -> Self {
        Self(handle)
    }
}

impl From<&str> for Identity {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}
