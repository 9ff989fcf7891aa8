//! Wire envelopes and decoded messages.
//!
//! The transport delivers [`Envelope`]s; the session decodes them into
//! [`Message`]s before they reach the ledger.

use crate::Identity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Transport-assigned sequence identity. Compared byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seqno(Vec<u8>);

impl Seqno {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Raw unit delivered by the pubsub transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Peer that relayed the packet, when the transport reports one.
    pub from: Option<Identity>,
    pub seqno: Vec<u8>,
    pub data: Vec<u8>,
    pub topics: Vec<String>,
}

impl Envelope {
    pub fn new(seqno: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            from: None,
            seqno: seqno.into(),
            data: data.into(),
            topics: Vec::new(),
        }
    }

    pub fn with_from(mut self, from: Identity) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }
}

/// Error decoding an envelope payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded chat message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    seqno: Seqno,
    from: Option<Identity>,
    body: Value,
}

impl Message {
    pub fn new(seqno: Seqno, from: Option<Identity>, body: Value) -> Self {
        Self { seqno, from, body }
    }

    /// Decode an envelope. Any JSON document is accepted as the body; the
    /// `name`/`text` fields are read lazily by [`Message::sender`] and
    /// [`Message::text`].
    pub fn decode(envelope: Envelope) -> Result<Self, DecodeError> {
        let body = serde_json::from_slice(&envelope.data)?;
        Ok(Self {
            seqno: Seqno(envelope.seqno),
            from: envelope.from,
            body,
        })
    }

    pub fn seqno(&self) -> &Seqno {
        &self.seqno
    }

    /// Peer that relayed the message, as reported by the transport.
    pub fn peer(&self) -> Option<&Identity> {
        self.from.as_ref()
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Display name claimed by the sender. Untrusted.
    pub fn sender(&self) -> Option<&str> {
        self.body.get("name").and_then(Value::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        self.body.get("text").and_then(Value::as_str)
    }
}

/// Outbound chat record, published as a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub name: String,
    pub text: String,
}

impl ChatPayload {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("string fields always serialize")
    }
}
