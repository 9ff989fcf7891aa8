//! Core types for pubchat.
//!
//! This crate provides the message model and the bounded history. It does no
//! I/O; the session crate feeds it envelopes and reads its views.

mod identity;
mod ledger;
mod message;

pub use identity::Identity;
pub use ledger::{DEFAULT_HISTORY_LIMIT, MessageLedger};
pub use message::{ChatPayload, DecodeError, Envelope, Message, Seqno};

/// Topic all chat traffic is published on unless configured otherwise.
pub const DEFAULT_TOPIC: &str = "chat";
