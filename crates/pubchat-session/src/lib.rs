//! Chat session state for a single pubsub topic.
//!
//! [`ChatSession`] owns the conversation state, ingests envelopes from a
//! [`PubSub`] transport and turns user actions into publish calls. Observers
//! receive a [`SessionSnapshot`] after every logical state change.

mod config;
mod error;
mod memory;
mod session;
mod store;
mod transport;

pub use config::{ConfigError, SessionConfig};
pub use error::SessionError;
pub use memory::{MemoryHub, MemoryNode};
pub use session::{ChatSession, SessionSnapshot};
pub use store::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use transport::{EnvelopeHandler, PubSub, TransportError, TransportProvider, TransportSlot};

pub use pubchat_core::{ChatPayload, Envelope, Identity, Message, MessageLedger, Seqno};
