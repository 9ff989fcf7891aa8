//! Pubsub transport contract.

use async_trait::async_trait;
use pubchat_core::{Envelope, Identity};
use std::sync::{Arc, PoisonError, RwLock};

/// Callback invoked for every envelope delivered on a subscribed topic.
///
/// Unsubscribing matches the handler by pointer, so keep the `Arc` that was
/// passed to [`PubSub::subscribe`].
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Error reported by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("pubsub is not supported by this node")]
    Unsupported,
    #[error("transport rejected the call: {0}")]
    Rejected(String),
    #[error("transport is closed")]
    Closed,
}

/// Capabilities the session needs from the pubsub node.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, topic: &str, handler: EnvelopeHandler)
    -> Result<(), TransportError>;

    /// Best-effort removal of a handler added by [`PubSub::subscribe`].
    async fn unsubscribe(
        &self,
        topic: &str,
        handler: &EnvelopeHandler,
    ) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// This node's identity on the transport.
    async fn id(&self) -> Result<Identity, TransportError>;
}

/// Source of the transport, queried when the session starts.
///
/// The node may come up after the session is created; [`ChatSession::startup`]
/// asks the provider at that point and keeps whatever it returns.
///
/// [`ChatSession::startup`]: crate::ChatSession::startup
pub trait TransportProvider: Send + Sync {
    fn transport(&self) -> Option<Arc<dyn PubSub>>;
}

/// A transport handle that can be filled in after construction.
#[derive(Default)]
pub struct TransportSlot {
    inner: RwLock<Option<Arc<dyn PubSub>>>,
}

impl TransportSlot {
    /// A slot with no transport yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(transport: Arc<dyn PubSub>) -> Self {
        Self {
            inner: RwLock::new(Some(transport)),
        }
    }

    pub fn set(&self, transport: Arc<dyn PubSub>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }
}

impl TransportProvider for TransportSlot {
    fn transport(&self) -> Option<Arc<dyn PubSub>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
