//! Failures surfaced through [`SessionSnapshot::last_error`](crate::SessionSnapshot).

use crate::TransportError;

/// A failed session operation, kept in state until a later one replaces it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("pubsub transport is not available, start a node with pubsub enabled")]
    TransportUnavailable,
    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] TransportError),
    #[error("failed to resolve node identity: {0}")]
    Identity(#[source] TransportError),
    #[error("failed to publish: {0}")]
    Publish(#[source] TransportError),
}

impl SessionError {
    /// Whether the session can still be used after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::TransportUnavailable)
    }
}
