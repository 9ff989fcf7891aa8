//! In-process pubsub network.
//!
//! A [`MemoryHub`] plays the part of the pubsub mesh: every [`MemoryNode`]
//! created from it can subscribe and publish, and published envelopes are
//! delivered synchronously to every handler on the topic, the publisher's
//! own included. Nodes can be told to fail individual calls.

use crate::{EnvelopeHandler, PubSub, TransportError};
use async_trait::async_trait;
use pubchat_core::{Envelope, Identity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct HubState {
    topics: HashMap<String, Vec<EnvelopeHandler>>,
}

/// Shared in-memory pubsub mesh.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the mesh as a node with the given identity.
    pub fn node(&self, identity: impl Into<Identity>) -> MemoryNode {
        MemoryNode {
            hub: self.clone(),
            identity: identity.into(),
            next_seq: AtomicU64::new(1),
            calls: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_id: AtomicBool::new(false),
        }
    }

    /// Deliver a raw envelope to every handler on `topic`.
    ///
    /// Returns the number of handlers reached.
    pub fn inject(&self, topic: &str, envelope: Envelope) -> usize {
        let handlers = self
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            handler(envelope.clone());
        }
        tracing::trace!(topic, delivered = handlers.len(), "envelope delivered");
        handlers.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One participant in a [`MemoryHub`].
pub struct MemoryNode {
    hub: MemoryHub,
    identity: Identity,
    next_seq: AtomicU64,
    calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    fail_id: AtomicBool,
}

impl MemoryNode {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Total number of transport calls made against this node.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_id(&self, fail: bool) {
        self.fail_id.store(fail, Ordering::SeqCst);
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn next_seqno(&self) -> Vec<u8> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut seqno = self.identity.as_bytes().to_vec();
        seqno.extend_from_slice(&seq.to_be_bytes());
        seqno
    }
}

#[async_trait]
impl PubSub for MemoryNode {
    async fn subscribe(
        &self,
        topic: &str,
        handler: EnvelopeHandler,
    ) -> Result<(), TransportError> {
        self.record_call();
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!(
                "subscribe to {topic} refused"
            )));
        }
        self.hub
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        topic: &str,
        handler: &EnvelopeHandler,
    ) -> Result<(), TransportError> {
        self.record_call();
        let mut hub = self.hub.lock();
        if let Some(handlers) = hub.topics.get_mut(topic) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
            if handlers.is_empty() {
                hub.topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.record_call();
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!(
                "publish to {topic} refused"
            )));
        }
        let envelope = Envelope::new(self.next_seqno(), data)
            .with_from(self.identity.clone())
            .with_topic(topic);
        self.hub.inject(topic, envelope);
        Ok(())
    }

    async fn id(&self) -> Result<Identity, TransportError> {
        self.record_call();
        if self.fail_id.load(Ordering::SeqCst) {
            return Err(TransportError::Unsupported);
        }
        Ok(self.identity.clone())
    }
}
