//! Chat session state machine.
//!
//! Lifecycle: `startup` subscribes to the topic and resolves the node
//! identity, user actions edit the name and draft, `send` publishes the draft,
//! and `shutdown` drops the subscription. Inbound envelopes are decoded and
//! deduplicated into the ledger as they arrive.

use crate::{
    EnvelopeHandler, KeyValueStore, PubSub, SessionConfig, SessionError, TransportError,
    TransportProvider,
};
use pubchat_core::{ChatPayload, Envelope, Identity, Message, MessageLedger};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

/// Snapshots buffered per observer before the oldest are dropped.
const NOTIFY_CAPACITY: usize = 64;

/// Read-only copy of the session state, sent to observers on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub identity: Option<Identity>,
    pub display_name: String,
    pub draft_text: String,
    /// Newest first. Shared with the session, not copied per snapshot.
    pub messages: Arc<[Arc<Message>]>,
    pub posting: bool,
    pub subscribed: bool,
    pub last_error: Option<SessionError>,
}

struct SessionState {
    identity: Option<Identity>,
    display_name: String,
    draft_text: String,
    messages: MessageLedger,
    /// Last view taken of `messages`, refreshed on accept.
    view: Arc<[Arc<Message>]>,
    /// Resolved by `startup`.
    transport: Option<Arc<dyn PubSub>>,
    posting: bool,
    subscribed: bool,
    last_error: Option<SessionError>,
    started: bool,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity.clone(),
            display_name: self.display_name.clone(),
            draft_text: self.draft_text.clone(),
            messages: self.view.clone(),
            posting: self.posting,
            subscribed: self.subscribed,
            last_error: self.last_error.clone(),
        }
    }
}

/// State shared with the inbound handler the transport holds.
struct Shared {
    state: Mutex<SessionState>,
    observers: broadcast::Sender<SessionSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, state: &SessionState) {
        // No receivers is fine; nobody is rendering.
        let _ = self.observers.send(state.snapshot());
    }

    fn ingest(&self, envelope: Envelope) {
        let message = match Message::decode(envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid message data");
                return;
            }
        };

        let seqno = message.seqno().clone();
        let mut state = self.lock();
        if !state.messages.try_insert(message) {
            tracing::trace!(%seqno, "Duplicate message dropped");
            return;
        }
        state.view = state.messages.view();
        tracing::debug!(%seqno, total = state.messages.len(), "Message accepted");
        self.notify(&state);
    }
}

/// Owner of the chat state for one topic.
pub struct ChatSession {
    config: SessionConfig,
    provider: Arc<dyn TransportProvider>,
    store: Arc<dyn KeyValueStore>,
    shared: Arc<Shared>,
    handler: EnvelopeHandler,
}

impl ChatSession {
    /// Create a session. `provider` is not asked for a transport until
    /// [`ChatSession::startup`] runs.
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn TransportProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let display_name = store
            .get(&config.name_key)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| config.default_name.clone());

        let (observers, _) = broadcast::channel(NOTIFY_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                identity: None,
                display_name,
                draft_text: String::new(),
                messages: MessageLedger::with_capacity(config.history_limit),
                view: Arc::new([]),
                transport: None,
                posting: false,
                subscribed: false,
                last_error: None,
                started: false,
            }),
            observers,
        });

        // Weak so the transport's copy of the handler doesn't keep the state alive.
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let handler: EnvelopeHandler = Arc::new(move |envelope| {
            if let Some(shared) = weak.upgrade() {
                shared.ingest(envelope);
            }
        });

        Self {
            config,
            provider,
            store,
            shared,
            handler,
        }
    }

    /// Register an observer. Each logical state change sends one snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.shared.observers.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Entry point for envelopes delivered on the topic.
    pub fn on_transport_message(&self, envelope: Envelope) {
        self.shared.ingest(envelope);
    }

    /// Subscribe to the topic and resolve the node identity.
    ///
    /// Runs once; later calls do nothing. Emits a single notification after
    /// both steps, whatever their outcome.
    pub async fn startup(&self) {
        {
            let mut state = self.shared.lock();
            if state.started {
                tracing::debug!("Startup already ran");
                return;
            }
            state.started = true;
        }

        let Some(transport) = self.provider.transport() else {
            let err = SessionError::TransportUnavailable;
            tracing::error!(error = %err, "Cannot start chat session");
            let mut state = self.shared.lock();
            state.subscribed = false;
            state.last_error = Some(err);
            self.shared.notify(&state);
            return;
        };

        self.shared.lock().transport = Some(transport.clone());

        let topic = self.config.topic.as_str();
        let subscribed = transport.subscribe(topic, self.handler.clone()).await;
        {
            let mut state = self.shared.lock();
            match subscribed {
                Ok(()) => {
                    tracing::info!(topic, "Subscribed");
                    state.subscribed = true;
                }
                Err(e) => {
                    tracing::error!(topic, error = %e, "Failed to subscribe");
                    state.subscribed = false;
                    state.last_error = Some(SessionError::Subscribe(e));
                }
            }
        }

        let identity = transport.id().await;
        let mut state = self.shared.lock();
        match identity {
            Ok(id) => {
                tracing::info!(identity = %id, "Resolved node identity");
                state.identity = Some(id);
            }
            Err(e) => {
                tracing::error!(error = %SessionError::Identity(e), "Failed to get node ID");
            }
        }
        self.shared.notify(&state);
    }

    /// Drop the topic subscription. Failures are ignored.
    pub async fn shutdown(&self) {
        let Some(transport) = self.shared.lock().transport.clone() else {
            return;
        };
        if let Err(e) = transport
            .unsubscribe(&self.config.topic, &self.handler)
            .await
        {
            tracing::debug!(error = %e, "Unsubscribe failed during shutdown");
        }
    }

    /// Change and persist the display name. Any string is accepted.
    pub fn set_display_name(&self, name: impl Into<String>) {
        let name = name.into();
        if let Err(e) = self.store.set(&self.config.name_key, &name) {
            tracing::warn!(error = %e, "Failed to persist display name");
        }
        let mut state = self.shared.lock();
        state.display_name = name;
        self.shared.notify(&state);
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        let mut state = self.shared.lock();
        state.draft_text = text.into();
        self.shared.notify(&state);
    }

    /// Publish the current draft.
    ///
    /// Does nothing unless subscribed with a non-empty draft and no publish
    /// already in flight. The draft is cleared only when the publish succeeds.
    pub async fn send(&self) {
        let (transport, payload) = {
            let mut state = self.shared.lock();
            if !state.subscribed || state.draft_text.is_empty() || state.posting {
                tracing::trace!(
                    subscribed = state.subscribed,
                    posting = state.posting,
                    "Send ignored"
                );
                return;
            }
            let Some(transport) = state.transport.clone() else {
                return;
            };
            state.posting = true;
            self.shared.notify(&state);
            (
                transport,
                ChatPayload::new(state.display_name.clone(), state.draft_text.clone()),
            )
        };

        let published: Result<(), TransportError> = transport
            .publish(&self.config.topic, payload.to_bytes())
            .await;

        let mut state = self.shared.lock();
        match published {
            Ok(()) => state.draft_text.clear(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to publish");
                state.last_error = Some(SessionError::Publish(e));
            }
        }
        state.posting = false;
        self.shared.notify(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryHub, MemoryNode, MemoryStore, StorageError, TransportSlot};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Peer {
        node: Arc<MemoryNode>,
        store: Arc<MemoryStore>,
        session: ChatSession,
        rx: broadcast::Receiver<SessionSnapshot>,
    }

    fn peer(hub: &MemoryHub, id: &str) -> Peer {
        peer_with(hub, id, SessionConfig::default())
    }

    fn peer_with(hub: &MemoryHub, id: &str, config: SessionConfig) -> Peer {
        let node = Arc::new(hub.node(id));
        let store = Arc::new(MemoryStore::new());
        let transport: Arc<dyn PubSub> = node.clone();
        let session = ChatSession::new(
            config,
            Arc::new(TransportSlot::with(transport)),
            store.clone(),
        );
        let rx = session.subscribe();
        Peer {
            node,
            store,
            session,
            rx,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionSnapshot>) -> Vec<SessionSnapshot> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(snapshot) => out.push(snapshot),
                Err(TryRecvError::Empty) => return out,
                Err(e) => panic!("observer error: {e}"),
            }
        }
    }

    fn chat(seqno: &[u8], name: &str, text: &str) -> Envelope {
        Envelope::new(seqno.to_vec(), ChatPayload::new(name, text).to_bytes())
    }

    #[tokio::test]
    async fn startup_subscribes_and_resolves_identity() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");

        p.session.startup().await;

        let notes = drain(&mut p.rx);
        assert_eq!(notes.len(), 1);
        let snap = &notes[0];
        assert!(snap.subscribed);
        assert_eq!(snap.identity, Some(Identity::new("QmA")));
        assert_eq!(snap.last_error, None);
        assert_eq!(hub.subscriber_count("chat"), 1);
    }

    #[tokio::test]
    async fn startup_without_transport() {
        let session = ChatSession::new(
            SessionConfig::default(),
            Arc::new(TransportSlot::empty()),
            Arc::new(MemoryStore::new()),
        );
        let mut rx = session.subscribe();

        session.startup().await;

        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 1);
        assert!(!notes[0].subscribed);
        assert_eq!(notes[0].last_error, Some(SessionError::TransportUnavailable));
        assert_eq!(notes[0].identity, None);
    }

    #[tokio::test]
    async fn subscribe_failure_still_resolves_identity() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.node.fail_subscribe(true);

        p.session.startup().await;

        let notes = drain(&mut p.rx);
        assert_eq!(notes.len(), 1);
        assert!(!notes[0].subscribed);
        assert!(matches!(notes[0].last_error, Some(SessionError::Subscribe(_))));
        assert_eq!(notes[0].identity, Some(Identity::new("QmA")));
        assert_eq!(p.node.call_count(), 2);
    }

    #[tokio::test]
    async fn identity_failure_is_not_recorded() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.node.fail_id(true);

        p.session.startup().await;

        let snap = p.session.snapshot();
        assert!(snap.subscribed);
        assert_eq!(snap.identity, None);
        assert_eq!(snap.last_error, None);
        assert_eq!(drain(&mut p.rx).len(), 1);
    }

    #[tokio::test]
    async fn identity_failure_keeps_subscribe_error() {
        let hub = MemoryHub::new();
        let p = peer(&hub, "QmA");
        p.node.fail_subscribe(true);
        p.node.fail_id(true);

        p.session.startup().await;

        assert!(matches!(
            p.session.snapshot().last_error,
            Some(SessionError::Subscribe(_))
        ));
    }

    #[tokio::test]
    async fn startup_runs_once() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");

        p.session.startup().await;
        p.session.startup().await;

        assert_eq!(p.node.call_count(), 2);
        assert_eq!(hub.subscriber_count("chat"), 1);
        assert_eq!(drain(&mut p.rx).len(), 1);
    }

    #[tokio::test]
    async fn send_success_clears_draft() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.session.startup().await;
        p.session.set_display_name("alice");
        p.session.set_draft("hello");
        drain(&mut p.rx);

        p.session.send().await;

        let notes = drain(&mut p.rx);
        // posting, own message echoed back, done
        assert_eq!(notes.len(), 3);
        assert!(notes[0].posting);
        assert_eq!(notes[0].draft_text, "hello");
        assert_eq!(notes[1].messages.len(), 1);
        let last = &notes[2];
        assert!(!last.posting);
        assert_eq!(last.draft_text, "");
        assert_eq!(last.last_error, None);
        assert_eq!(last.messages[0].sender(), Some("alice"));
        assert_eq!(last.messages[0].text(), Some("hello"));
    }

    #[tokio::test]
    async fn send_failure_preserves_draft() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.session.startup().await;
        p.session.set_draft("hello");
        p.node.fail_publish(true);
        drain(&mut p.rx);

        p.session.send().await;

        let notes = drain(&mut p.rx);
        assert_eq!(notes.len(), 2);
        let snap = p.session.snapshot();
        assert_eq!(snap.draft_text, "hello");
        assert!(!snap.posting);
        assert!(matches!(snap.last_error, Some(SessionError::Publish(_))));
        assert!(snap.messages.is_empty());
    }

    #[tokio::test]
    async fn send_retry_after_failure() {
        let hub = MemoryHub::new();
        let p = peer(&hub, "QmA");
        p.session.startup().await;
        p.session.set_draft("again");
        p.node.fail_publish(true);
        p.session.send().await;

        p.node.fail_publish(false);
        p.session.send().await;

        let snap = p.session.snapshot();
        assert_eq!(snap.draft_text, "");
        assert_eq!(snap.messages.len(), 1);
        // Not cleared by the later success.
        assert!(matches!(snap.last_error, Some(SessionError::Publish(_))));
    }

    #[tokio::test]
    async fn send_guard_when_not_subscribed() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.session.set_draft("hello");
        drain(&mut p.rx);
        let before = p.session.snapshot();

        p.session.send().await;

        assert_eq!(p.node.call_count(), 0);
        assert_eq!(p.session.snapshot(), before);
        assert!(drain(&mut p.rx).is_empty());
    }

    #[tokio::test]
    async fn send_guard_with_empty_draft() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.session.startup().await;
        drain(&mut p.rx);
        let calls = p.node.call_count();
        let before = p.session.snapshot();

        p.session.send().await;

        assert_eq!(p.node.call_count(), calls);
        assert_eq!(p.session.snapshot(), before);
        assert!(drain(&mut p.rx).is_empty());
    }

    #[tokio::test]
    async fn malformed_envelope_is_isolated() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.session.startup().await;
        drain(&mut p.rx);

        hub.inject("chat", Envelope::new(b"bad".to_vec(), b"not json".to_vec()));
        hub.inject("chat", chat(b"good", "bob", "hi"));

        let notes = drain(&mut p.rx);
        assert_eq!(notes.len(), 1);
        let snap = p.session.snapshot();
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].text(), Some("hi"));
        assert_eq!(snap.last_error, None);
    }

    #[tokio::test]
    async fn duplicate_envelope_is_silent() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.session.startup().await;
        drain(&mut p.rx);

        hub.inject("chat", chat(b"same", "bob", "first"));
        hub.inject("chat", chat(b"same", "mallory", "replay"));

        assert_eq!(drain(&mut p.rx).len(), 1);
        let snap = p.session.snapshot();
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].sender(), Some("bob"));
    }

    #[test]
    fn direct_ingest_orders_newest_first() {
        let hub = MemoryHub::new();
        let p = peer(&hub, "QmA");

        for (seq, text) in [(b"a", "A"), (b"b", "B"), (b"c", "C")] {
            p.session.on_transport_message(chat(seq, "x", text));
        }

        let texts: Vec<_> = p
            .session
            .snapshot()
            .messages
            .iter()
            .filter_map(|m| m.text().map(str::to_string))
            .collect();
        assert_eq!(texts, ["C", "B", "A"]);
    }

    #[tokio::test]
    async fn peers_see_each_other() {
        let hub = MemoryHub::new();
        let a = peer(&hub, "QmA");
        let b = peer(&hub, "QmB");
        a.session.startup().await;
        b.session.startup().await;

        b.session.set_display_name("bob");
        b.session.set_draft("hey alice");
        b.session.send().await;

        let seen = a.session.snapshot();
        assert_eq!(seen.messages.len(), 1);
        assert_eq!(seen.messages[0].sender(), Some("bob"));
        assert_eq!(seen.messages[0].peer(), Some(&Identity::new("QmB")));
    }

    #[tokio::test]
    async fn history_limit_from_config() {
        let hub = MemoryHub::new();
        let config = SessionConfig {
            history_limit: 3,
            ..SessionConfig::default()
        };
        let p = peer_with(&hub, "QmA", config);
        p.session.startup().await;

        for i in 0u8..5 {
            hub.inject("chat", chat(&[i], "x", &i.to_string()));
        }

        let snap = p.session.snapshot();
        assert_eq!(snap.messages.len(), 3);
        assert_eq!(snap.messages[0].text(), Some("4"));
        assert_eq!(snap.messages[2].text(), Some("2"));
    }

    #[test]
    fn display_name_is_persisted() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        assert_eq!(p.session.snapshot().display_name, "anonymous coward");

        p.session.set_display_name("carol");

        assert_eq!(p.store.get("name").as_deref(), Some("carol"));
        assert_eq!(drain(&mut p.rx).len(), 1);

        let transport: Arc<dyn PubSub> = p.node.clone();
        let reloaded = ChatSession::new(
            SessionConfig::default(),
            Arc::new(TransportSlot::with(transport)),
            p.store.clone(),
        );
        assert_eq!(reloaded.snapshot().display_name, "carol");
    }

    #[test]
    fn empty_stored_name_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.set("name", "").unwrap();
        let session =
            ChatSession::new(SessionConfig::default(), Arc::new(TransportSlot::empty()), store);
        assert_eq!(session.snapshot().display_name, "anonymous coward");
    }

    #[test]
    fn draft_edit_notifies() {
        let hub = MemoryHub::new();
        let mut p = peer(&hub, "QmA");
        p.session.set_draft("typing");
        let notes = drain(&mut p.rx);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].draft_text, "typing");
    }

    #[tokio::test]
    async fn shutdown_unsubscribes() {
        let hub = MemoryHub::new();
        let p = peer(&hub, "QmA");
        p.session.startup().await;
        assert_eq!(hub.subscriber_count("chat"), 1);

        p.session.shutdown().await;

        assert_eq!(hub.subscriber_count("chat"), 0);
        hub.inject("chat", chat(b"late", "bob", "anyone?"));
        assert!(p.session.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn transport_is_looked_up_at_startup() {
        let hub = MemoryHub::new();
        let slot = Arc::new(TransportSlot::empty());
        let session = ChatSession::new(
            SessionConfig::default(),
            slot.clone(),
            Arc::new(MemoryStore::new()),
        );

        // Node comes up after the session was created.
        let node: Arc<dyn PubSub> = Arc::new(hub.node("QmLate"));
        slot.set(node);
        session.startup().await;

        let snap = session.snapshot();
        assert!(snap.subscribed);
        assert_eq!(snap.last_error, None);
        assert_eq!(snap.identity, Some(Identity::new("QmLate")));

        session.set_draft("made it");
        session.send().await;
        assert_eq!(session.snapshot().messages.len(), 1);
    }

    /// Publishes wait on `gate` before reaching the mesh.
    struct GatedPublish {
        inner: MemoryNode,
        gate: Arc<Notify>,
        publishes: AtomicUsize,
    }

    #[async_trait]
    impl PubSub for GatedPublish {
        async fn subscribe(
            &self,
            topic: &str,
            handler: EnvelopeHandler,
        ) -> Result<(), TransportError> {
            self.inner.subscribe(topic, handler).await
        }

        async fn unsubscribe(
            &self,
            topic: &str,
            handler: &EnvelopeHandler,
        ) -> Result<(), TransportError> {
            self.inner.unsubscribe(topic, handler).await
        }

        async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.inner.publish(topic, data).await
        }

        async fn id(&self) -> Result<Identity, TransportError> {
            self.inner.id().await
        }
    }

    #[tokio::test]
    async fn send_ignored_while_posting() {
        let hub = MemoryHub::new();
        let gate = Arc::new(Notify::new());
        let gated = Arc::new(GatedPublish {
            inner: hub.node("QmA"),
            gate: gate.clone(),
            publishes: AtomicUsize::new(0),
        });
        let transport: Arc<dyn PubSub> = gated.clone();
        let session = Arc::new(ChatSession::new(
            SessionConfig::default(),
            Arc::new(TransportSlot::with(transport)),
            Arc::new(MemoryStore::new()),
        ));
        session.startup().await;
        session.set_draft("first");

        let in_flight = tokio::spawn({
            let session = session.clone();
            async move { session.send().await }
        });
        while !session.snapshot().posting {
            tokio::task::yield_now().await;
        }

        session.send().await;
        assert_eq!(gated.publishes.load(Ordering::SeqCst), 1);

        gate.notify_one();
        in_flight.await.unwrap();

        let snap = session.snapshot();
        assert!(!snap.posting);
        assert_eq!(snap.draft_text, "");
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(gated.publishes.load(Ordering::SeqCst), 1);
    }

    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Option<String> {
            None
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("read-only")))
        }
    }

    #[test]
    fn name_change_survives_store_failure() {
        let session = ChatSession::new(
            SessionConfig::default(),
            Arc::new(TransportSlot::empty()),
            Arc::new(ReadOnlyStore),
        );
        let mut rx = session.subscribe();

        session.set_display_name("zed");

        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].display_name, "zed");
        assert_eq!(session.snapshot().display_name, "zed");
    }
}
