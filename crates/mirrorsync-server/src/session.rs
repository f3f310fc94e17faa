//! Client sessions and the invocation context of a method call.
//!
//! A [`Session`] is the server's handle on one connected client: it can push
//! wire messages and knows which documents the client already sees through
//! its regular subscriptions. An [`Invocation`] describes the call currently
//! running: which session made it and whether that session asked for live
//! mutation notifications.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use mirrorsync_types::{DocId, WireMessage};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// One connected client.
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    /// Push a message to the client. Delivery to a closed connection is a no-op.
    fn send(&self, message: WireMessage);

    /// True if the client's regular subscriptions already publish this
    /// document, in which case mutation notifications would duplicate them.
    fn tracks_document(&self, _collection: &str, _id: &DocId) -> bool {
        false
    }
}

/// A session delivering into an unbounded channel.
///
/// The receiving half is whatever forwards messages to the client; in tests it
/// is read directly.
pub struct ChannelSession {
    id: String,
    tx: mpsc::UnboundedSender<WireMessage>,
    tracked: RwLock<HashSet<(String, DocId)>>,
}

impl ChannelSession {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: Uuid::new_v4().as_simple().to_string(),
            tx,
            tracked: RwLock::new(HashSet::new()),
        });
        (session, rx)
    }

    /// Record that a regular subscription publishes this document to the client.
    pub fn track(&self, collection: impl Into<String>, id: impl Into<DocId>) {
        self.tracked.write().insert((collection.into(), id.into()));
    }

    pub fn untrack(&self, collection: &str, id: &DocId) {
        self.tracked.write().remove(&(collection.to_string(), id.clone()));
    }
}

impl Session for ChannelSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, message: WireMessage) {
        trace!(session = %self.id, kind = %message.kind(), id = %message.id(), "send");
        let _ = self.tx.send(message);
    }

    fn tracks_document(&self, collection: &str, id: &DocId) -> bool {
        self.tracked.read().contains(&(collection.to_string(), id.clone()))
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession").field("id", &self.id).finish()
    }
}

/// Context of the method call currently executing.
#[derive(Clone, Default)]
pub struct Invocation {
    session: Option<Arc<dyn Session>>,
    mutation_updates: bool,
}

impl Invocation {
    /// A call without live mutation notifications.
    pub fn plain(session: Arc<dyn Session>) -> Self {
        Self { session: Some(session), mutation_updates: false }
    }

    /// A call whose session asked for live mutation notifications.
    pub fn enhanced(session: Arc<dyn Session>) -> Self {
        Self { session: Some(session), mutation_updates: true }
    }

    /// Server-initiated work with no client attached.
    pub fn server() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    pub fn wants_mutation_updates(&self) -> bool {
        self.mutation_updates
    }

    /// The session to notify, if this call should produce mutation messages.
    pub fn notification_session(&self) -> Option<Arc<dyn Session>> {
        if self.mutation_updates {
            self.session.clone()
        } else {
            None
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .field("mutation_updates", &self.mutation_updates)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_channel_session_delivers_and_tracks() {
        let (session, mut rx) = ChannelSession::new();
        session.send(WireMessage::Removed { collection: "posts".into(), id: DocId::from("1") });
        assert!(matches!(rx.try_recv(), Ok(WireMessage::Removed { .. })));

        assert!(!session.tracks_document("posts", &DocId::from("1")));
        session.track("posts", "1");
        assert!(session.tracks_document("posts", &DocId::from("1")));
        assert!(!session.tracks_document("pages", &DocId::from("1")));
        session.untrack("posts", &DocId::from("1"));
        assert!(!session.tracks_document("posts", &DocId::from("1")));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (session, rx) = ChannelSession::new();
        drop(rx);
        session.send(WireMessage::Added {
            collection: "posts".into(),
            id: DocId::from("1"),
            fields: Map::new(),
        });
    }

    #[test]
    fn test_notification_session() {
        let (session, _rx) = ChannelSession::new();
        assert!(Invocation::plain(session.clone()).notification_session().is_none());
        assert!(Invocation::enhanced(session).notification_session().is_some());
        assert!(Invocation::server().notification_session().is_none());
    }
}
