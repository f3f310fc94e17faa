//! Mutation notifier.
//!
//! Turns change events caused by one operation into added/changed/removed
//! messages on the session that issued it. Events are attributed through the
//! operation id the tagged modifier wrote into the document; anything written
//! by someone else is ignored, as is anything the session already receives
//! through a regular subscription.

use std::sync::Arc;

use mirrorsync_types::{
    ChangeEvent, MessageKind, OperationId, OperationType, WireMessage, embedded_operation_id,
    strip_tag,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Update,
    Upsert,
}

/// One mutating call, alive until its stream registration is released.
#[derive(Clone, Debug)]
pub struct Operation {
    pub id: OperationId,
    pub collection: String,
    pub kind: OperationKind,
    pub started_at: Instant,
}

impl Operation {
    pub fn new(collection: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: OperationId::new(),
            collection: collection.into(),
            kind,
            started_at: Instant::now(),
        }
    }
}

/// What handling one change event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyResult {
    /// Messages were sent, in this order.
    Emitted(Vec<MessageKind>),
    Skipped { reason: SkipReason },
}

/// Why a change event produced no message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Event belongs to another collection.
    CollectionMismatch,
    /// The document does not carry this operation's id.
    NotOurOperation,
    /// Only the correlation tag changed.
    EmptyDiff,
    /// The session already sees this document through a subscription.
    AlreadyInSessionView,
    /// Inserts and deletes are reported by the decorated store itself.
    UnsupportedEventType(OperationType),
    /// Update without a description, or replace without a document.
    MissingPayload,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MutationNotifier;

impl MutationNotifier {
    pub fn new() -> Self {
        Self
    }

    /// Handle one change event for `op`, sending at most one message (or one
    /// removed/added pair) to `session`.
    pub fn handle_event(
        &self,
        op: &Operation,
        session: &dyn Session,
        event: &ChangeEvent,
    ) -> NotifyResult {
        if event.ns != op.collection {
            return skipped(SkipReason::CollectionMismatch);
        }
        let id = event.doc_id();

        match event.operation_type {
            OperationType::Update => {
                let Some(desc) = &event.update_description else {
                    return skipped(SkipReason::MissingPayload);
                };
                if embedded_operation_id(&desc.updated_fields) != Some(op.id) {
                    return skipped(SkipReason::NotOurOperation);
                }
                let mut fields = desc.updated_fields.clone();
                strip_tag(&mut fields);
                if fields.is_empty() && desc.removed_fields.is_empty() {
                    return skipped(SkipReason::EmptyDiff);
                }
                if session.tracks_document(&op.collection, id) {
                    return skipped(SkipReason::AlreadyInSessionView);
                }

                trace!(collection = %op.collection, id = %id, operation_id = %op.id.short(), "changed");
                session.send(WireMessage::Changed {
                    collection: op.collection.clone(),
                    id: id.clone(),
                    fields,
                    cleared: desc.removed_fields.clone(),
                });
                NotifyResult::Emitted(vec![MessageKind::Changed])
            }
            OperationType::Replace => {
                let Some(doc) = &event.full_document else {
                    return skipped(SkipReason::MissingPayload);
                };
                if embedded_operation_id(&doc.fields) != Some(op.id) {
                    return skipped(SkipReason::NotOurOperation);
                }
                if session.tracks_document(&op.collection, id) {
                    return skipped(SkipReason::AlreadyInSessionView);
                }
                let mut fields = doc.fields.clone();
                strip_tag(&mut fields);

                trace!(collection = %op.collection, id = %id, operation_id = %op.id.short(), "replaced");
                session.send(WireMessage::Removed {
                    collection: op.collection.clone(),
                    id: id.clone(),
                });
                session.send(WireMessage::Added {
                    collection: op.collection.clone(),
                    id: id.clone(),
                    fields,
                });
                NotifyResult::Emitted(vec![MessageKind::Removed, MessageKind::Added])
            }
            other => skipped(SkipReason::UnsupportedEventType(other)),
        }
    }

    /// Feed events from `rx` to [`handle_event`](Self::handle_event) until the
    /// stream closes or `cancel` fires. Events already queued when `cancel`
    /// fires are still handled.
    pub async fn listen(
        &self,
        op: Operation,
        session: Arc<dyn Session>,
        mut rx: broadcast::Receiver<ChangeEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => {
                        let result = self.handle_event(&op, session.as_ref(), &event);
                        if let NotifyResult::Skipped { reason } = result {
                            trace!(operation_id = %op.id.short(), ?reason, "change skipped");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(collection = %op.collection, operation_id = %op.id.short(), "listener lagged, {} events lost", n);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        debug!(
            collection = %op.collection,
            operation_id = %op.id.short(),
            kind = %op.kind,
            elapsed_ms = op.started_at.elapsed().as_millis() as u64,
            "listener finished"
        );
    }
}

fn skipped(reason: SkipReason) -> NotifyResult {
    NotifyResult::Skipped { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelSession;
    use mirrorsync_types::{DocId, Document, Fields, OPERATION_ID_FIELD, UpdateDescription};
    use serde_json::{Value, json};

    fn fields(v: Value) -> Fields {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn update_event(op: OperationId, updated: Value, removed: &[&str]) -> ChangeEvent {
        let mut updated = fields(updated);
        updated.insert(OPERATION_ID_FIELD.into(), json!(op.to_hex()));
        ChangeEvent::update(
            "posts",
            DocId::from("1"),
            UpdateDescription {
                updated_fields: updated,
                removed_fields: removed.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    #[test]
    fn test_update_emits_changed_without_tag() {
        let (session, mut rx) = ChannelSession::new();
        let op = Operation::new("posts", OperationKind::Update);
        let result = MutationNotifier.handle_event(
            &op,
            session.as_ref(),
            &update_event(op.id, json!({"title": "b"}), &["draft"]),
        );
        assert_eq!(result, NotifyResult::Emitted(vec![MessageKind::Changed]));
        assert_eq!(
            rx.try_recv().unwrap(),
            WireMessage::Changed {
                collection: "posts".into(),
                id: DocId::from("1"),
                fields: fields(json!({"title": "b"})),
                cleared: vec!["draft".into()],
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_update_skips() {
        let (session, mut rx) = ChannelSession::new();
        let op = Operation::new("posts", OperationKind::Update);
        let n = MutationNotifier;

        let foreign = update_event(OperationId::new(), json!({"title": "b"}), &[]);
        assert_eq!(
            n.handle_event(&op, session.as_ref(), &foreign),
            NotifyResult::Skipped { reason: SkipReason::NotOurOperation }
        );

        let untagged = ChangeEvent::update("posts", DocId::from("1"), UpdateDescription::default());
        assert_eq!(
            n.handle_event(&op, session.as_ref(), &untagged),
            NotifyResult::Skipped { reason: SkipReason::NotOurOperation }
        );

        let tag_only = update_event(op.id, json!({}), &[]);
        assert_eq!(
            n.handle_event(&op, session.as_ref(), &tag_only),
            NotifyResult::Skipped { reason: SkipReason::EmptyDiff }
        );

        session.track("posts", "1");
        let tracked = update_event(op.id, json!({"title": "b"}), &[]);
        assert_eq!(
            n.handle_event(&op, session.as_ref(), &tracked),
            NotifyResult::Skipped { reason: SkipReason::AlreadyInSessionView }
        );

        let other = Operation::new("pages", OperationKind::Update);
        assert_eq!(
            n.handle_event(&other, session.as_ref(), &tracked),
            NotifyResult::Skipped { reason: SkipReason::CollectionMismatch }
        );

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_replace_emits_removed_then_added() {
        let (session, mut rx) = ChannelSession::new();
        let op = Operation::new("posts", OperationKind::Upsert);
        let mut doc = fields(json!({"title": "r"}));
        doc.insert(OPERATION_ID_FIELD.into(), json!(op.id.to_hex()));
        let event = ChangeEvent::replace("posts", Document::new("1", doc));

        let result = MutationNotifier.handle_event(&op, session.as_ref(), &event);
        assert_eq!(
            result,
            NotifyResult::Emitted(vec![MessageKind::Removed, MessageKind::Added])
        );
        assert!(matches!(rx.try_recv(), Ok(WireMessage::Removed { .. })));
        match rx.try_recv() {
            Ok(WireMessage::Added { fields: f, .. }) => assert_eq!(f, fields(json!({"title": "r"}))),
            other => panic!("expected added, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_and_delete_events_ignored() {
        let (session, _rx) = ChannelSession::new();
        let op = Operation::new("posts", OperationKind::Update);
        let event = ChangeEvent::delete("posts", DocId::from("1"));
        assert_eq!(
            MutationNotifier.handle_event(&op, session.as_ref(), &event),
            NotifyResult::Skipped { reason: SkipReason::UnsupportedEventType(OperationType::Delete) }
        );
    }

    #[tokio::test]
    async fn test_listen_drains_queued_events_before_cancel() {
        let (session, mut rx) = ChannelSession::new();
        let op = Operation::new("posts", OperationKind::Update);
        let (tx, events) = broadcast::channel(8);
        tx.send(update_event(op.id, json!({"a": 1}), &[])).unwrap();
        tx.send(update_event(op.id, json!({"a": 2}), &[])).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        MutationNotifier.listen(op, session, events, cancel).await;

        assert!(matches!(rx.try_recv(), Ok(WireMessage::Changed { .. })));
        assert!(matches!(rx.try_recv(), Ok(WireMessage::Changed { .. })));
    }
}
