//! Reconciliation of server data with the mirrored store.
//!
//! Data arrives two ways: as whole fetch results (merged with
//! [`merge_into_store`]) and as individual wire messages (applied with
//! [`reconcile_wire_message`]). Since the server does not track what each
//! client holds, messages can arrive for documents the client already has or
//! no longer has. Those conflicts are resolved here instead of surfacing as
//! errors: a duplicate `added` becomes a `changed`, and updates or removals of
//! unknown documents are dropped.

use mirrorsync_types::{DocumentsByCollection, MessageKind, WireMessage};
use tracing::{debug, trace};

use crate::local_store::LocalStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(MessageKind),
    /// An `added` for a document already present, applied as a `changed`.
    AddedAsChanged,
    Dropped { reason: DropReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The client never declared the collection.
    UnknownCollection,
    /// `changed` or `removed` for a document the store does not have.
    UnknownDocument,
}

/// Merge fetched documents into the store. Each collection with documents is
/// paused for the whole merge so observers see one change per document.
///
/// Returns the number of documents applied. Collections the client never
/// declared are skipped.
pub fn merge_into_store(store: &LocalStore, data: &DocumentsByCollection) -> usize {
    let collections: Vec<_> = data
        .iter()
        .filter(|(_, docs)| !docs.is_empty())
        .filter_map(|(name, docs)| match store.collection(name) {
            Some(coll) => Some((coll, docs)),
            None => {
                debug!(collection = %name, "skipping merge into undeclared collection");
                None
            }
        })
        .collect();

    for (coll, _) in &collections {
        coll.pause_observers();
    }
    let mut applied = 0;
    for (coll, docs) in &collections {
        for doc in docs.iter() {
            coll.upsert(doc.clone());
            applied += 1;
        }
    }
    for (coll, _) in &collections {
        coll.resume_observers();
    }
    applied
}

/// Apply one wire message, resolving conflicts with what the store holds.
pub fn reconcile_wire_message(store: &LocalStore, message: WireMessage) -> ReconcileOutcome {
    let Some(coll) = store.collection(message.collection()) else {
        trace!(collection = message.collection(), id = %message.id(), "message for undeclared collection");
        return ReconcileOutcome::Dropped { reason: DropReason::UnknownCollection };
    };

    match message {
        WireMessage::Added { id, fields, .. } => {
            if coll.merge(&id, &fields, &[]) {
                trace!(collection = coll.name(), id = %id, "added for known document, merged");
                return ReconcileOutcome::AddedAsChanged;
            }
            coll.upsert(mirrorsync_types::Document::new(id, fields));
            ReconcileOutcome::Applied(MessageKind::Added)
        }
        WireMessage::Changed { id, fields, cleared, .. } => {
            if coll.merge(&id, &fields, &cleared) {
                ReconcileOutcome::Applied(MessageKind::Changed)
            } else {
                trace!(collection = coll.name(), id = %id, "changed for unknown document dropped");
                ReconcileOutcome::Dropped { reason: DropReason::UnknownDocument }
            }
        }
        WireMessage::Removed { id, .. } => {
            if coll.remove(&id) {
                ReconcileOutcome::Applied(MessageKind::Removed)
            } else {
                trace!(collection = coll.name(), id = %id, "removed for unknown document dropped");
                ReconcileOutcome::Dropped { reason: DropReason::UnknownDocument }
            }
        }
    }
}
