//! The decorated store: a [`Store`] plus mutation notifications.
//!
//! Every write goes through here with the [`Invocation`] that issued it. When
//! the invocation asked for live updates, the write is tagged with a fresh
//! operation id, a listener is attached to the collection's pooled change
//! stream before the write runs, and the resulting events reach the caller's
//! session as ordinary added/changed/removed messages. Without live updates,
//! writes pass straight through.
//!
//! Failure to observe changes never fails a write: it is logged and the call
//! continues without notifications.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mirrorsync_types::{
    DocId, Document, Fields, Modifier, OPERATION_ID_FIELD, TaggedModifier, WireMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MIN_STORE_VERSION, ServerConfig};
use crate::error::ServerError;
use crate::notifier::{MutationNotifier, Operation, OperationKind};
use crate::pool::ChangeStreamPool;
use crate::session::Invocation;
use crate::store::{FindOptions, Projection, Selector, Store, UpdateOptions, UpdateResult};

pub struct DecoratedStore {
    store: Arc<dyn Store>,
    pool: Arc<ChangeStreamPool>,
    notifier: MutationNotifier,
    config: ServerConfig,
    live_updates: AtomicBool,
}

impl DecoratedStore {
    pub fn new(store: Arc<dyn Store>, config: ServerConfig) -> Self {
        let pool = ChangeStreamPool::new(store.clone(), &config);
        Self {
            store,
            pool,
            notifier: MutationNotifier::new(),
            config,
            live_updates: AtomicBool::new(true),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<ChangeStreamPool> {
        &self.pool
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// False once a capability check found change streams unusable.
    pub fn live_updates_available(&self) -> bool {
        self.live_updates.load(Ordering::SeqCst)
    }

    /// Verify the backing store can serve change streams.
    ///
    /// Never fails: a mismatch is logged and live mutation notifications are
    /// switched off, while plain reads and writes keep working.
    pub async fn check_capabilities(&self) -> bool {
        let caps = match self.store.capabilities().await {
            Ok(caps) => caps,
            Err(e) => {
                let err = ServerError::BackingStoreUnavailable(e.to_string());
                error!(error = %err, "could not query store capabilities, live updates disabled");
                self.live_updates.store(false, Ordering::SeqCst);
                return false;
            }
        };

        let mut available = true;
        if !caps.change_streams {
            let err = ServerError::BackingStoreUnavailable(
                "change streams need a replica set".to_string(),
            );
            error!(error = %err, "live updates disabled");
            available = false;
        }
        match parse_version(&caps.version) {
            Some(v) if v >= MIN_STORE_VERSION => {}
            _ => {
                let err = ServerError::BackingStoreUnavailable(format!(
                    "store version {} is older than {}.{}",
                    caps.version, MIN_STORE_VERSION.0, MIN_STORE_VERSION.1
                ));
                error!(error = %err, "live updates disabled");
                available = false;
            }
        }
        if let Some(size) = caps.pool_size {
            if size < self.config.connection_pool_size {
                warn!(
                    pool_size = size,
                    wanted = self.config.connection_pool_size,
                    "connection pool smaller than configured, change streams may starve queries"
                );
            }
        }

        self.live_updates.store(available, Ordering::SeqCst);
        if available {
            info!(version = %caps.version, "store supports change streams");
        }
        available
    }

    /// Insert a document, announcing it to a notifying session.
    pub async fn insert(
        &self,
        invocation: &Invocation,
        collection: &str,
        doc: Fields,
    ) -> Result<DocId, ServerError> {
        let mut fields = doc.clone();
        let id = self.store.insert(collection, doc).await?;

        if let Some(session) = invocation.notification_session() {
            fields.remove("_id");
            session.send(WireMessage::Added {
                collection: collection.to_string(),
                id: id.clone(),
                fields,
            });
        }
        Ok(id)
    }

    /// Remove matching documents, announcing each one to a notifying session.
    pub async fn remove(
        &self,
        invocation: &Invocation,
        collection: &str,
        selector: &Selector,
    ) -> Result<usize, ServerError> {
        let Some(session) = invocation.notification_session() else {
            return Ok(self.store.remove(collection, selector).await?);
        };

        let ids_only = FindOptions::default().with_fields(Projection::default().include("_id"));
        let ids: Vec<DocId> = self
            .store
            .find(collection, selector, &ids_only)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();

        let removed = self.store.remove(collection, selector).await?;
        for id in ids {
            session.send(WireMessage::Removed { collection: collection.to_string(), id });
        }
        Ok(removed)
    }

    /// Update matching documents.
    ///
    /// With a notifying session, every document this call changes produces one
    /// `changed` (or one `removed`/`added` pair for a replacement), and an
    /// upsert that inserts produces one `added`.
    pub async fn update(
        &self,
        invocation: &Invocation,
        collection: &str,
        selector: &Selector,
        modifier: Modifier,
        options: UpdateOptions,
    ) -> Result<UpdateResult, ServerError> {
        let session = invocation
            .notification_session()
            .filter(|_| self.live_updates_available());
        let Some(session) = session else {
            return Ok(self.store.update(collection, selector, &modifier, options).await?);
        };

        let kind = if options.upsert { OperationKind::Upsert } else { OperationKind::Update };
        let op = Operation::new(collection, kind);
        let tagged = TaggedModifier::new(modifier, op.id);

        let registration = match self.pool.acquire(collection, op.id).await {
            Ok(stream) => {
                // Subscribe before writing so no event of ours can be missed.
                let rx = stream.subscribe();
                let cancel = CancellationToken::new();
                let notifier = self.notifier;
                let listener_op = op.clone();
                let listener_session = session.clone();
                let listener_cancel = cancel.clone();
                tokio::spawn(async move {
                    notifier
                        .listen(listener_op, listener_session, rx, listener_cancel)
                        .await;
                });
                Some((stream, cancel))
            }
            Err(e) => {
                warn!(collection, operation_id = %op.id.short(), error = %e, "no live updates for this call");
                None
            }
        };

        let result = self
            .store
            .update(collection, selector, &tagged.to_wire(), options)
            .await;

        if let Some((stream, cancel)) = registration {
            self.pool.schedule_release(stream, op.id, cancel);
            self.pool.ensure_sweeper(collection);
        }

        let result = result?;
        debug!(
            collection,
            operation_id = %op.id.short(),
            kind = %kind,
            affected = result.number_affected,
            "update applied"
        );

        if let Some(id) = &result.inserted_id {
            if let Some(doc) = tagged.original().upserted_document(id) {
                session.send(WireMessage::Added {
                    collection: collection.to_string(),
                    id: doc.id,
                    fields: doc.fields,
                });
            }
        }
        Ok(result)
    }

    /// [`update`](Self::update) with upsert on.
    pub async fn upsert(
        &self,
        invocation: &Invocation,
        collection: &str,
        selector: &Selector,
        modifier: Modifier,
    ) -> Result<UpdateResult, ServerError> {
        self.update(invocation, collection, selector, modifier, UpdateOptions::upsert())
            .await
    }

    /// Find documents. The correlation tag is projected away unless the
    /// caller's projection lists the fields it wants.
    pub async fn find(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Vec<Document>, ServerError> {
        let mut options = options.clone();
        if !options.fields.as_ref().is_some_and(Projection::has_inclusions) {
            let projection = options.fields.take().unwrap_or_default();
            options.fields = Some(projection.exclude(OPERATION_ID_FIELD));
        }
        Ok(self.store.find(collection, selector, &options).await?)
    }

    pub async fn find_one(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Option<Document>, ServerError> {
        let options = options.clone().with_limit(1);
        Ok(self.find(collection, selector, &options).await?.into_iter().next())
    }
}

/// `"major.minor[.patch...]"` → `(major, minor)`.
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next().map_or(Some(0), |m| m.trim().parse().ok())?;
    Some((major, minor))
}
