//! Method registry: request/response stand-ins for publications.
//!
//! Three flavors of method sit next to plain ones:
//!
//! - **publish-lite**: the handler returns cursors, the call returns their
//!   documents grouped by collection. Documents reported through
//!   [`MethodContext::added`] are merged in as well.
//! - **composite publish-lite**: a tree of finds where each child sees the
//!   documents its ancestors fetched.
//! - **enhanced**: writes made by the handler are reported live to the
//!   caller, and returned cursors become a store-merge payload the client
//!   folds into its mirrored store.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt};
use mirrorsync_types::{DocId, Document, DocumentsByCollection, Fields, encode_store_merge};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error};

use crate::decorated::DecoratedStore;
use crate::error::ServerError;
use crate::session::{Invocation, Session};
use crate::store::{FindOptions, Selector};

/// A query whose documents a handler wants returned.
#[derive(Clone, Debug, PartialEq)]
pub struct Cursor {
    pub collection: String,
    pub selector: Selector,
    pub options: FindOptions,
}

impl Cursor {
    pub fn new(collection: impl Into<String>, selector: Selector) -> Self {
        Self {
            collection: collection.into(),
            selector,
            options: FindOptions::default(),
        }
    }

    pub fn with_options(mut self, options: FindOptions) -> Self {
        self.options = options;
        self
    }
}

/// What a handler hands back.
#[derive(Clone, Debug, PartialEq)]
pub enum HandlerOutput {
    Value(Value),
    Cursor(Cursor),
    Cursors(Vec<Cursor>),
    Empty,
}

impl From<Value> for HandlerOutput {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Cursor> for HandlerOutput {
    fn from(c: Cursor) -> Self {
        Self::Cursor(c)
    }
}

impl From<Vec<Cursor>> for HandlerOutput {
    fn from(cs: Vec<Cursor>) -> Self {
        Self::Cursors(cs)
    }
}

/// Everything a handler can reach during one call.
pub struct MethodContext {
    invocation: Invocation,
    store: Arc<DecoratedStore>,
    added: Mutex<Vec<(String, Document)>>,
}

impl MethodContext {
    fn new(invocation: Invocation, store: Arc<DecoratedStore>) -> Self {
        Self {
            invocation,
            store,
            added: Mutex::new(Vec::new()),
        }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn store(&self) -> &DecoratedStore {
        &self.store
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.invocation.session()
    }

    /// Report a document by hand, as a publication would. Publish-lite
    /// methods merge these into their result; other methods ignore them.
    pub fn added(&self, collection: impl Into<String>, id: impl Into<DocId>, fields: Fields) {
        self.added
            .lock()
            .push((collection.into(), Document::new(id, fields)));
    }

    fn take_added(&self) -> Vec<(String, Document)> {
        std::mem::take(&mut *self.added.lock())
    }
}

#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(
        &self,
        ctx: Arc<MethodContext>,
        args: Vec<Value>,
    ) -> Result<HandlerOutput, ServerError>;
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<MethodContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, ServerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Arc<MethodContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, ServerError>> + Send + 'static,
{
    async fn call(
        &self,
        ctx: Arc<MethodContext>,
        args: Vec<Value>,
    ) -> Result<HandlerOutput, ServerError> {
        (self.0)(ctx, args).await
    }
}

/// Builds the cursor of one composite level from the call arguments and the
/// ancestor documents, nearest first. `None` ends that branch.
pub type CompositeFind = Arc<dyn Fn(&[Value], &[Document]) -> Option<Cursor> + Send + Sync>;

/// One level of a composite publication.
#[derive(Clone)]
pub struct CompositePublication {
    find: CompositeFind,
    children: Vec<CompositePublication>,
}

impl CompositePublication {
    pub fn new<F>(find: F) -> Self
    where
        F: Fn(&[Value], &[Document]) -> Option<Cursor> + Send + Sync + 'static,
    {
        Self { find: Arc::new(find), children: Vec::new() }
    }

    pub fn child(mut self, child: CompositePublication) -> Self {
        self.children.push(child);
        self
    }
}

impl fmt::Debug for CompositePublication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositePublication")
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum Registered {
    Plain(Arc<dyn MethodHandler>),
    Enhanced(Arc<dyn MethodHandler>),
    PublishLite(Arc<dyn MethodHandler>),
    Composite(CompositePublication),
}

/// Named methods callable over the transport.
pub struct MethodRegistry {
    store: Arc<DecoratedStore>,
    methods: DashMap<String, Registered>,
}

impl MethodRegistry {
    pub fn new(store: Arc<DecoratedStore>) -> Self {
        Self { store, methods: DashMap::new() }
    }

    pub fn store(&self) -> &Arc<DecoratedStore> {
        &self.store
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn define(&self, name: &str, method: Registered) -> Result<(), ServerError> {
        if name.trim().is_empty() {
            return Err(ServerError::InvalidArgument("method name must not be empty".into()));
        }
        match self.methods.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ServerError::MethodAlreadyDefined(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(method);
                debug!(method = name, "method defined");
                Ok(())
            }
        }
    }

    /// A regular method: no live updates, cursors not allowed.
    pub fn method(&self, name: &str, handler: impl MethodHandler + 'static) -> Result<(), ServerError> {
        self.define(name, Registered::Plain(Arc::new(handler)))
    }

    /// A method whose writes are reported live to the caller.
    pub fn methods_enhanced(
        &self,
        name: &str,
        handler: impl MethodHandler + 'static,
    ) -> Result<(), ServerError> {
        self.define(name, Registered::Enhanced(Arc::new(handler)))
    }

    /// A publication served as a method returning its documents.
    pub fn publish_lite(
        &self,
        name: &str,
        handler: impl MethodHandler + 'static,
    ) -> Result<(), ServerError> {
        self.define(name, Registered::PublishLite(Arc::new(handler)))
    }

    pub fn publish_composite_lite(
        &self,
        name: &str,
        publication: CompositePublication,
    ) -> Result<(), ServerError> {
        self.define(name, Registered::Composite(publication))
    }

    /// Run `name` on behalf of `session`.
    pub async fn call(
        &self,
        session: Arc<dyn Session>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ServerError> {
        let method = self
            .methods
            .get(name)
            .map(|m| m.value().clone())
            .ok_or_else(|| ServerError::MethodNotFound(name.to_string()))?;
        debug!(method = name, session = session.id(), "call");

        let invocation = match method {
            Registered::Enhanced(_) => Invocation::enhanced(session),
            _ => Invocation::plain(session),
        };
        let ctx = Arc::new(MethodContext::new(invocation, self.store.clone()));

        match method {
            Registered::Plain(handler) => match handler.call(ctx, args).await? {
                HandlerOutput::Value(v) => Ok(v),
                HandlerOutput::Empty => Ok(Value::Null),
                HandlerOutput::Cursor(_) | HandlerOutput::Cursors(_) => {
                    Err(ServerError::InvalidArgument(format!(
                        "method '{name}' returned cursors; define it with methods_enhanced or publish_lite"
                    )))
                }
            },
            Registered::Enhanced(handler) => {
                let cursors = match handler.call(ctx.clone(), args).await? {
                    HandlerOutput::Value(v) => return Ok(v),
                    HandlerOutput::Empty => return Ok(Value::Null),
                    HandlerOutput::Cursor(c) => vec![c],
                    HandlerOutput::Cursors(cs) => cs,
                };
                let mut result = DocumentsByCollection::new();
                for cursor in &cursors {
                    let docs = self.fetch(cursor).await?;
                    result.entry(cursor.collection.clone()).or_default().extend(docs);
                }
                Ok(encode_store_merge(&result))
            }
            Registered::PublishLite(handler) => {
                let cursors = match handler.call(ctx.clone(), args).await? {
                    HandlerOutput::Empty | HandlerOutput::Value(Value::Null) => Vec::new(),
                    HandlerOutput::Cursor(c) => vec![c],
                    HandlerOutput::Cursors(cs) => cs,
                    HandlerOutput::Value(_) => {
                        let err = ServerError::InvalidArgument(format!(
                            "handler for '{name}' returns invalid cursor(s)"
                        ));
                        error!(method = name, error = %err, "publish-lite failed");
                        return Err(err);
                    }
                };
                if let Some(dup) = duplicate_collection(&cursors) {
                    let err = ServerError::InvalidArgument(format!(
                        "handler for '{name}' returns more than one cursor on '{dup}'"
                    ));
                    error!(method = name, error = %err, "publish-lite failed");
                    return Err(err);
                }

                let mut result = DocumentsByCollection::new();
                for cursor in &cursors {
                    let docs = self.fetch(cursor).await?;
                    result.insert(cursor.collection.clone(), docs);
                }
                for (collection, doc) in ctx.take_added() {
                    merge_into_fetch_result(&mut result, &collection, doc);
                }
                Ok(fetch_result_to_value(&result))
            }
            Registered::Composite(publication) => {
                let mut result = DocumentsByCollection::new();
                fetch_composite(self.store.as_ref(), &args, &publication, Vec::new(), &mut result)
                    .await?;
                for (collection, doc) in ctx.take_added() {
                    merge_into_fetch_result(&mut result, &collection, doc);
                }
                Ok(fetch_result_to_value(&result))
            }
        }
    }

    async fn fetch(&self, cursor: &Cursor) -> Result<Vec<Document>, ServerError> {
        self.store
            .find(&cursor.collection, &cursor.selector, &cursor.options)
            .await
    }
}

fn duplicate_collection(cursors: &[Cursor]) -> Option<&str> {
    let mut seen = std::collections::HashSet::new();
    cursors
        .iter()
        .map(|c| c.collection.as_str())
        .find(|name| !seen.insert(*name))
}

fn fetch_composite<'a>(
    store: &'a DecoratedStore,
    args: &'a [Value],
    level: &'a CompositePublication,
    parents: Vec<Document>,
    result: &'a mut DocumentsByCollection,
) -> BoxFuture<'a, Result<(), ServerError>> {
    async move {
        let Some(cursor) = (level.find)(args, &parents) else {
            return Ok(());
        };
        let docs = store
            .find(&cursor.collection, &cursor.selector, &cursor.options)
            .await?;
        for doc in docs {
            merge_into_fetch_result(result, &cursor.collection, doc.clone());
            for child in &level.children {
                let mut chain = Vec::with_capacity(parents.len() + 1);
                chain.push(doc.clone());
                chain.extend(parents.iter().cloned());
                fetch_composite(store, args, child, chain, result).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

/// Add `doc` to `result`, shallow-merging over an existing document with the
/// same id. A merged document moves to the end of its collection.
pub fn merge_into_fetch_result(result: &mut DocumentsByCollection, collection: &str, doc: Document) {
    let docs = result.entry(collection.to_string()).or_default();
    match docs.iter().position(|d| d.id == doc.id) {
        Some(pos) => {
            let mut merged = docs.remove(pos);
            merged.shallow_merge(&doc.fields);
            docs.push(merged);
        }
        None => docs.push(doc),
    }
}

fn fetch_result_to_value(result: &DocumentsByCollection) -> Value {
    Value::Object(
        result
            .iter()
            .map(|(collection, docs)| {
                (
                    collection.clone(),
                    Value::Array(docs.iter().map(Document::to_value).collect()),
                )
            })
            .collect(),
    )
}
