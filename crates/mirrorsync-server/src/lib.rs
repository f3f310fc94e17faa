//! Server side of mirrorsync.
//!
//! Writes issued by a method call go through a [`DecoratedStore`]. When the
//! call was made through an enhanced method, each write is tagged with an
//! operation id and a listener on the collection's pooled change stream turns
//! the events it caused into added/changed/removed messages for the caller's
//! session. Publications are served as plain methods through
//! [`MethodRegistry::publish_lite`].
//!
//! # Architecture
//!
//! ```text
//! MethodRegistry ── call ──► handler ── writes ──► DecoratedStore ──► Store
//!                                                      │
//!                                     ChangeStreamPool ◄┘ (one stream per collection)
//!                                           │ events
//!                                           ▼
//!                                    MutationNotifier ──► Session::send
//! ```

pub mod config;
pub mod decorated;
pub mod error;
pub mod memory;
pub mod methods;
pub mod notifier;
pub mod pool;
pub mod session;
pub mod store;

pub use config::ServerConfig;
pub use decorated::DecoratedStore;
pub use error::{ServerError, StoreError};
pub use memory::MemoryStore;
pub use methods::{
    CompositePublication, Cursor, HandlerOutput, MethodContext, MethodHandler, MethodRegistry,
    handler_fn,
};
pub use notifier::{MutationNotifier, NotifyResult, Operation, OperationKind, SkipReason};
pub use pool::{ChangeStreamPool, PooledStream};
pub use session::{ChannelSession, Invocation, Session};
pub use store::{
    ChangeStream, FindOptions, Projection, Selector, Store, StoreCapabilities, UpdateOptions,
    UpdateResult,
};
