//! Subscription handles.
//!
//! A handle stands in for a live subscription that is really a one-shot
//! method call. Its ready flag goes true once the fetched documents are in
//! the mirrored store, and back to false while a stale cached handle is being
//! refetched. Waiters observe it through a `watch` channel.

use std::fmt;
use std::sync::Arc;

use mirrorsync_types::SubscriptionId;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ClientError;

pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Called with the error when a fetch fails, or with `None` on [`SubscriptionHandle::stop`].
pub type StopCallback = Arc<dyn Fn(Option<&ClientError>) + Send + Sync>;

/// Per-call subscription options.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub on_ready: Option<ReadyCallback>,
    pub on_stop: Option<StopCallback>,
    /// Overrides the default cache duration for this subscription.
    pub cache_duration_ms: Option<u64>,
}

impl SubscribeOptions {
    pub fn on_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Arc::new(f));
        self
    }

    pub fn on_stop(mut self, f: impl Fn(Option<&ClientError>) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(f));
        self
    }

    pub fn cache_duration_ms(mut self, ms: u64) -> Self {
        self.cache_duration_ms = Some(ms);
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field("cache_duration_ms", &self.cache_duration_ms)
            .finish()
    }
}

struct HandleInner {
    id: SubscriptionId,
    name: String,
    ready: watch::Sender<bool>,
    on_stop: Mutex<Option<StopCallback>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    pub(crate) fn new(name: &str, on_stop: Option<StopCallback>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                id: SubscriptionId::new(),
                name: name.to_string(),
                ready,
                on_stop: Mutex::new(on_stop),
            }),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Receiver notified on every ready transition.
    pub fn ready_changes(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    /// Wait until the handle is ready.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_changes();
        // The sender lives as long as this handle, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Run the stop callback. The cached handle stays usable.
    pub fn stop(&self) {
        let callback = self.inner.on_stop.lock().clone();
        if let Some(callback) = callback {
            callback(None);
        }
    }

    /// True if both handles are the same subscription.
    pub fn same_as(&self, other: &SubscriptionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.inner.ready.send_replace(ready);
    }

    pub(crate) fn set_on_stop(&self, callback: StopCallback) {
        *self.inner.on_stop.lock() = Some(callback);
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("ready", &self.ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_ready_transitions() {
        let handle = SubscriptionHandle::new("feed", None);
        let mut rx = handle.ready_changes();
        assert!(!handle.ready());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_ready().await })
        };
        handle.set_ready(true);
        waiter.await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());

        handle.set_ready(false);
        assert!(!*rx.borrow_and_update());
    }

    #[test]
    fn test_stop_uses_latest_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = SubscriptionHandle::new("feed", None);
        handle.stop();

        let c = calls.clone();
        handle.set_on_stop(Arc::new(move |err| {
            assert!(err.is_none());
            c.fetch_add(1, Ordering::SeqCst);
        }));
        handle.clone().stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.same_as(&handle.clone()));
        assert!(!handle.same_as(&SubscriptionHandle::new("feed", None)));
    }
}
