//! Ordered fan-out of typed notifications
//!
//! Handlers run synchronously in registration order on whichever task emits
//! the event. A panicking handler is logged and does not stop the handlers
//! registered after it.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of handlers for one kind of event
pub struct Notifier<T> {
    inner: Arc<NotifierInner<T>>,
}

struct NotifierInner<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

/// Registration handle returned by every `on_*`/`add_*` method.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::dispose`] to remove it.
#[must_use = "dropping a subscription keeps the handler registered forever"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T: 'static> Notifier<T> {
    /// Create a notifier with no handlers
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));

        let weak: Weak<NotifierInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.lock().retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    /// Invoke every handler registered at the time of the call
    pub fn emit(&self, event: &T) {
        let handlers: Vec<Handler<T>> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            isolate("Notification", || handler(event));
        }
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    pub(crate) fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Unregister the handler
    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

/// Run a user callback, logging a panic instead of unwinding into the caller
pub(crate) fn isolate<F: FnOnce()>(what: &str, callback: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("{} handler panicked: {}", what, reason);
    }
}
