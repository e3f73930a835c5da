//! Observer machinery shared by plugins and readers
//!
//! Observers are plain `Arc`-shared callbacks. Failures never reach the event
//! producer: whatever an observer returns as an error is routed to the
//! observation exception handler configured on the same component, which is
//! why adding the first observer without a handler is rejected.

mod executor;

use std::sync::{Arc, Mutex};

pub use executor::{EventNotificationExecutor, SingleThreadExecutor};

use crate::error::{Error, ObservationError, Result};
use crate::event::{PluginEvent, ReaderEvent};

/// Observer of reader events (card insertion, match, removal, unavailability).
pub trait CardReaderObserver: Send + Sync {
    /// Handle a reader event. A returned error is routed to the reader's
    /// observation exception handler.
    fn on_reader_event(&self, event: &ReaderEvent) -> core::result::Result<(), ObservationError>;
}

/// Observer of plugin events (reader connection, disconnection,
/// unavailability).
pub trait PluginObserver: Send + Sync {
    /// Handle a plugin event. A returned error is routed to the plugin's
    /// observation exception handler.
    fn on_plugin_event(&self, event: &PluginEvent) -> core::result::Result<(), ObservationError>;
}

/// Sink for errors raised while observing a reader: observer failures and
/// monitoring-job failures both land here.
pub trait ReaderObservationExceptionHandler: Send + Sync {
    /// Report an observation error with its reader context. A returned error
    /// is logged and swallowed.
    fn on_reader_observation_error(
        &self,
        plugin_name: &str,
        reader_name: &str,
        error: ObservationError,
    ) -> core::result::Result<(), ObservationError>;
}

/// Sink for errors raised while observing a plugin.
pub trait PluginObservationExceptionHandler: Send + Sync {
    /// Report an observation error with its plugin context. A returned error
    /// is logged and swallowed.
    fn on_plugin_observation_error(
        &self,
        plugin_name: &str,
        error: ObservationError,
    ) -> core::result::Result<(), ObservationError>;
}

/// Generic observer set with its exception handler and optional dispatch
/// executor.
///
/// `O` is the observer trait object, `H` the exception-handler trait object.
/// Notification works on a snapshot taken under the lock, so observers can be
/// added or removed while a notification is in flight; the change only
/// affects subsequent notifications.
pub(crate) struct ObservationManager<O: ?Sized, H: ?Sized> {
    inner: Mutex<Inner<O, H>>,
}

struct Inner<O: ?Sized, H: ?Sized> {
    observers: Vec<Arc<O>>,
    exception_handler: Option<Arc<H>>,
    executor: Option<Arc<dyn EventNotificationExecutor>>,
}

impl<O: ?Sized, H: ?Sized> ObservationManager<O, H> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                observers: Vec::new(),
                exception_handler: None,
                executor: None,
            }),
        }
    }

    /// Add an observer. Duplicate adds are idempotent; the first add requires
    /// an exception handler to be configured.
    pub(crate) fn add_observer(&self, observer: Arc<O>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.observers.is_empty() && inner.exception_handler.is_none() {
            return Err(Error::illegal_state(
                "no observation exception handler has been set",
            ));
        }
        if !inner.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            inner.observers.push(observer);
        }
        Ok(())
    }

    /// Remove an observer; unknown observers are ignored.
    pub(crate) fn remove_observer(&self, observer: &Arc<O>) {
        let mut inner = self.inner.lock().unwrap();
        inner.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Remove every observer.
    pub(crate) fn clear_observers(&self) {
        self.inner.lock().unwrap().observers.clear();
    }

    /// Number of registered observers.
    pub(crate) fn count_observers(&self) -> usize {
        self.inner.lock().unwrap().observers.len()
    }

    /// Configure the exception handler.
    pub(crate) fn set_exception_handler(&self, handler: Arc<H>) {
        self.inner.lock().unwrap().exception_handler = Some(handler);
    }

    /// The configured exception handler, if any.
    pub(crate) fn exception_handler(&self) -> Option<Arc<H>> {
        self.inner.lock().unwrap().exception_handler.clone()
    }

    /// Configure (or remove) the notification executor. Without one,
    /// observers are invoked synchronously on the producing thread.
    pub(crate) fn set_executor(&self, executor: Option<Arc<dyn EventNotificationExecutor>>) {
        self.inner.lock().unwrap().executor = executor;
    }

    /// Snapshot of the observer set and dispatch configuration, taken for one
    /// notification.
    pub(crate) fn snapshot(&self) -> ObservationSnapshot<O, H> {
        let inner = self.inner.lock().unwrap();
        ObservationSnapshot {
            observers: inner.observers.clone(),
            exception_handler: inner.exception_handler.clone(),
            executor: inner.executor.clone(),
        }
    }
}

/// Frozen view of an [`ObservationManager`] used for one notification pass.
pub(crate) struct ObservationSnapshot<O: ?Sized, H: ?Sized> {
    pub(crate) observers: Vec<Arc<O>>,
    pub(crate) exception_handler: Option<Arc<H>>,
    pub(crate) executor: Option<Arc<dyn EventNotificationExecutor>>,
}
