//! Observable plugin adapters
//!
//! Two detection models behind one public type: a polling watcher that diffs
//! the driver's reader-name set on a fixed cycle, and an autonomous driver
//! that pushes connection events itself. The watcher runs only while the
//! plugin has observers: it starts on the first observer add and stops on the
//! last remove (or on unregister).

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use tracing::{debug, error, trace, warn};

use termcard_plugin_spi::{
    AutonomousObservablePluginSpi, ObservablePluginSpi, PluginEventApi, PluginSpi, ReaderSpiRef,
};

use super::PluginCore;
use crate::error::{Error, ObservationError, Result};
use crate::event::{PluginEvent, PluginEventType};
use crate::observation::{
    EventNotificationExecutor, ObservationManager, PluginObservationExceptionHandler,
    PluginObserver,
};
use crate::reader::build_reader;

enum DetectionSource {
    Polling(Arc<dyn ObservablePluginSpi>),
    Autonomous(Arc<dyn AutonomousObservablePluginSpi>),
}

struct WatcherHandle {
    stop_tx: Sender<()>,
}

/// A local plugin notifying observers of reader connections and
/// disconnections.
#[derive(Clone)]
pub struct ObservablePlugin {
    inner: Arc<ObservablePluginInner>,
}

impl ObservablePlugin {
    pub(crate) fn new_polling(spi: Arc<dyn ObservablePluginSpi>) -> Self {
        let base_spi: Arc<dyn PluginSpi> = spi.clone();
        Self::build(base_spi, DetectionSource::Polling(spi))
    }

    pub(crate) fn new_autonomous(spi: Arc<dyn AutonomousObservablePluginSpi>) -> Self {
        let base_spi: Arc<dyn PluginSpi> = spi.clone();
        Self::build(base_spi, DetectionSource::Autonomous(spi))
    }

    fn build(spi: Arc<dyn PluginSpi>, source: DetectionSource) -> Self {
        let inner = Arc::new_cyclic(|self_ref: &Weak<ObservablePluginInner>| {
            ObservablePluginInner {
                core: PluginCore::new(spi.name()),
                spi,
                source,
                observation: ObservationManager::new(),
                watcher: Mutex::new(None),
                self_ref: self_ref.clone(),
            }
        });
        Self { inner }
    }

    /// Name of the plugin.
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Add a plugin observer. The first add starts reader monitoring; it
    /// fails when the plugin is unregistered or when no observation exception
    /// handler has been configured yet.
    pub fn add_observer(&self, observer: Arc<dyn PluginObserver>) -> Result<()> {
        self.inner.core.check_registered()?;
        self.inner.observation.add_observer(observer)?;
        self.inner.start_watcher();
        Ok(())
    }

    /// Remove a plugin observer. The last remove stops reader monitoring.
    pub fn remove_observer(&self, observer: &Arc<dyn PluginObserver>) {
        self.inner.observation.remove_observer(observer);
        if self.inner.observation.count_observers() == 0 {
            self.inner.stop_watcher();
        }
    }

    /// Remove every plugin observer and stop reader monitoring.
    pub fn clear_observers(&self) {
        self.inner.observation.clear_observers();
        self.inner.stop_watcher();
    }

    /// Number of registered plugin observers.
    pub fn count_observers(&self) -> usize {
        self.inner.observation.count_observers()
    }

    /// Configure the sink for observation errors. Must be done before the
    /// first observer is added.
    pub fn set_observation_exception_handler(
        &self,
        handler: Arc<dyn PluginObservationExceptionHandler>,
    ) -> Result<()> {
        self.inner.core.check_registered()?;
        self.inner.observation.set_exception_handler(handler);
        Ok(())
    }

    /// Configure an executor for asynchronous observer notification; `None`
    /// restores inline dispatch.
    pub fn set_event_notification_executor(
        &self,
        executor: Option<Arc<dyn EventNotificationExecutor>>,
    ) -> Result<()> {
        self.inner.core.check_registered()?;
        self.inner.observation.set_executor(executor);
        Ok(())
    }

    pub(crate) fn core(&self) -> &PluginCore {
        &self.inner.core
    }

    /// Scan the driver for the initial reader set and, for autonomous
    /// drivers, connect the event callback.
    pub(crate) fn register(&self) -> Result<()> {
        self.inner.core.set_registered();

        let reader_refs =
            self.inner
                .spi
                .search_available_readers()
                .map_err(|source| Error::PluginIo {
                    message: format!(
                        "unable to search available readers of plugin '{}'",
                        self.name()
                    ),
                    source,
                })?;
        for reader_ref in reader_refs {
            self.inner.attach_reader(reader_ref);
        }

        if let DetectionSource::Autonomous(spi) = &self.inner.source {
            spi.connect_plugin_api(self.inner.clone());
        }
        Ok(())
    }

    pub(crate) fn unregister(&self) {
        self.inner.unregister();
    }
}

impl fmt::Debug for ObservablePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservablePlugin")
            .field("name", &self.name())
            .field("observers", &self.count_observers())
            .finish()
    }
}

struct ObservablePluginInner {
    core: PluginCore,
    spi: Arc<dyn PluginSpi>,
    source: DetectionSource,
    observation: ObservationManager<dyn PluginObserver, dyn PluginObservationExceptionHandler>,
    watcher: Mutex<Option<WatcherHandle>>,
    self_ref: Weak<ObservablePluginInner>,
}

impl ObservablePluginInner {
    /// Build, register and map one discovered reader; returns its name.
    fn attach_reader(&self, reader_ref: ReaderSpiRef) -> String {
        let reader = build_reader(reader_ref, self.core.name());
        reader.register();
        let name = reader.name().to_string();
        debug!(plugin = %self.core.name(), reader = %name, "reader registered");
        self.core.insert_reader(reader);
        name
    }

    fn detach_reader(&self, name: &str) {
        if let Some(reader) = self.core.remove_reader(name) {
            reader.unregister();
            debug!(plugin = %self.core.name(), reader = %name, "reader unregistered");
        }
    }

    fn start_watcher(&self) {
        let DetectionSource::Polling(spi) = &self.source else {
            return;
        };
        let mut watcher = self.watcher.lock().unwrap();
        if watcher.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = unbounded();
        let weak_plugin = self.self_ref.clone();
        let spi = spi.clone();
        let plugin_name = self.core.name().to_string();

        let spawned = thread::Builder::new()
            .name(format!("plugin-watcher-{plugin_name}"))
            .spawn(move || {
                trace!(plugin = %plugin_name, "reader watcher started");
                loop {
                    let Some(plugin) = weak_plugin.upgrade() else {
                        return;
                    };
                    match spi.search_available_reader_names() {
                        Ok(names) => plugin.process_reader_changes(&names),
                        Err(source) => {
                            plugin.notify_observation_error(Box::new(Error::PluginIo {
                                message: "an error occurred while monitoring the readers"
                                    .to_string(),
                                source,
                            }));
                            return;
                        }
                    }
                    drop(plugin);
                    match stop_rx.recv_timeout(spi.monitoring_cycle()) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => {
                            trace!(plugin = %plugin_name, "reader watcher stopped");
                            return;
                        }
                    }
                }
            });

        match spawned {
            Ok(_) => *watcher = Some(WatcherHandle { stop_tx }),
            Err(e) => error!(
                plugin = %self.core.name(),
                error = %e,
                "failed to spawn reader watcher thread"
            ),
        }
    }

    fn stop_watcher(&self) {
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            let _ = handle.stop_tx.send(());
        }
    }

    /// Diff the driver's reader-name set against the current map, attach and
    /// detach readers accordingly and notify the changes.
    fn process_reader_changes(&self, available_names: &[String]) {
        let mut connected = Vec::new();
        for name in available_names {
            if self.core.contains_reader(name) {
                continue;
            }
            let DetectionSource::Polling(spi) = &self.source else {
                return;
            };
            match spi.search_reader(name) {
                Ok(Some(reader_ref)) => connected.push(self.attach_reader(reader_ref)),
                Ok(None) => {}
                Err(e) => warn!(
                    plugin = %self.core.name(),
                    reader = %name,
                    error = %e,
                    "unable to fetch a newly connected reader"
                ),
            }
        }

        let disconnected: Vec<String> = self
            .core
            .current_reader_names()
            .into_iter()
            .filter(|name| !available_names.contains(name))
            .collect();
        for name in &disconnected {
            self.detach_reader(name);
        }

        if !connected.is_empty() {
            self.notify_observers(PluginEvent::new(
                self.core.name(),
                connected,
                PluginEventType::ReaderConnected,
            ));
        }
        if !disconnected.is_empty() {
            self.notify_observers(PluginEvent::new(
                self.core.name(),
                disconnected,
                PluginEventType::ReaderDisconnected,
            ));
        }
    }

    fn notify_observers(&self, event: PluginEvent) {
        let snapshot = self.observation.snapshot();
        debug!(
            plugin = %self.core.name(),
            event = ?event.event_type(),
            observers = snapshot.observers.len(),
            "notifying plugin event"
        );

        match &snapshot.executor {
            None => {
                for observer in &snapshot.observers {
                    notify_plugin_observer(
                        observer,
                        snapshot.exception_handler.as_ref(),
                        self.core.name(),
                        &event,
                    );
                }
            }
            Some(executor) => {
                for observer in snapshot.observers {
                    let handler = snapshot.exception_handler.clone();
                    let plugin_name = self.core.name().to_string();
                    let event = event.clone();
                    executor.execute(Box::new(move || {
                        notify_plugin_observer(&observer, handler.as_ref(), &plugin_name, &event);
                    }));
                }
            }
        }
    }

    fn notify_observation_error(&self, error: ObservationError) {
        match self.observation.exception_handler() {
            Some(handler) => {
                if let Err(e) = handler.on_plugin_observation_error(self.core.name(), error) {
                    error!(
                        plugin = %self.core.name(),
                        error = %e,
                        "observation exception handler failed"
                    );
                }
            }
            None => {
                error!(
                    plugin = %self.core.name(),
                    error = %error,
                    "observation error and no exception handler is set"
                );
            }
        }
    }

    fn unregister(&self) {
        let reader_names = self.core.current_reader_names();
        self.core.unregister_readers();
        self.spi.on_unregister();
        self.notify_observers(PluginEvent::new(
            self.core.name(),
            reader_names,
            PluginEventType::Unavailable,
        ));
        self.observation.clear_observers();
        self.stop_watcher();
    }
}

impl PluginEventApi for ObservablePluginInner {
    fn on_reader_connected(&self, readers: Vec<ReaderSpiRef>) {
        let names: Vec<String> = readers
            .into_iter()
            .map(|reader_ref| self.attach_reader(reader_ref))
            .collect();
        if !names.is_empty() {
            self.notify_observers(PluginEvent::new(
                self.core.name(),
                names,
                PluginEventType::ReaderConnected,
            ));
        }
    }

    fn on_reader_disconnected(&self, reader_names: &[String]) {
        for name in reader_names {
            self.detach_reader(name);
        }
        if !reader_names.is_empty() {
            self.notify_observers(PluginEvent::new(
                self.core.name(),
                reader_names.to_vec(),
                PluginEventType::ReaderDisconnected,
            ));
        }
    }
}

fn notify_plugin_observer(
    observer: &Arc<dyn PluginObserver>,
    handler: Option<&Arc<dyn PluginObservationExceptionHandler>>,
    plugin_name: &str,
    event: &PluginEvent,
) {
    if let Err(e) = observer.on_plugin_event(event) {
        match handler {
            Some(handler) => {
                if let Err(e2) = handler.on_plugin_observation_error(plugin_name, e) {
                    error!(
                        plugin = %plugin_name,
                        error = %e2,
                        "observation exception handler failed during notification"
                    );
                }
            }
            None => {
                error!(
                    plugin = %plugin_name,
                    error = %e,
                    "observer failed and no exception handler is set"
                );
            }
        }
    }
}
