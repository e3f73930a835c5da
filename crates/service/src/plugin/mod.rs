//! Plugin adapters
//!
//! A plugin owns a mapping from reader name to [`Reader`]. The [`Plugin`]
//! enum is what the service registry hands out: a plain local plugin, an
//! observable one (polling watcher or autonomous driver), or a pool plugin.

mod observable;
mod pool;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use termcard_plugin_spi::PluginSpi;

use crate::error::{Error, Result};
use crate::reader::{Reader, build_reader};

pub use observable::ObservablePlugin;
pub use pool::PoolPlugin;

/// A plugin registered with the service.
#[derive(Clone)]
pub enum Plugin {
    /// A local plugin with a fixed reader set.
    Local(LocalPlugin),
    /// A local plugin notifying reader connections and disconnections.
    Observable(ObservablePlugin),
    /// A pool plugin allocating readers on demand.
    Pool(PoolPlugin),
}

impl Plugin {
    /// Name of the plugin.
    pub fn name(&self) -> &str {
        self.core().name()
    }

    /// Names of the readers currently owned by the plugin.
    pub fn reader_names(&self) -> Result<Vec<String>> {
        self.core().reader_names()
    }

    /// The readers currently owned by the plugin.
    pub fn readers(&self) -> Result<Vec<Reader>> {
        self.core().readers()
    }

    /// A reader by name, or `None` when the plugin does not own it.
    pub fn reader(&self, name: &str) -> Result<Option<Reader>> {
        self.core().reader(name)
    }

    /// The observable view of the plugin, when it supports observation.
    pub fn as_observable(&self) -> Option<&ObservablePlugin> {
        match self {
            Self::Observable(plugin) => Some(plugin),
            _ => None,
        }
    }

    /// The pool view of the plugin, when it is a pool plugin.
    pub fn as_pool(&self) -> Option<&PoolPlugin> {
        match self {
            Self::Pool(plugin) => Some(plugin),
            _ => None,
        }
    }

    fn core(&self) -> &PluginCore {
        match self {
            Self::Local(plugin) => &plugin.inner.core,
            Self::Observable(plugin) => plugin.core(),
            Self::Pool(plugin) => plugin.core(),
        }
    }

    pub(crate) fn register(&self) -> Result<()> {
        match self {
            Self::Local(plugin) => plugin.register(),
            Self::Observable(plugin) => plugin.register(),
            Self::Pool(plugin) => plugin.register(),
        }
    }

    pub(crate) fn unregister(&self) {
        match self {
            Self::Local(plugin) => plugin.unregister(),
            Self::Observable(plugin) => plugin.unregister(),
            Self::Pool(plugin) => plugin.unregister(),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Local(_) => "Local",
            Self::Observable(_) => "Observable",
            Self::Pool(_) => "Pool",
        };
        f.debug_struct("Plugin")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}

/// State shared by every plugin adapter variant: the name, the registered
/// flag and the reader map.
pub(crate) struct PluginCore {
    name: String,
    registered: AtomicBool,
    readers: Mutex<HashMap<String, Reader>>,
}

impl PluginCore {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registered: AtomicBool::new(false),
            readers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn check_registered(&self) -> Result<()> {
        if self.registered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::illegal_state(format!(
                "the plugin '{}' is not or no longer registered",
                self.name
            )))
        }
    }

    pub(crate) fn reader_names(&self) -> Result<Vec<String>> {
        self.check_registered()?;
        Ok(self.readers.lock().unwrap().keys().cloned().collect())
    }

    pub(crate) fn readers(&self) -> Result<Vec<Reader>> {
        self.check_registered()?;
        Ok(self.readers.lock().unwrap().values().cloned().collect())
    }

    pub(crate) fn reader(&self, name: &str) -> Result<Option<Reader>> {
        self.check_registered()?;
        Ok(self.readers.lock().unwrap().get(name).cloned())
    }

    pub(crate) fn contains_reader(&self, name: &str) -> bool {
        self.readers.lock().unwrap().contains_key(name)
    }

    pub(crate) fn current_reader_names(&self) -> Vec<String> {
        self.readers.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn insert_reader(&self, reader: Reader) {
        self.readers
            .lock()
            .unwrap()
            .insert(reader.name().to_string(), reader);
    }

    pub(crate) fn remove_reader(&self, name: &str) -> Option<Reader> {
        self.readers.lock().unwrap().remove(name)
    }

    /// Clear the registered flag, then unregister and drop every reader.
    pub(crate) fn unregister_readers(&self) {
        self.registered.store(false, Ordering::SeqCst);
        let readers: Vec<Reader> = self.readers.lock().unwrap().drain().map(|(_, r)| r).collect();
        for reader in readers {
            reader.unregister();
        }
    }
}

/// A local plugin with a reader set fixed at registration time.
#[derive(Clone)]
pub struct LocalPlugin {
    inner: Arc<LocalPluginInner>,
}

struct LocalPluginInner {
    core: PluginCore,
    spi: Arc<dyn PluginSpi>,
}

impl LocalPlugin {
    pub(crate) fn new(spi: Arc<dyn PluginSpi>) -> Self {
        Self {
            inner: Arc::new(LocalPluginInner {
                core: PluginCore::new(spi.name()),
                spi,
            }),
        }
    }

    /// Name of the plugin.
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Scan the driver and build one reader adapter per available reader.
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
            let reader = build_reader(reader_ref, self.name());
            reader.register();
            debug!(plugin = %self.name(), reader = %reader.name(), "reader registered");
            self.inner.core.insert_reader(reader);
        }
        Ok(())
    }

    pub(crate) fn unregister(&self) {
        self.inner.core.unregister_readers();
        self.inner.spi.on_unregister();
    }
}

impl fmt::Debug for LocalPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPlugin").field("name", &self.name()).finish()
    }
}
