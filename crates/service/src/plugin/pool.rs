//! Pool plugin adapter
//!
//! Readers are minted by the driver on allocation and destroyed on release;
//! the plugin's reader map tracks the currently allocated readers.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use termcard_plugin_spi::PoolPluginSpi;

use super::PluginCore;
use crate::error::{Error, Result};
use crate::reader::{Reader, build_reader};

/// A plugin allocating readers on demand from named groups.
#[derive(Clone)]
pub struct PoolPlugin {
    inner: Arc<PoolPluginInner>,
}

struct PoolPluginInner {
    core: PluginCore,
    spi: Arc<dyn PoolPluginSpi>,
}

impl PoolPlugin {
    pub(crate) fn new(spi: Arc<dyn PoolPluginSpi>) -> Self {
        Self {
            inner: Arc::new(PoolPluginInner {
                core: PluginCore::new(spi.name()),
                spi,
            }),
        }
    }

    /// Name of the plugin.
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Names of the groups readers can be allocated from.
    pub fn reader_group_references(&self) -> Result<Vec<String>> {
        self.inner.core.check_registered()?;
        self.inner.spi.reader_group_references().map_err(|e| {
            Error::Plugin(format!(
                "unable to get the reader group references of pool plugin '{}': {e}",
                self.name()
            ))
        })
    }

    /// Allocate a reader from the given group. The reader joins the plugin's
    /// reader map until released.
    pub fn allocate_reader(&self, group_reference: &str) -> Result<Reader> {
        self.inner.core.check_registered()?;
        let reader_ref = self.inner.spi.allocate_reader(group_reference).map_err(|e| {
            Error::Plugin(format!(
                "unable to allocate a reader of group '{group_reference}' from pool plugin '{}': {e}",
                self.name()
            ))
        })?;

        let reader = build_reader(reader_ref, self.name());
        reader.register();
        debug!(
            plugin = %self.name(),
            reader = %reader.name(),
            group = %group_reference,
            "reader allocated"
        );
        self.inner.core.insert_reader(reader.clone());
        Ok(reader)
    }

    /// Release an allocated reader. The reader leaves the plugin's reader map
    /// and is unregistered even when the driver call fails.
    pub fn release_reader(&self, reader: &Reader) -> Result<()> {
        self.inner.core.check_registered()?;

        let result = self.inner.spi.release_reader(reader.name()).map_err(|e| {
            Error::Plugin(format!(
                "unable to release the reader '{}' of pool plugin '{}': {e}",
                reader.name(),
                self.name()
            ))
        });

        if let Some(allocated) = self.inner.core.remove_reader(reader.name()) {
            allocated.unregister();
            debug!(plugin = %self.name(), reader = %reader.name(), "reader released");
        }
        result
    }

    pub(crate) fn core(&self) -> &PluginCore {
        &self.inner.core
    }

    pub(crate) fn register(&self) -> Result<()> {
        self.inner.core.set_registered();
        Ok(())
    }

    pub(crate) fn unregister(&self) {
        self.inner.core.unregister_readers();
        self.inner.spi.on_unregister();
    }
}

impl fmt::Debug for PoolPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolPlugin").field("name", &self.name()).finish()
    }
}
