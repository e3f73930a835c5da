//! Plugin-level SPI contracts

use std::sync::Arc;
use std::time::Duration;

use crate::error::PluginIoError;
use crate::reader::{ObservableReaderSpi, ReaderSpi};

/// A reader handed over by a driver, tagged with its detection ability.
///
/// This replaces runtime downcasting: the driver states once, at discovery
/// time, whether the reader can take part in card detection, and the service
/// builds the matching adapter variant.
#[derive(Clone)]
pub enum ReaderSpiRef {
    /// A reader without detection support.
    Simple(Arc<dyn ReaderSpi>),
    /// A reader supporting card detection.
    Observable(Arc<dyn ObservableReaderSpi>),
}

impl ReaderSpiRef {
    /// Name of the underlying reader.
    pub fn name(&self) -> &str {
        match self {
            Self::Simple(spi) => spi.name(),
            Self::Observable(spi) => spi.name(),
        }
    }
}

impl std::fmt::Debug for ReaderSpiRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple(spi) => f.debug_tuple("Simple").field(&spi.name()).finish(),
            Self::Observable(spi) => f.debug_tuple("Observable").field(&spi.name()).finish(),
        }
    }
}

/// Driver-side interface of a plugin: a named source of readers.
pub trait PluginSpi: Send + Sync {
    /// Name of the plugin.
    fn name(&self) -> &str;

    /// Enumerate the readers currently available from the driver.
    fn search_available_readers(&self) -> Result<Vec<ReaderSpiRef>, PluginIoError>;

    /// Invoked when the plugin is unregistered from the service.
    fn on_unregister(&self);
}

/// Extension of [`PluginSpi`] for drivers whose reader set changes over time
/// and must be polled.
pub trait ObservablePluginSpi: PluginSpi {
    /// Interval between two reader-list scans.
    fn monitoring_cycle(&self) -> Duration;

    /// Enumerate the names of the readers currently available.
    fn search_available_reader_names(&self) -> Result<Vec<String>, PluginIoError>;

    /// Retrieve a single reader by name, or `None` if it disappeared since
    /// the name scan.
    fn search_reader(&self, reader_name: &str) -> Result<Option<ReaderSpiRef>, PluginIoError>;
}

/// Extension of [`PluginSpi`] for drivers that push reader connection events
/// themselves instead of being polled.
pub trait AutonomousObservablePluginSpi: PluginSpi {
    /// Hand the driver the callback it must invoke on reader arrival or
    /// departure. Called once at plugin registration.
    fn connect_plugin_api(&self, api: Arc<dyn PluginEventApi>);
}

/// Callback implemented by the service; autonomous plugin drivers invoke it
/// when their reader set changes.
pub trait PluginEventApi: Send + Sync {
    /// Signal that new readers are available.
    fn on_reader_connected(&self, readers: Vec<ReaderSpiRef>);

    /// Signal that the named readers are gone.
    fn on_reader_disconnected(&self, reader_names: &[String]);
}

/// Driver-side interface of a pool plugin: readers are minted on demand from
/// named groups and destroyed on release.
pub trait PoolPluginSpi: Send + Sync {
    /// Name of the pool plugin.
    fn name(&self) -> &str;

    /// Names of the reader groups readers can be allocated from.
    fn reader_group_references(&self) -> Result<Vec<String>, PluginIoError>;

    /// Allocate a reader from the given group.
    fn allocate_reader(&self, group_reference: &str) -> Result<ReaderSpiRef, PluginIoError>;

    /// Release a previously allocated reader.
    fn release_reader(&self, reader_name: &str) -> Result<(), PluginIoError>;

    /// Invoked when the pool plugin is unregistered from the service.
    fn on_unregister(&self);
}
