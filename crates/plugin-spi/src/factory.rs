//! Plugin factories
//!
//! A factory is the object an application hands to the service to register a
//! plugin. It carries the plugin name, the API versions the driver was built
//! against, and produces the SPI itself. The service cross-checks the name
//! against the produced SPI and warns when the versions drift from its own.

use std::sync::Arc;

use crate::plugin::{AutonomousObservablePluginSpi, ObservablePluginSpi, PluginSpi, PoolPluginSpi};

/// A plugin SPI produced by a factory, tagged with its observation model.
#[derive(Clone)]
pub enum PluginSpiRef {
    /// A plugin with a fixed reader set.
    Simple(Arc<dyn PluginSpi>),
    /// A plugin whose reader set is discovered by polling.
    Observable(Arc<dyn ObservablePluginSpi>),
    /// A plugin whose driver pushes reader events itself.
    Autonomous(Arc<dyn AutonomousObservablePluginSpi>),
}

impl PluginSpiRef {
    /// Name declared by the underlying SPI.
    pub fn name(&self) -> &str {
        match self {
            Self::Simple(spi) => spi.name(),
            Self::Observable(spi) => spi.name(),
            Self::Autonomous(spi) => spi.name(),
        }
    }
}

impl std::fmt::Debug for PluginSpiRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Simple(_) => "Simple",
            Self::Observable(_) => "Observable",
            Self::Autonomous(_) => "Autonomous",
        };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}

/// Factory for local (non-pool) plugins.
pub trait PluginFactorySpi: Send + Sync {
    /// Name of the plugin this factory produces.
    fn plugin_name(&self) -> &str;

    /// Version of the plugin SPI the driver was compiled against.
    fn plugin_api_version(&self) -> &str;

    /// Version of the common API the driver was compiled against.
    fn common_api_version(&self) -> &str;

    /// Version of the service API the driver was compiled against.
    fn service_api_version(&self) -> &str;

    /// Produce the plugin SPI.
    fn plugin(&self) -> PluginSpiRef;
}

/// Factory for pool plugins.
pub trait PoolPluginFactorySpi: Send + Sync {
    /// Name of the pool plugin this factory produces.
    fn pool_plugin_name(&self) -> &str;

    /// Version of the plugin SPI the driver was compiled against.
    fn plugin_api_version(&self) -> &str;

    /// Version of the common API the driver was compiled against.
    fn common_api_version(&self) -> &str;

    /// Version of the service API the driver was compiled against.
    fn service_api_version(&self) -> &str;

    /// Produce the pool plugin SPI.
    fn pool_plugin(&self) -> Arc<dyn PoolPluginSpi>;
}

/// The factory variants accepted by the service registry.
#[derive(Clone)]
pub enum PluginFactory {
    /// Factory for a local plugin (simple, observable or autonomous).
    Local(Arc<dyn PluginFactorySpi>),
    /// Factory for a pool plugin.
    Pool(Arc<dyn PoolPluginFactorySpi>),
}

impl PluginFactory {
    /// Name of the plugin the factory produces.
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::Local(factory) => factory.plugin_name(),
            Self::Pool(factory) => factory.pool_plugin_name(),
        }
    }
}

impl From<Arc<dyn PluginFactorySpi>> for PluginFactory {
    fn from(factory: Arc<dyn PluginFactorySpi>) -> Self {
        Self::Local(factory)
    }
}

impl From<Arc<dyn PoolPluginFactorySpi>> for PluginFactory {
    fn from(factory: Arc<dyn PoolPluginFactorySpi>) -> Self {
        Self::Pool(factory)
    }
}
