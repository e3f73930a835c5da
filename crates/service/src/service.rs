//! Service registry
//!
//! [`SmartCardService`] is the entry point of the terminal service: it owns
//! the plugin registry and cross-checks the API versions drivers were built
//! against. It is a plain handle; place it wherever the application needs it
//! instead of relying on a process-wide global.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tracing::{info, warn};

use termcard_plugin_spi::{PluginFactory, PluginSpiRef};

use crate::error::{Error, Result};
use crate::plugin::{LocalPlugin, ObservablePlugin, Plugin, PoolPlugin};
use crate::selection::CardSelectionManager;

/// Version of the common API this service is compiled against.
pub const COMMON_API_VERSION: &str = "2.0.1";
/// Version of the plugin SPI this service is compiled against.
pub const PLUGIN_API_VERSION: &str = "2.3.1";
/// Version of the service API this service is compiled against.
pub const SERVICE_API_VERSION: &str = "3.2.0";
/// Version of the card API this service is compiled against.
pub const CARD_API_VERSION: &str = "2.1.0";

/// A card extension library checked for API compatibility before use.
pub trait CardExtension {
    /// Version of the card API the extension was compiled against.
    fn card_api_version(&self) -> &str;

    /// Version of the common API the extension was compiled against.
    fn common_api_version(&self) -> &str;

    /// Version of the service API the extension was compiled against.
    fn service_api_version(&self) -> &str;
}

/// The terminal service: a registry of plugins.
#[derive(Default)]
pub struct SmartCardService {
    plugins: Mutex<HashMap<String, Plugin>>,
}

impl SmartCardService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin produced by the given factory and return its handle.
    ///
    /// Fails with illegal-state when a plugin with the same name is already
    /// registered, with illegal-argument when the factory and the SPI it
    /// produces disagree on the plugin name. API version drift only logs a
    /// warning, but an unparseable version string is an illegal-state.
    pub fn register_plugin(&self, factory: impl Into<PluginFactory>) -> Result<Plugin> {
        let factory = factory.into();
        let mut plugins = self.plugins.lock().unwrap();

        let declared_name = factory.plugin_name().to_string();
        info!(plugin = %declared_name, "registering plugin");
        if plugins.contains_key(&declared_name) {
            return Err(Error::illegal_state(format!(
                "the plugin '{declared_name}' has already been registered to the service"
            )));
        }

        let plugin = match &factory {
            PluginFactory::Local(factory) => {
                check_version_drift(
                    &declared_name,
                    "common API",
                    factory.common_api_version(),
                    COMMON_API_VERSION,
                )?;
                check_version_drift(
                    &declared_name,
                    "plugin API",
                    factory.plugin_api_version(),
                    PLUGIN_API_VERSION,
                )?;
                check_version_drift(
                    &declared_name,
                    "service API",
                    factory.service_api_version(),
                    SERVICE_API_VERSION,
                )?;

                let spi_ref = factory.plugin();
                check_name_consistency(&declared_name, spi_ref.name())?;
                match spi_ref {
                    PluginSpiRef::Simple(spi) => Plugin::Local(LocalPlugin::new(spi)),
                    PluginSpiRef::Observable(spi) => {
                        Plugin::Observable(ObservablePlugin::new_polling(spi))
                    }
                    PluginSpiRef::Autonomous(spi) => {
                        Plugin::Observable(ObservablePlugin::new_autonomous(spi))
                    }
                }
            }
            PluginFactory::Pool(factory) => {
                check_version_drift(
                    &declared_name,
                    "common API",
                    factory.common_api_version(),
                    COMMON_API_VERSION,
                )?;
                check_version_drift(
                    &declared_name,
                    "plugin API",
                    factory.plugin_api_version(),
                    PLUGIN_API_VERSION,
                )?;
                check_version_drift(
                    &declared_name,
                    "service API",
                    factory.service_api_version(),
                    SERVICE_API_VERSION,
                )?;

                let spi = factory.pool_plugin();
                check_name_consistency(&declared_name, spi.name())?;
                Plugin::Pool(PoolPlugin::new(spi))
            }
        };

        plugin.register().map_err(|e| {
            Error::Plugin(format!(
                "unable to register the plugin '{declared_name}': {e}"
            ))
        })?;

        plugins.insert(declared_name, plugin.clone());
        Ok(plugin)
    }

    /// Unregister a plugin by name: its readers are unregistered and, for
    /// observable plugins, observers receive a final UNAVAILABLE event.
    /// Unknown names only log a warning.
    pub fn unregister_plugin(&self, plugin_name: &str) {
        info!(plugin = %plugin_name, "unregistering plugin");
        let removed = self.plugins.lock().unwrap().remove(plugin_name);
        match removed {
            Some(plugin) => plugin.unregister(),
            None => warn!(plugin = %plugin_name, "the plugin is not registered"),
        }
    }

    /// A registered plugin by name.
    pub fn plugin(&self, plugin_name: &str) -> Option<Plugin> {
        self.plugins.lock().unwrap().get(plugin_name).cloned()
    }

    /// Names of the registered plugins.
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.lock().unwrap().keys().cloned().collect()
    }

    /// The registered plugins.
    pub fn plugins(&self) -> Vec<Plugin> {
        self.plugins.lock().unwrap().values().cloned().collect()
    }

    /// Create an empty card selection manager.
    pub fn create_card_selection_manager(&self) -> CardSelectionManager {
        CardSelectionManager::new()
    }

    /// Check a card extension's API versions against the service's. Drift
    /// logs a warning; only an unparseable version fails.
    pub fn check_card_extension(&self, extension: &dyn CardExtension) -> Result<()> {
        check_version_drift(
            "card extension",
            "common API",
            extension.common_api_version(),
            COMMON_API_VERSION,
        )?;
        check_version_drift(
            "card extension",
            "card API",
            extension.card_api_version(),
            CARD_API_VERSION,
        )?;
        check_version_drift(
            "card extension",
            "service API",
            extension.service_api_version(),
            SERVICE_API_VERSION,
        )?;
        Ok(())
    }
}

impl fmt::Debug for SmartCardService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartCardService")
            .field("plugins", &self.plugin_names())
            .finish()
    }
}

fn check_name_consistency(declared: &str, actual: &str) -> Result<()> {
    if declared == actual {
        Ok(())
    } else {
        Err(Error::illegal_argument(format!(
            "the plugin name '{actual}' mismatches the name '{declared}' provided by the factory"
        )))
    }
}

fn check_version_drift(who: &str, what: &str, provided: &str, local: &str) -> Result<()> {
    if !versions_match(provided, local)? {
        warn!(
            component = %who,
            api = %what,
            provided = %provided,
            local = %local,
            "the API version used by the provided component mismatches the version used by the service"
        );
    }
    Ok(())
}

/// Compare two dot-separated decimal version strings as weighted integers.
fn versions_match(provided: &str, local: &str) -> Result<bool> {
    Ok(version_weight(provided, local)? == version_weight(local, provided)?)
}

fn version_weight(version: &str, other: &str) -> Result<u64> {
    let components: Vec<&str> = version.split('.').collect();
    if components.len() != other.split('.').count() {
        return Err(Error::illegal_state(format!(
            "inconsistent version numbers: '{version}' vs '{other}'"
        )));
    }
    components.iter().try_fold(0u64, |weight, component| {
        let value: u64 = component.parse().map_err(|_| {
            Error::illegal_state(format!("bad version number: '{version}'"))
        })?;
        Ok(weight * 1000 + value)
    })
}
