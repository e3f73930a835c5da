//! Driver-side contracts for the termcard terminal service
//!
//! This crate defines the SPI (service provider interface) implemented by
//! concrete reader drivers (PC/SC, NFC controllers, embedded interfaces) and
//! consumed by `termcard-service`. A driver exposes:
//!
//! - a [`PluginSpi`] (or one of its observable/pool variants) describing a
//!   source of readers,
//! - one [`ReaderSpi`] per physical reader, optionally extended to
//!   [`ObservableReaderSpi`] with capability mixins for blocking or
//!   autonomous card detection,
//! - a [`PluginFactorySpi`]/[`PoolPluginFactorySpi`] handed to the service at
//!   registration time.
//!
//! All SPI objects are shared across threads by the service (monitoring jobs,
//! watcher threads, application calls), so every trait here is `Send + Sync`
//! and methods take `&self`; drivers manage their own interior mutability.
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod error;
mod factory;
mod plugin;
mod reader;

pub use error::{CardIoError, PluginIoError, ReaderIoError, TransmitError, WaitError};
pub use factory::{PluginFactory, PluginFactorySpi, PluginSpiRef, PoolPluginFactorySpi};
pub use plugin::{
    AutonomousObservablePluginSpi, ObservablePluginSpi, PluginEventApi, PluginSpi, PoolPluginSpi,
    ReaderSpiRef,
};
pub use reader::{
    AutonomousSelectionReaderSpi, CardInsertionApi, CardRemovalApi, ObservableReaderSpi, ReaderSpi,
    WaitForCardInsertionAutonomousSpi, WaitForCardInsertionBlockingSpi,
    WaitForCardRemovalAutonomousSpi, WaitForCardRemovalBlockingSpi,
};
