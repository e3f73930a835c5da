//! Smartcard terminal service
//!
//! This crate mediates between applications wanting to talk to
//! contact/contactless smartcards and concrete reader drivers implementing
//! the [`termcard_plugin_spi`] contracts. It presents a uniform, reactive
//! view of *plugins* (sources of readers) and *readers* (objects exchanging
//! APDUs with a card) and handles the intricate parts of the job:
//!
//! - the card detection state machine and its monitoring jobs (active
//!   polling, passive blocking waits, autonomous driver callbacks),
//! - the APDU selection engine, applying [`CardSelectionScenario`]s on
//!   insertion with the ISO 7816-4 case-4 GET RESPONSE quirk,
//! - observer notification with exception-handler indirection and optional
//!   executor-based dispatch,
//! - the plugin/reader registry, including the pool-plugin allocate/release
//!   contract.
//!
//! The concurrency model is plain OS threads; there is no async runtime. The
//! library logs through [`tracing`] and installs no subscriber.
//!
//! # Getting started
//!
//! ```no_run
//! use termcard_service::{DetectionMode, SmartCardService};
//! # fn factory() -> std::sync::Arc<dyn termcard_plugin_spi::PluginFactorySpi> { unimplemented!() }
//!
//! # fn main() -> Result<(), termcard_service::Error> {
//! let service = SmartCardService::new();
//! let plugin = service.register_plugin(factory())?;
//!
//! for reader in plugin.readers()? {
//!     if let Some(observable) = reader.as_observable() {
//!         observable.start_card_detection(DetectionMode::Repeating)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod error;
mod event;
mod observation;
mod plugin;
mod reader;
mod selection;
mod service;

pub use error::{Error, ObservationError, Result};
pub use event::{PluginEvent, PluginEventType, ReaderEvent, ReaderEventType};
pub use observation::{
    CardReaderObserver, EventNotificationExecutor, PluginObservationExceptionHandler,
    PluginObserver, ReaderObservationExceptionHandler, SingleThreadExecutor,
};
pub use plugin::{LocalPlugin, ObservablePlugin, Plugin, PoolPlugin};
pub use reader::{DetectionMode, LocalReader, NotificationMode, ObservableReader, Reader};
pub use selection::{
    ApduRequest, ApduResponse, CardRequest, CardResponse, CardSelectionManager,
    CardSelectionRequest, CardSelectionResponse, CardSelectionResult, CardSelectionScenario,
    CardSelector, ChannelControl, DEFAULT_SUCCESSFUL_STATUS_WORD, FileControlInformation,
    FileOccurrence, MultiSelectionProcessing, is_case4,
};
pub use service::{
    CARD_API_VERSION, COMMON_API_VERSION, CardExtension, PLUGIN_API_VERSION, SERVICE_API_VERSION,
    SmartCardService,
};
