//! Unified error type for terminal service operations

use thiserror::Error;

use termcard_plugin_spi::{CardIoError, PluginIoError, ReaderIoError};

use crate::selection::CardResponse;

/// The main error type of the terminal service.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation was attempted on a component in the wrong state
    /// (unregistered plugin or reader, missing exception handler,
    /// unparseable version string).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A caller-supplied argument is invalid (empty name, factory/SPI name
    /// mismatch, invalid regex).
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A reader I/O failure outside of an APDU exchange (presence check,
    /// channel release).
    #[error("reader communication failure: {message}")]
    ReaderCommunication {
        /// What was being done when the reader failed.
        message: String,
        /// The driver-side failure.
        #[source]
        source: ReaderIoError,
    },

    /// The reader link broke in the middle of an APDU chain.
    #[error("reader communication broken while transmitting: {message}")]
    ReaderBrokenCommunication {
        /// The responses collected before the failure.
        response: CardResponse,
        /// Whether every request of the chain had been processed.
        fully_processed: bool,
        /// What was being done when the reader failed.
        message: String,
        /// The driver-side failure.
        #[source]
        source: ReaderIoError,
    },

    /// The card stopped answering in the middle of an APDU chain.
    #[error("card communication broken while transmitting: {message}")]
    CardBrokenCommunication {
        /// The responses collected before the failure.
        response: CardResponse,
        /// Whether every request of the chain had been processed.
        fully_processed: bool,
        /// What was being done when the card failed.
        message: String,
        /// The driver-side failure.
        #[source]
        source: CardIoError,
    },

    /// An APDU returned a status word outside its successful set while the
    /// request asked to stop on that.
    #[error("unexpected status word")]
    UnexpectedStatusWord {
        /// The responses collected so far, including the offending one.
        response: CardResponse,
        /// Whether every request of the chain had been processed.
        fully_processed: bool,
    },

    /// The driver does not recognize a reader protocol name.
    #[error("reader protocol not supported: {0}")]
    ProtocolNotSupported(String),

    /// A driver failure during a plugin-level operation.
    #[error("plugin I/O failure: {message}")]
    PluginIo {
        /// What was being done when the driver failed.
        message: String,
        /// The driver-side failure.
        #[source]
        source: PluginIoError,
    },

    /// A plugin-level operation failed at the service level.
    #[error("plugin failure: {0}")]
    Plugin(String),
}

impl Error {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub(crate) fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }
}

/// Result type for terminal service operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type produced by observers and observation exception handlers.
///
/// Observers report failures by value instead of unwinding; whatever they
/// return is routed to the observation exception handler and never reaches
/// the event producer.
pub type ObservationError = Box<dyn std::error::Error + Send + Sync>;
