//! Error types surfaced by driver SPIs

use thiserror::Error;

/// I/O failure on the reader side (link to the reader device lost or broken).
#[derive(Debug, Clone, Error)]
#[error("reader I/O failure: {0}")]
pub struct ReaderIoError(pub String);

impl ReaderIoError {
    /// Create a new error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// I/O failure on the card side (card mute, removed mid-exchange, protocol
/// error), while the reader itself is still reachable.
#[derive(Debug, Clone, Error)]
#[error("card I/O failure: {0}")]
pub struct CardIoError(pub String);

impl CardIoError {
    /// Create a new error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// I/O failure during a plugin-level operation (reader scan, pool
/// allocation/release).
#[derive(Debug, Clone, Error)]
#[error("plugin I/O failure: {0}")]
pub struct PluginIoError(pub String);

impl PluginIoError {
    /// Create a new error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure reported by an APDU exchange or a physical channel operation.
///
/// The distinction drives the service-level taxonomy: a reader failure breaks
/// the link to the terminal, a card failure only invalidates the current card
/// session.
#[derive(Debug, Clone, Error)]
pub enum TransmitError {
    /// The reader link failed.
    #[error(transparent)]
    Reader(#[from] ReaderIoError),
    /// The card did not answer correctly.
    #[error(transparent)]
    Card(#[from] CardIoError),
}

/// Outcome of a blocking wait primitive
/// ([`crate::WaitForCardInsertionBlockingSpi`] /
/// [`crate::WaitForCardRemovalBlockingSpi`]).
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    /// The wait was interrupted by the matching `stop_wait_for_*` call.
    #[error("wait canceled")]
    Canceled,
    /// The reader link failed while waiting.
    #[error(transparent)]
    Reader(#[from] ReaderIoError),
}
