//! Reader-level SPI contracts
//!
//! [`ReaderSpi`] is the minimum surface a driver exposes for one reader.
//! [`ObservableReaderSpi`] extends it for readers able to take part in card
//! detection; the optional capabilities (blocking waits, autonomous event
//! push, driver-side AID selection) are exposed through accessors returning
//! `Option<&dyn ...>` so the service can take a capability snapshot once at
//! reader construction instead of downcasting at every use.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ReaderIoError, TransmitError, WaitError};

/// Driver-side interface of a single smartcard reader.
///
/// Implementations must be safe to share across threads: the service calls
/// into the SPI concurrently from application threads and monitoring jobs.
pub trait ReaderSpi: Send + Sync {
    /// Name of the reader, unique within its plugin.
    fn name(&self) -> &str;

    /// Open the physical channel to the card currently in the reader.
    fn open_physical_channel(&self) -> Result<(), TransmitError>;

    /// Close the physical channel.
    fn close_physical_channel(&self) -> Result<(), ReaderIoError>;

    /// Whether the physical channel is currently open.
    fn is_physical_channel_open(&self) -> bool;

    /// Whether a card is present in the reader.
    fn check_card_presence(&self) -> Result<bool, ReaderIoError>;

    /// Power-on data of the current card (historically the ATR/ATS), as an
    /// uppercase hexadecimal string. Empty when unavailable.
    fn power_on_data(&self) -> String;

    /// Transmit a raw APDU and return the raw response (data-out followed by
    /// the two status-word bytes).
    fn transmit_apdu(&self, apdu: &[u8]) -> Result<Bytes, TransmitError>;

    /// Whether the reader communicates with cards over a contactless
    /// interface.
    fn is_contactless(&self) -> bool;

    /// Whether the driver knows the given reader protocol name.
    fn is_protocol_supported(&self, reader_protocol: &str) -> bool;

    /// Whether the given reader protocol is the one used by the current card.
    fn is_current_protocol(&self, reader_protocol: &str) -> bool;

    /// Start looking for cards using the given protocol.
    fn activate_protocol(&self, reader_protocol: &str);

    /// Stop looking for cards using the given protocol.
    fn deactivate_protocol(&self, reader_protocol: &str);

    /// Invoked when the owning reader is unregistered from the service.
    fn on_unregister(&self);
}

/// Extension of [`ReaderSpi`] for readers that participate in card detection.
pub trait ObservableReaderSpi: ReaderSpi {
    /// Invoked when the service starts the card detection sequence.
    fn on_start_detection(&self);

    /// Invoked when the service stops the card detection sequence.
    fn on_stop_detection(&self);

    /// Poll period used by the service when it has to detect card presence
    /// changes actively.
    fn monitoring_cycle(&self) -> Duration {
        Duration::from_millis(200)
    }

    /// Blocking insertion detection, when the driver supports it.
    fn insertion_blocking(&self) -> Option<&dyn WaitForCardInsertionBlockingSpi> {
        None
    }

    /// Autonomous insertion detection, when the driver pushes the event
    /// itself.
    fn insertion_autonomous(&self) -> Option<&dyn WaitForCardInsertionAutonomousSpi> {
        None
    }

    /// Blocking removal detection, when the driver supports it.
    fn removal_blocking(&self) -> Option<&dyn WaitForCardRemovalBlockingSpi> {
        None
    }

    /// Autonomous removal detection, when the driver pushes the event itself.
    fn removal_autonomous(&self) -> Option<&dyn WaitForCardRemovalAutonomousSpi> {
        None
    }

    /// Driver-side AID selection, when the reader opens the logical channel
    /// itself.
    fn autonomous_selection(&self) -> Option<&dyn AutonomousSelectionReaderSpi> {
        None
    }

    /// When true, the service does not monitor card presence while the
    /// application is processing the card.
    fn skip_removal_monitoring_during_processing(&self) -> bool {
        false
    }
}

/// Capability of a driver able to block the calling thread until a card is
/// inserted.
pub trait WaitForCardInsertionBlockingSpi: Send + Sync {
    /// Block until a card is inserted or [`Self::stop_wait_for_card_insertion`]
    /// is called from another thread.
    fn wait_for_card_insertion(&self) -> Result<(), WaitError>;

    /// Make a pending [`Self::wait_for_card_insertion`] return promptly with
    /// [`WaitError::Canceled`].
    fn stop_wait_for_card_insertion(&self);
}

/// Capability of a driver able to block the calling thread until the card is
/// removed.
pub trait WaitForCardRemovalBlockingSpi: Send + Sync {
    /// Block until the card is removed or [`Self::stop_wait_for_card_removal`]
    /// is called from another thread.
    fn wait_for_card_removal(&self) -> Result<(), WaitError>;

    /// Make a pending [`Self::wait_for_card_removal`] return promptly with
    /// [`WaitError::Canceled`].
    fn stop_wait_for_card_removal(&self);
}

/// Capability of a driver that detects card insertion on its own and pushes
/// the event through a [`CardInsertionApi`].
pub trait WaitForCardInsertionAutonomousSpi: Send + Sync {
    /// Hand the driver the callback it must invoke on insertion. Called once
    /// when the observable reader is built.
    fn connect_insertion_api(&self, api: Arc<dyn CardInsertionApi>);
}

/// Capability of a driver that detects card removal on its own and pushes the
/// event through a [`CardRemovalApi`].
pub trait WaitForCardRemovalAutonomousSpi: Send + Sync {
    /// Hand the driver the callback it must invoke on removal. Called once
    /// when the observable reader is built.
    fn connect_removal_api(&self, api: Arc<dyn CardRemovalApi>);
}

/// Capability of a driver that performs the SELECT APPLICATION exchange
/// itself.
pub trait AutonomousSelectionReaderSpi: Send + Sync {
    /// Open the logical channel for the given AID and P2 parameter and return
    /// the raw FCI response (data-out plus status word).
    fn open_channel_for_aid(&self, aid: &[u8], p2: u8) -> Result<Bytes, TransmitError>;

    /// Close the logical channel previously opened by
    /// [`Self::open_channel_for_aid`].
    fn close_logical_channel(&self);
}

/// Callback implemented by the service; autonomous drivers invoke it when
/// they detect a card insertion.
pub trait CardInsertionApi: Send + Sync {
    /// Signal that a card has been inserted.
    fn on_card_inserted(&self);
}

/// Callback implemented by the service; autonomous drivers invoke it when
/// they detect a card removal.
pub trait CardRemovalApi: Send + Sync {
    /// Signal that the card has been removed.
    fn on_card_removed(&self);
}
