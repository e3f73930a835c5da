//! Card selection model
//!
//! A [`CardSelectionScenario`] is an ordered list of [`CardSelectionRequest`]s
//! applied when a card shows up: each request filters the card (protocol,
//! power-on data, AID) and may chain follow-up APDUs once the filter matched.

pub mod apdu;
mod manager;

use bytes::Bytes;
use regex::Regex;

use crate::error::{Error, Result};

pub use apdu::{
    ApduRequest, ApduResponse, CardRequest, CardResponse, DEFAULT_SUCCESSFUL_STATUS_WORD, is_case4,
};
pub use manager::{CardSelectionManager, CardSelectionResult};

/// Which occurrence of the application is selected when several share the
/// same AID prefix. Encoded in the low two bits of the SELECT P2 byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileOccurrence {
    /// First or only occurrence.
    #[default]
    First,
    /// Last occurrence.
    Last,
    /// Next occurrence relative to the current one.
    Next,
    /// Previous occurrence relative to the current one.
    Previous,
}

impl FileOccurrence {
    pub(crate) fn p2_bits(self) -> u8 {
        match self {
            Self::First => 0x00,
            Self::Last => 0x01,
            Self::Next => 0x02,
            Self::Previous => 0x03,
        }
    }

    /// Decode the occurrence from a SELECT P2 byte.
    pub fn from_p2(p2: u8) -> Self {
        match p2 & 0x03 {
            0x00 => Self::First,
            0x01 => Self::Last,
            0x02 => Self::Next,
            _ => Self::Previous,
        }
    }
}

/// Which response template the SELECT asks the card for. Encoded in bits 2-3
/// of the SELECT P2 byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileControlInformation {
    /// File control information template.
    #[default]
    Fci,
    /// File control parameters template.
    Fcp,
    /// File management data template.
    Fmd,
    /// No response data.
    NoResponse,
}

impl FileControlInformation {
    pub(crate) fn p2_bits(self) -> u8 {
        match self {
            Self::Fci => 0x00,
            Self::Fcp => 0x04,
            Self::Fmd => 0x08,
            Self::NoResponse => 0x0C,
        }
    }

    /// Decode the template request from a SELECT P2 byte.
    pub fn from_p2(p2: u8) -> Self {
        match p2 & 0x0C {
            0x00 => Self::Fci,
            0x04 => Self::Fcp,
            0x08 => Self::Fmd,
            _ => Self::NoResponse,
        }
    }
}

/// Filter describing the card a selection request targets.
#[derive(Debug, Clone)]
pub struct CardSelector {
    aid: Option<Bytes>,
    file_occurrence: FileOccurrence,
    file_control_information: FileControlInformation,
    power_on_data_regex: Option<Regex>,
    card_protocol: Option<String>,
    successful_status_words: Vec<u16>,
}

impl Default for CardSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl CardSelector {
    /// Create an empty selector: no AID, no power-on-data filter, no protocol
    /// filter, successful status words `{9000}`.
    pub fn new() -> Self {
        Self {
            aid: None,
            file_occurrence: FileOccurrence::default(),
            file_control_information: FileControlInformation::default(),
            power_on_data_regex: None,
            card_protocol: None,
            successful_status_words: vec![DEFAULT_SUCCESSFUL_STATUS_WORD],
        }
    }

    /// Target the application identified by the given AID.
    pub fn filter_by_aid(mut self, aid: impl Into<Bytes>) -> Self {
        self.aid = Some(aid.into());
        self
    }

    /// Only accept cards whose entire power-on data matches the given
    /// regular expression.
    pub fn filter_by_power_on_data(mut self, pattern: &str) -> Result<Self> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored)
            .map_err(|e| Error::illegal_argument(format!("invalid power-on data regex: {e}")))?;
        self.power_on_data_regex = Some(regex);
        Ok(self)
    }

    /// Only accept cards detected with the given application protocol.
    pub fn filter_by_card_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.card_protocol = Some(protocol.into());
        self
    }

    /// Select a specific occurrence of the application.
    pub fn with_file_occurrence(mut self, occurrence: FileOccurrence) -> Self {
        self.file_occurrence = occurrence;
        self
    }

    /// Ask the card for a specific response template.
    pub fn with_file_control_information(mut self, fci: FileControlInformation) -> Self {
        self.file_control_information = fci;
        self
    }

    /// Add a status word accepted as a successful selection (e.g. `6283` for
    /// an invalidated application).
    pub fn add_successful_status_word(mut self, status_word: u16) -> Self {
        self.successful_status_words.push(status_word);
        self
    }

    /// The target AID, if any.
    pub fn aid(&self) -> Option<&[u8]> {
        self.aid.as_deref()
    }

    /// The requested application occurrence.
    pub fn file_occurrence(&self) -> FileOccurrence {
        self.file_occurrence
    }

    /// The requested response template.
    pub fn file_control_information(&self) -> FileControlInformation {
        self.file_control_information
    }

    /// The application protocol filter, if any.
    pub fn card_protocol(&self) -> Option<&str> {
        self.card_protocol.as_deref()
    }

    /// The status words accepted as a successful selection.
    pub fn successful_status_words(&self) -> &[u16] {
        &self.successful_status_words
    }

    /// Whether the given power-on data passes the filter. Empty power-on data
    /// is never rejected, drivers unable to report it would otherwise match
    /// nothing.
    pub(crate) fn accepts_power_on_data(&self, power_on_data: &str) -> bool {
        match &self.power_on_data_regex {
            Some(regex) => power_on_data.is_empty() || regex.is_match(power_on_data),
            None => true,
        }
    }

    /// P2 byte of the SELECT APPLICATION command for this selector.
    pub(crate) fn select_application_p2(&self) -> u8 {
        self.file_occurrence.p2_bits() | self.file_control_information.p2_bits()
    }
}

/// A selection filter plus the optional APDU chain executed once it matches.
#[derive(Debug, Clone)]
pub struct CardSelectionRequest {
    card_selector: CardSelector,
    card_request: Option<CardRequest>,
}

impl CardSelectionRequest {
    /// Create a selection request with no follow-up APDUs.
    pub fn new(card_selector: CardSelector) -> Self {
        Self {
            card_selector,
            card_request: None,
        }
    }

    /// Attach the APDU chain executed after a successful selection.
    pub fn with_card_request(mut self, card_request: CardRequest) -> Self {
        self.card_request = Some(card_request);
        self
    }

    /// The selection filter.
    pub fn card_selector(&self) -> &CardSelector {
        &self.card_selector
    }

    /// The follow-up APDU chain, if any.
    pub fn card_request(&self) -> Option<&CardRequest> {
        self.card_request.as_ref()
    }
}

/// Outcome of one [`CardSelectionRequest`] applied to a card.
#[derive(Debug, Clone)]
pub struct CardSelectionResponse {
    power_on_data: String,
    select_application_response: Option<ApduResponse>,
    has_matched: bool,
    card_response: Option<CardResponse>,
}

impl CardSelectionResponse {
    pub(crate) fn new(
        power_on_data: String,
        select_application_response: Option<ApduResponse>,
        has_matched: bool,
        card_response: Option<CardResponse>,
    ) -> Self {
        Self {
            power_on_data,
            select_application_response,
            has_matched,
            card_response,
        }
    }

    /// Power-on data of the card, empty when the protocol filter rejected it.
    pub fn power_on_data(&self) -> &str {
        &self.power_on_data
    }

    /// Response to the SELECT APPLICATION command, when an AID selection ran.
    pub fn select_application_response(&self) -> Option<&ApduResponse> {
        self.select_application_response.as_ref()
    }

    /// Whether the card matched the selector.
    pub fn has_matched(&self) -> bool {
        self.has_matched
    }

    /// Responses to the follow-up card request, when one was executed.
    pub fn card_response(&self) -> Option<&CardResponse> {
        self.card_response.as_ref()
    }
}

/// How a multi-request scenario walks its request list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiSelectionProcessing {
    /// Stop at the first request that leaves the logical channel open.
    #[default]
    FirstMatch,
    /// Run every request, closing the logical channel between them.
    ProcessAll,
}

/// What happens to the physical channel once a scenario (or an APDU chain)
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelControl {
    /// Leave the physical channel open for further exchanges.
    #[default]
    KeepOpen,
    /// Release the physical channel.
    CloseAfter,
}

/// An ordered set of selection requests with its processing policy.
#[derive(Debug, Clone)]
pub struct CardSelectionScenario {
    card_selection_requests: Vec<CardSelectionRequest>,
    multi_selection_processing: MultiSelectionProcessing,
    channel_control: ChannelControl,
}

impl CardSelectionScenario {
    /// Create a scenario.
    pub fn new(
        card_selection_requests: Vec<CardSelectionRequest>,
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Self {
        Self {
            card_selection_requests,
            multi_selection_processing,
            channel_control,
        }
    }

    /// The selection requests, in application order.
    pub fn card_selection_requests(&self) -> &[CardSelectionRequest] {
        &self.card_selection_requests
    }

    /// The multi-selection policy.
    pub fn multi_selection_processing(&self) -> MultiSelectionProcessing {
        self.multi_selection_processing
    }

    /// The physical channel policy.
    pub fn channel_control(&self) -> ChannelControl {
        self.channel_control
    }
}
