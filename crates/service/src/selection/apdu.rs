//! APDU request/response units and card request/response aggregates
//!
//! Wire format is the ISO 7816-4 short APDU: a response is the data-out bytes
//! followed by the two status-word bytes.

use bytes::Bytes;

/// Default successful status word (SW = 9000).
pub const DEFAULT_SUCCESSFUL_STATUS_WORD: u16 = 0x9000;

/// GET RESPONSE command issued for the case-4 quirk and used as the neutral
/// presence-ping APDU.
pub(crate) const APDU_GET_RESPONSE: [u8; 5] = [0x00, 0xC0, 0x00, 0x00, 0x00];

/// Whether a command APDU is ISO 7816-4 case 4 (carries command data and
/// expects response data).
///
/// A short case-4 APDU is `CLA INS P1 P2 Lc <data> Le`, so the Lc byte equals
/// the total length minus the 4 header bytes, the Lc byte itself and the Le
/// byte.
pub fn is_case4(apdu: &[u8]) -> bool {
    apdu.len() > 6 && apdu[4] as usize == apdu.len() - 6
}

/// A single APDU command with its notification metadata.
#[derive(Debug, Clone)]
pub struct ApduRequest {
    apdu: Bytes,
    info: Option<String>,
    successful_status_words: Vec<u16>,
}

impl ApduRequest {
    /// Create a request from raw command bytes. The successful status-word
    /// set defaults to `{9000}`.
    pub fn new(apdu: impl Into<Bytes>) -> Self {
        Self {
            apdu: apdu.into(),
            info: None,
            successful_status_words: vec![DEFAULT_SUCCESSFUL_STATUS_WORD],
        }
    }

    /// Attach a human-readable label used in logs.
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    /// Add a status word to the successful set.
    pub fn add_successful_status_word(mut self, status_word: u16) -> Self {
        self.successful_status_words.push(status_word);
        self
    }

    /// Raw command bytes.
    pub fn apdu(&self) -> &[u8] {
        &self.apdu
    }

    /// Human-readable label, if any.
    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    /// Status words considered successful for this command.
    pub fn successful_status_words(&self) -> &[u16] {
        &self.successful_status_words
    }
}

/// A response APDU: data-out followed by the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    apdu: Bytes,
}

impl ApduResponse {
    /// Wrap raw response bytes. The response is expected to carry at least
    /// the two status-word bytes; shorter inputs are rejected by the
    /// transmission engine before this constructor runs.
    pub fn new(apdu: impl Into<Bytes>) -> Self {
        Self { apdu: apdu.into() }
    }

    /// Raw response bytes, status word included.
    pub fn apdu(&self) -> &[u8] {
        &self.apdu
    }

    /// Response data, without the status word.
    pub fn data_out(&self) -> &[u8] {
        match self.apdu.len() {
            0 | 1 => &[],
            n => &self.apdu[..n - 2],
        }
    }

    /// The status word, read from the last two bytes.
    pub fn status_word(&self) -> u16 {
        match self.apdu.len() {
            0 | 1 => 0,
            n => u16::from_be_bytes([self.apdu[n - 2], self.apdu[n - 1]]),
        }
    }
}

/// An ordered list of APDU requests executed as one exchange.
#[derive(Debug, Clone)]
pub struct CardRequest {
    apdu_requests: Vec<ApduRequest>,
    stop_on_unsuccessful_status_word: bool,
}

impl CardRequest {
    /// Create a card request that runs every APDU regardless of status words.
    pub fn new(apdu_requests: Vec<ApduRequest>) -> Self {
        Self {
            apdu_requests,
            stop_on_unsuccessful_status_word: false,
        }
    }

    /// Abort the chain with an error as soon as an APDU returns a status word
    /// outside its successful set.
    pub fn stop_on_unsuccessful_status_word(mut self) -> Self {
        self.stop_on_unsuccessful_status_word = true;
        self
    }

    /// The APDU requests of the chain, in execution order.
    pub fn apdu_requests(&self) -> &[ApduRequest] {
        &self.apdu_requests
    }

    /// Whether the chain stops on an unexpected status word.
    pub fn stops_on_unsuccessful_status_word(&self) -> bool {
        self.stop_on_unsuccessful_status_word
    }
}

/// The responses collected while executing a [`CardRequest`].
#[derive(Debug, Clone, Default)]
pub struct CardResponse {
    apdu_responses: Vec<ApduResponse>,
    logical_channel_open: bool,
}

impl CardResponse {
    pub(crate) fn new(apdu_responses: Vec<ApduResponse>, logical_channel_open: bool) -> Self {
        Self {
            apdu_responses,
            logical_channel_open,
        }
    }

    /// The responses, in the order the requests were executed. May be shorter
    /// than the request list when the chain was cut short.
    pub fn apdu_responses(&self) -> &[ApduResponse] {
        &self.apdu_responses
    }

    /// Whether the logical channel was open when the exchange ended.
    pub fn is_logical_channel_open(&self) -> bool {
        self.logical_channel_open
    }
}
