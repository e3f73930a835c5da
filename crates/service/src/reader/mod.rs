//! Reader adapters
//!
//! [`LocalReader`] owns a driver handle and the channel state, and runs the
//! APDU selection and transmission engine. [`ObservableReader`] layers the
//! card detection state machine and the observer surface on top of it. The
//! [`Reader`] enum is what plugins hand out to applications.

mod monitoring;
mod observable;
mod state;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, error, info, trace};

use termcard_plugin_spi::{
    CardIoError, ObservableReaderSpi, ReaderSpi, ReaderSpiRef, TransmitError,
};

use crate::error::{Error, Result};
use crate::selection::apdu::APDU_GET_RESPONSE;
use crate::selection::{
    ApduRequest, ApduResponse, CardRequest, CardResponse, CardSelectionRequest,
    CardSelectionResponse, CardSelector, ChannelControl, DEFAULT_SUCCESSFUL_STATUS_WORD,
    MultiSelectionProcessing, is_case4,
};

pub use observable::{DetectionMode, NotificationMode, ObservableReader};

/// A reader handed out by a plugin.
#[derive(Clone)]
pub enum Reader {
    /// A reader without card detection support.
    Simple(LocalReader),
    /// A reader supporting card detection.
    Observable(ObservableReader),
}

impl Reader {
    /// Name of the reader, unique within its plugin.
    pub fn name(&self) -> &str {
        self.base().name()
    }

    /// Name of the plugin owning the reader.
    pub fn plugin_name(&self) -> &str {
        self.base().plugin_name()
    }

    /// Whether the reader communicates with cards over a contactless
    /// interface.
    pub fn is_contactless(&self) -> bool {
        self.base().is_contactless()
    }

    /// Whether a card is present in the reader.
    pub fn is_card_present(&self) -> Result<bool> {
        match self {
            Self::Simple(reader) => reader.is_card_present(),
            Self::Observable(reader) => reader.is_card_present(),
        }
    }

    /// Run an APDU chain against the current card. See
    /// [`LocalReader::transmit_card_request`].
    pub fn transmit_card_request(
        &self,
        card_request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse> {
        self.base().transmit_card_request(card_request, channel_control)
    }

    /// Apply a list of selection requests to the current card. See
    /// [`LocalReader::transmit_card_selection_requests`].
    pub fn transmit_card_selection_requests(
        &self,
        requests: &[CardSelectionRequest],
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>> {
        self.base().transmit_card_selection_requests(
            requests,
            multi_selection_processing,
            channel_control,
        )
    }

    /// Associate a reader protocol with an application protocol name.
    pub fn activate_protocol(
        &self,
        reader_protocol: &str,
        application_protocol: &str,
    ) -> Result<()> {
        self.base().activate_protocol(reader_protocol, application_protocol)
    }

    /// Remove a reader protocol association.
    pub fn deactivate_protocol(&self, reader_protocol: &str) -> Result<()> {
        self.base().deactivate_protocol(reader_protocol)
    }

    /// Release the physical channel.
    pub fn release_channel(&self) -> Result<()> {
        self.base().release_channel()
    }

    /// The observable view of the reader, when it supports card detection.
    pub fn as_observable(&self) -> Option<&ObservableReader> {
        match self {
            Self::Simple(_) => None,
            Self::Observable(reader) => Some(reader),
        }
    }

    fn base(&self) -> &LocalReader {
        match self {
            Self::Simple(reader) => reader,
            Self::Observable(reader) => reader.local(),
        }
    }

    pub(crate) fn register(&self) {
        self.base().inner.register();
    }

    pub(crate) fn unregister(&self) {
        match self {
            Self::Simple(reader) => reader.inner.unregister(),
            Self::Observable(reader) => reader.unregister(),
        }
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Simple(_) => "Simple",
            Self::Observable(_) => "Observable",
        };
        f.debug_struct("Reader")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}

/// Build the adapter variant matching the detection ability the driver
/// declared for the reader.
pub(crate) fn build_reader(spi_ref: ReaderSpiRef, plugin_name: &str) -> Reader {
    match spi_ref {
        ReaderSpiRef::Simple(spi) => Reader::Simple(LocalReader::new(spi, plugin_name)),
        ReaderSpiRef::Observable(spi) => {
            Reader::Observable(ObservableReader::new(spi, plugin_name))
        }
    }
}

/// A reader bound to one driver handle, running the APDU engine.
#[derive(Clone)]
pub struct LocalReader {
    pub(crate) inner: Arc<ReaderInner>,
}

impl LocalReader {
    pub(crate) fn new(spi: Arc<dyn ReaderSpi>, plugin_name: &str) -> Self {
        Self {
            inner: Arc::new(ReaderInner::new(spi, None, plugin_name)),
        }
    }

    /// Name of the reader.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the plugin owning the reader.
    pub fn plugin_name(&self) -> &str {
        &self.inner.plugin_name
    }

    /// Whether the reader communicates with cards over a contactless
    /// interface.
    pub fn is_contactless(&self) -> bool {
        self.inner.spi.is_contactless()
    }

    /// Whether a card is present in the reader.
    pub fn is_card_present(&self) -> Result<bool> {
        self.inner.is_card_present()
    }

    /// Run an APDU chain against the current card, honoring the per-APDU
    /// successful status-word sets and the case-4 GET RESPONSE quirk.
    pub fn transmit_card_request(
        &self,
        card_request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse> {
        self.inner.transmit_card_request(card_request, channel_control)
    }

    /// Apply a list of selection requests to the current card, opening the
    /// physical channel first when needed.
    pub fn transmit_card_selection_requests(
        &self,
        requests: &[CardSelectionRequest],
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>> {
        self.inner.transmit_card_selection_requests(
            requests,
            multi_selection_processing,
            channel_control,
        )
    }

    /// Associate a reader protocol with an application protocol name and
    /// activate it on the driver.
    pub fn activate_protocol(
        &self,
        reader_protocol: &str,
        application_protocol: &str,
    ) -> Result<()> {
        self.inner.activate_protocol(reader_protocol, application_protocol)
    }

    /// Remove a reader protocol association and deactivate it on the driver.
    pub fn deactivate_protocol(&self, reader_protocol: &str) -> Result<()> {
        self.inner.deactivate_protocol(reader_protocol)
    }

    /// Release the physical channel.
    pub fn release_channel(&self) -> Result<()> {
        self.inner.release_channel()
    }
}

impl fmt::Debug for LocalReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalReader")
            .field("name", &self.name())
            .field("plugin", &self.plugin_name())
            .finish()
    }
}

/// Channel and protocol state of a reader, guarded by one mutex held for the
/// duration of an APDU chain so that two chains on the same reader serialize.
#[derive(Default)]
struct ChannelState {
    logical_channel_open: bool,
    protocol_associations: HashMap<String, String>,
    use_default_protocol: bool,
    current_protocol: Option<String>,
}

/// Intermediate result of applying one card selector.
struct SelectionStatus {
    power_on_data: String,
    select_application_response: Option<ApduResponse>,
    has_matched: bool,
}

enum SelectionError {
    State(String),
    Transmit(TransmitError),
}

pub(crate) struct ReaderInner {
    name: String,
    plugin_name: String,
    registered: AtomicBool,
    spi: Arc<dyn ReaderSpi>,
    /// Present when the reader was built from an observable SPI; gives access
    /// to the autonomous-selection capability.
    observable_spi: Option<Arc<dyn ObservableReaderSpi>>,
    channel: Mutex<ChannelState>,
}

impl ReaderInner {
    pub(crate) fn new(
        spi: Arc<dyn ReaderSpi>,
        observable_spi: Option<Arc<dyn ObservableReaderSpi>>,
        plugin_name: &str,
    ) -> Self {
        Self {
            name: spi.name().to_string(),
            plugin_name: plugin_name.to_string(),
            registered: AtomicBool::new(false),
            spi,
            observable_spi,
            channel: Mutex::new(ChannelState::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub(crate) fn spi(&self) -> &Arc<dyn ReaderSpi> {
        &self.spi
    }

    pub(crate) fn register(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unregister(&self) {
        self.registered.store(false, Ordering::SeqCst);
        self.spi.on_unregister();
    }

    pub(crate) fn check_registered(&self) -> Result<()> {
        if self.registered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::illegal_state(format!(
                "the reader '{}' is not or no longer registered",
                self.name
            )))
        }
    }

    pub(crate) fn is_card_present(&self) -> Result<bool> {
        self.check_registered()?;
        self.spi
            .check_card_presence()
            .map_err(|source| Error::ReaderCommunication {
                message: "an error occurred while checking the card presence".to_string(),
                source,
            })
    }

    pub(crate) fn is_logical_channel_open(&self) -> bool {
        self.channel.lock().unwrap().logical_channel_open
    }

    pub(crate) fn activate_protocol(
        &self,
        reader_protocol: &str,
        application_protocol: &str,
    ) -> Result<()> {
        self.check_registered()?;
        check_not_empty(reader_protocol, "readerProtocol")?;
        check_not_empty(application_protocol, "applicationProtocol")?;

        if !self.spi.is_protocol_supported(reader_protocol) {
            return Err(Error::ProtocolNotSupported(reader_protocol.to_string()));
        }
        self.spi.activate_protocol(reader_protocol);
        self.channel
            .lock()
            .unwrap()
            .protocol_associations
            .insert(reader_protocol.to_string(), application_protocol.to_string());
        Ok(())
    }

    pub(crate) fn deactivate_protocol(&self, reader_protocol: &str) -> Result<()> {
        self.check_registered()?;
        check_not_empty(reader_protocol, "readerProtocol")?;

        self.channel
            .lock()
            .unwrap()
            .protocol_associations
            .remove(reader_protocol);
        if !self.spi.is_protocol_supported(reader_protocol) {
            return Err(Error::ProtocolNotSupported(reader_protocol.to_string()));
        }
        self.spi.deactivate_protocol(reader_protocol);
        Ok(())
    }

    pub(crate) fn release_channel(&self) -> Result<()> {
        self.check_registered()?;
        self.spi
            .close_physical_channel()
            .map_err(|source| Error::ReaderBrokenCommunication {
                response: CardResponse::default(),
                fully_processed: false,
                message: "failed to release the physical channel".to_string(),
                source,
            })
    }

    pub(crate) fn transmit_card_request(
        &self,
        card_request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse> {
        self.check_registered()?;
        let mut channel = self.channel.lock().unwrap();
        let card_response = self.process_card_request(&mut channel, card_request)?;
        if channel_control == ChannelControl::CloseAfter {
            self.release_channel()?;
        }
        Ok(card_response)
    }

    pub(crate) fn transmit_card_selection_requests(
        &self,
        requests: &[CardSelectionRequest],
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>> {
        self.check_registered()?;
        let mut channel = self.channel.lock().unwrap();

        if !self.spi.is_physical_channel_open() {
            self.open_physical_channel_and_set_protocol(&mut channel)
                .map_err(|e| {
                    broken_communication(
                        e,
                        CardResponse::default(),
                        "communication failure while opening the physical channel",
                    )
                })?;
        }

        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let response = self.process_card_selection_request(&mut channel, request)?;
            responses.push(response);

            match multi_selection_processing {
                MultiSelectionProcessing::ProcessAll => {
                    // Close the logical channel and go on with the next
                    // selection.
                    self.close_logical_channel(&mut channel);
                }
                MultiSelectionProcessing::FirstMatch => {
                    if channel.logical_channel_open {
                        break;
                    }
                }
            }
        }

        if channel_control == ChannelControl::CloseAfter {
            self.release_channel()?;
        }
        Ok(responses)
    }

    fn process_card_selection_request(
        &self,
        channel: &mut MutexGuard<'_, ChannelState>,
        request: &CardSelectionRequest,
    ) -> Result<CardSelectionResponse> {
        let status = match self.process_selection(channel, request.card_selector()) {
            Ok(status) => status,
            Err(SelectionError::State(message)) => return Err(Error::IllegalState(message)),
            Err(SelectionError::Transmit(e)) => {
                return Err(broken_communication(
                    e,
                    CardResponse::default(),
                    "communication failure while processing the card selection",
                ));
            }
        };

        if !status.has_matched {
            // The selection failed, return a response carrying the selection
            // status only.
            return Ok(CardSelectionResponse::new(
                status.power_on_data,
                status.select_application_response,
                false,
                None,
            ));
        }

        channel.logical_channel_open = true;

        let card_response = match request.card_request() {
            Some(card_request) => Some(self.process_card_request(channel, card_request)?),
            None => None,
        };

        Ok(CardSelectionResponse::new(
            status.power_on_data,
            status.select_application_response,
            true,
            card_response,
        ))
    }

    /// Apply one card selector to the current card (§selection algorithm):
    /// protocol filter, power-on data filter, then AID selection.
    fn process_selection(
        &self,
        channel: &mut MutexGuard<'_, ChannelState>,
        selector: &CardSelector,
    ) -> core::result::Result<SelectionStatus, SelectionError> {
        if let Some(protocol) = selector.card_protocol() {
            if channel.use_default_protocol {
                return Err(SelectionError::State(format!(
                    "protocol {protocol} not associated to a reader protocol"
                )));
            }
            if channel.current_protocol.as_deref() != Some(protocol) {
                // Protocol mismatch, the card is not eligible.
                return Ok(SelectionStatus {
                    power_on_data: String::new(),
                    select_application_response: None,
                    has_matched: false,
                });
            }
        }

        let power_on_data = self.spi.power_on_data();
        trace!(reader = %self.name, power_on_data = %power_on_data, "open logical channel");

        if !selector.accepts_power_on_data(&power_on_data) {
            info!(
                reader = %self.name,
                power_on_data = %power_on_data,
                "power-on data rejected by the selector filter"
            );
            return Ok(SelectionStatus {
                power_on_data,
                select_application_response: None,
                has_matched: false,
            });
        }

        let Some(aid) = selector.aid() else {
            return Ok(SelectionStatus {
                power_on_data,
                select_application_response: None,
                has_matched: true,
            });
        };

        let fci_response = self
            .select_by_aid(selector, aid)
            .map_err(SelectionError::Transmit)?;
        let has_matched = selector
            .successful_status_words()
            .contains(&fci_response.status_word());

        Ok(SelectionStatus {
            power_on_data,
            select_application_response: Some(fci_response),
            has_matched,
        })
    }

    fn select_by_aid(
        &self,
        selector: &CardSelector,
        aid: &[u8],
    ) -> core::result::Result<ApduResponse, TransmitError> {
        if let Some(observable_spi) = &self.observable_spi {
            if let Some(autonomous) = observable_spi.autonomous_selection() {
                debug!(
                    reader = %self.name,
                    aid = %hex::encode_upper(aid),
                    "delegating application selection to the driver"
                );
                let fci = autonomous.open_channel_for_aid(aid, selector.select_application_p2())?;
                return parse_apdu_response(fci);
            }
        }
        self.process_explicit_aid_selection(selector, aid)
    }

    fn process_explicit_aid_selection(
        &self,
        selector: &CardSelector,
        aid: &[u8],
    ) -> core::result::Result<ApduResponse, TransmitError> {
        debug!(
            reader = %self.name,
            aid = %hex::encode_upper(aid),
            "selecting application"
        );

        let mut command = Vec::with_capacity(6 + aid.len());
        command.push(0x00); // CLA
        command.push(0xA4); // INS: SELECT
        command.push(0x04); // P1: select by name
        command.push(selector.select_application_p2());
        command.push(aid.len() as u8); // Lc
        command.extend_from_slice(aid);
        command.push(0x00); // Le

        let request = ApduRequest::new(command).with_info("Internal Select Application");
        self.process_apdu_request(&request)
    }

    fn process_card_request(
        &self,
        channel: &mut MutexGuard<'_, ChannelState>,
        card_request: &CardRequest,
    ) -> Result<CardResponse> {
        let mut apdu_responses = Vec::with_capacity(card_request.apdu_requests().len());

        for apdu_request in card_request.apdu_requests() {
            match self.process_apdu_request(apdu_request) {
                Ok(apdu_response) => {
                    let status_word = apdu_response.status_word();
                    apdu_responses.push(apdu_response);

                    if card_request.stops_on_unsuccessful_status_word()
                        && !apdu_request.successful_status_words().contains(&status_word)
                    {
                        let fully_processed =
                            apdu_responses.len() == card_request.apdu_requests().len();
                        return Err(Error::UnexpectedStatusWord {
                            response: CardResponse::new(apdu_responses, false),
                            fully_processed,
                        });
                    }
                }
                Err(e) => {
                    // The exchange was cut short: close both channels and
                    // surface the responses collected so far.
                    self.close_channels_silently(channel);
                    return Err(broken_communication(
                        e,
                        CardResponse::new(apdu_responses, false),
                        "communication failure while transmitting a card request",
                    ));
                }
            }
        }

        Ok(CardResponse::new(apdu_responses, channel.logical_channel_open))
    }

    fn process_apdu_request(
        &self,
        apdu_request: &ApduRequest,
    ) -> core::result::Result<ApduResponse, TransmitError> {
        trace!(
            reader = %self.name,
            command = %hex::encode_upper(apdu_request.apdu()),
            info = apdu_request.info().unwrap_or_default(),
            "transmitting APDU"
        );

        let response_bytes = self.spi.transmit_apdu(apdu_request.apdu())?;
        let mut apdu_response = parse_apdu_response(response_bytes)?;

        if is_case4(apdu_request.apdu())
            && apdu_response.data_out().is_empty()
            && apdu_response.status_word() == DEFAULT_SUCCESSFUL_STATUS_WORD
        {
            // The reader did not synthesize the GET RESPONSE itself.
            apdu_response = self.case4_get_response()?;
        }

        trace!(
            reader = %self.name,
            response = %hex::encode_upper(apdu_response.apdu()),
            "received APDU response"
        );
        Ok(apdu_response)
    }

    fn case4_get_response(&self) -> core::result::Result<ApduResponse, TransmitError> {
        debug!(reader = %self.name, "issuing GET RESPONSE after case-4 APDU");
        let response_bytes = self.spi.transmit_apdu(&APDU_GET_RESPONSE)?;
        parse_apdu_response(response_bytes)
    }

    fn open_physical_channel_and_set_protocol(
        &self,
        channel: &mut MutexGuard<'_, ChannelState>,
    ) -> core::result::Result<(), TransmitError> {
        self.spi.open_physical_channel()?;
        self.compute_current_protocol(channel);
        Ok(())
    }

    fn compute_current_protocol(&self, channel: &mut MutexGuard<'_, ChannelState>) {
        if channel.protocol_associations.is_empty() {
            channel.use_default_protocol = true;
            channel.current_protocol = None;
            return;
        }
        channel.use_default_protocol = false;
        let mut current_protocol = None;
        for (reader_protocol, application_protocol) in &channel.protocol_associations {
            if self.spi.is_current_protocol(reader_protocol) {
                current_protocol = Some(application_protocol.clone());
            }
        }
        channel.current_protocol = current_protocol;
    }

    fn close_logical_channel(&self, channel: &mut MutexGuard<'_, ChannelState>) {
        trace!(reader = %self.name, "closing logical channel");
        if let Some(observable_spi) = &self.observable_spi {
            if let Some(autonomous) = observable_spi.autonomous_selection() {
                autonomous.close_logical_channel();
            }
        }
        channel.logical_channel_open = false;
    }

    fn close_channels_silently(&self, channel: &mut MutexGuard<'_, ChannelState>) {
        self.close_logical_channel(channel);
        channel.current_protocol = None;
        channel.use_default_protocol = false;
        if let Err(e) = self.spi.close_physical_channel() {
            error!(reader = %self.name, error = %e, "failed to close the physical channel");
        }
    }

    pub(crate) fn close_logical_and_physical_channels_silently(&self) {
        let mut channel = self.channel.lock().unwrap();
        self.close_channels_silently(&mut channel);
    }
}

fn check_not_empty(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        Err(Error::illegal_argument(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

fn parse_apdu_response(bytes: Bytes) -> core::result::Result<ApduResponse, TransmitError> {
    if bytes.len() < 2 {
        Err(CardIoError::new("truncated APDU response").into())
    } else {
        Ok(ApduResponse::new(bytes))
    }
}

fn broken_communication(e: TransmitError, response: CardResponse, context: &str) -> Error {
    match e {
        TransmitError::Reader(source) => Error::ReaderBrokenCommunication {
            response,
            fully_processed: false,
            message: format!("reader {context}"),
            source,
        },
        TransmitError::Card(source) => Error::CardBrokenCommunication {
            response,
            fully_processed: false,
            message: format!("card {context}"),
            source,
        },
    }
}
