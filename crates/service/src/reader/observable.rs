//! Observable reader adapter
//!
//! Extends the local reader with the card detection state machine, the
//! scheduled selection scenario and the observer surface. Autonomous drivers
//! are wired back into the state machine through the insertion/removal
//! callback APIs at construction time.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, trace};

use termcard_plugin_spi::{
    CardInsertionApi, CardRemovalApi, ObservableReaderSpi, ReaderSpi, TransmitError,
};

#[cfg(test)]
use super::state::MonitoringState;
use super::state::{InternalEvent, MonitoringStateMachine};
use super::{LocalReader, ReaderInner};
use crate::error::{Error, ObservationError, Result};
use crate::event::{ReaderEvent, ReaderEventType};
use crate::observation::{
    CardReaderObserver, EventNotificationExecutor, ObservationManager,
    ReaderObservationExceptionHandler,
};
use crate::selection::apdu::APDU_GET_RESPONSE;
use crate::selection::{CardSelectionResponse, CardSelectionScenario};

/// When observers are notified about a detected card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationMode {
    /// Notify on every card, whether or not the selection scenario matched.
    #[default]
    Always,
    /// Notify only when the selection scenario matched.
    MatchedOnly,
}

/// What the reader does once the current card has been processed and removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    /// Go back to waiting for the next card.
    Repeating,
    /// Return to the idle state; detection must be restarted explicitly.
    #[default]
    SingleShot,
}

/// Detection capabilities advertised by the driver, snapshotted once at
/// reader construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReaderCapabilities {
    pub(crate) blocking_insertion: bool,
    pub(crate) autonomous_insertion: bool,
    pub(crate) blocking_removal: bool,
    pub(crate) autonomous_removal: bool,
    pub(crate) skip_processing_ping: bool,
}

impl ReaderCapabilities {
    fn detect(spi: &dyn ObservableReaderSpi) -> Self {
        Self {
            blocking_insertion: spi.insertion_blocking().is_some(),
            autonomous_insertion: spi.insertion_autonomous().is_some(),
            blocking_removal: spi.removal_blocking().is_some(),
            autonomous_removal: spi.removal_autonomous().is_some(),
            skip_processing_ping: spi.skip_removal_monitoring_during_processing(),
        }
    }
}

#[derive(Default)]
struct ScheduledScenario {
    scenario: Option<CardSelectionScenario>,
    notification_mode: NotificationMode,
    detection_mode: DetectionMode,
}

/// A reader supporting card detection and observation.
#[derive(Clone)]
pub struct ObservableReader {
    local: LocalReader,
    inner: Arc<ObservableReaderInner>,
}

impl ObservableReader {
    pub(crate) fn new(spi: Arc<dyn ObservableReaderSpi>, plugin_name: &str) -> Self {
        let capabilities = ReaderCapabilities::detect(spi.as_ref());
        let base_spi: Arc<dyn ReaderSpi> = spi.clone();
        let reader = Arc::new(ReaderInner::new(base_spi, Some(spi.clone()), plugin_name));

        let inner = Arc::new_cyclic(|self_ref: &Weak<ObservableReaderInner>| {
            ObservableReaderInner {
                reader: reader.clone(),
                spi: spi.clone(),
                capabilities,
                machine: MonitoringStateMachine::new(),
                observation: ObservationManager::new(),
                scheduled: Mutex::new(ScheduledScenario::default()),
                self_ref: self_ref.clone(),
            }
        });

        if let Some(autonomous) = spi.insertion_autonomous() {
            autonomous.connect_insertion_api(inner.clone());
        }
        if let Some(autonomous) = spi.removal_autonomous() {
            autonomous.connect_removal_api(inner.clone());
        }

        Self {
            local: LocalReader { inner: reader },
            inner,
        }
    }

    /// The plain reader surface (APDU transmission, protocols, channels).
    pub fn local(&self) -> &LocalReader {
        &self.local
    }

    /// Name of the reader.
    pub fn name(&self) -> &str {
        self.local.name()
    }

    /// Name of the plugin owning the reader.
    pub fn plugin_name(&self) -> &str {
        self.local.plugin_name()
    }

    /// Whether a card is present.
    ///
    /// When the card is gone while a channel is still open, the removal
    /// sequence is synthesized: channels are closed silently and observers
    /// receive a CARD_REMOVED event.
    pub fn is_card_present(&self) -> Result<bool> {
        self.inner.reader.check_registered()?;
        if self.inner.reader.is_card_present()? {
            Ok(true)
        } else {
            if self.inner.reader.is_logical_channel_open()
                || self.inner.spi.is_physical_channel_open()
            {
                self.inner.process_card_removed();
            }
            Ok(false)
        }
    }

    /// Arm a selection scenario to run as soon as a card is detected.
    pub fn schedule_card_selection_scenario(
        &self,
        scenario: CardSelectionScenario,
        notification_mode: NotificationMode,
        detection_mode: DetectionMode,
    ) {
        let mut scheduled = self.inner.scheduled.lock().unwrap();
        scheduled.scenario = Some(scenario);
        scheduled.notification_mode = notification_mode;
        scheduled.detection_mode = detection_mode;
    }

    /// Start the card detection sequence.
    pub fn start_card_detection(&self, detection_mode: DetectionMode) -> Result<()> {
        self.inner.reader.check_registered()?;
        debug!(
            reader = %self.name(),
            plugin = %self.plugin_name(),
            mode = ?detection_mode,
            "starting card detection"
        );
        self.inner.scheduled.lock().unwrap().detection_mode = detection_mode;
        self.inner.on_internal_event(InternalEvent::StartDetect);
        Ok(())
    }

    /// Stop the card detection sequence.
    pub fn stop_card_detection(&self) {
        debug!(
            reader = %self.name(),
            plugin = %self.plugin_name(),
            "stopping card detection"
        );
        self.inner.on_internal_event(InternalEvent::StopDetect);
    }

    /// Signal that the application has finished processing the card, starting
    /// the removal sequence.
    pub fn finalize_card_processing(&self) {
        debug!(
            reader = %self.name(),
            plugin = %self.plugin_name(),
            "finalizing card processing"
        );
        self.inner.on_internal_event(InternalEvent::CardProcessed);
    }

    /// Add a reader observer. Fails when the reader is unregistered or when
    /// no observation exception handler has been configured yet.
    pub fn add_observer(&self, observer: Arc<dyn CardReaderObserver>) -> Result<()> {
        self.inner.reader.check_registered()?;
        self.inner.observation.add_observer(observer)
    }

    /// Remove a reader observer.
    pub fn remove_observer(&self, observer: &Arc<dyn CardReaderObserver>) {
        self.inner.observation.remove_observer(observer);
    }

    /// Remove every reader observer.
    pub fn clear_observers(&self) {
        self.inner.observation.clear_observers();
    }

    /// Number of registered reader observers.
    pub fn count_observers(&self) -> usize {
        self.inner.observation.count_observers()
    }

    /// Configure the sink for observation errors. Must be done before the
    /// first observer is added.
    pub fn set_observation_exception_handler(
        &self,
        handler: Arc<dyn ReaderObservationExceptionHandler>,
    ) -> Result<()> {
        self.inner.reader.check_registered()?;
        self.inner.observation.set_exception_handler(handler);
        Ok(())
    }

    /// Configure an executor for asynchronous observer notification; `None`
    /// restores inline dispatch.
    pub fn set_event_notification_executor(
        &self,
        executor: Option<Arc<dyn EventNotificationExecutor>>,
    ) -> Result<()> {
        self.inner.reader.check_registered()?;
        self.inner.observation.set_executor(executor);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn current_monitoring_state(&self) -> MonitoringState {
        self.inner.machine.current_state()
    }

    pub(crate) fn unregister(&self) {
        self.inner.unregister();
    }
}

impl fmt::Debug for ObservableReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableReader")
            .field("name", &self.name())
            .field("plugin", &self.plugin_name())
            .field("state", &self.inner.machine.current_state())
            .finish()
    }
}

pub(crate) struct ObservableReaderInner {
    reader: Arc<ReaderInner>,
    spi: Arc<dyn ObservableReaderSpi>,
    capabilities: ReaderCapabilities,
    machine: MonitoringStateMachine,
    observation: ObservationManager<dyn CardReaderObserver, dyn ReaderObservationExceptionHandler>,
    scheduled: Mutex<ScheduledScenario>,
    self_ref: Weak<ObservableReaderInner>,
}

impl ObservableReaderInner {
    pub(crate) fn name(&self) -> &str {
        self.reader.name()
    }

    pub(crate) fn plugin_name(&self) -> &str {
        self.reader.plugin_name()
    }

    pub(crate) fn reader(&self) -> &ReaderInner {
        &self.reader
    }

    pub(crate) fn observable_spi(&self) -> &Arc<dyn ObservableReaderSpi> {
        &self.spi
    }

    pub(crate) fn capabilities(&self) -> ReaderCapabilities {
        self.capabilities
    }

    pub(crate) fn detection_mode(&self) -> DetectionMode {
        self.scheduled.lock().unwrap().detection_mode
    }

    pub(crate) fn on_internal_event(&self, event: InternalEvent) {
        if let Some(this) = self.self_ref.upgrade() {
            self.machine.on_event(&this, event);
        }
    }

    /// Check that the card still answers a neutral APDU.
    ///
    /// A card failure means the card is gone; a reader failure is reported to
    /// the exception handler while monitoring carries on.
    pub(crate) fn is_card_present_ping(&self) -> bool {
        trace!(reader = %self.name(), "pinging the card");
        match self.reader.spi().transmit_apdu(&APDU_GET_RESPONSE) {
            Ok(_) => true,
            Err(TransmitError::Reader(source)) => {
                self.notify_observation_error(Box::new(Error::ReaderCommunication {
                    message: "an error occurred while monitoring the reader".to_string(),
                    source,
                }));
                true
            }
            Err(TransmitError::Card(e)) => {
                trace!(reader = %self.name(), error = %e, "card no longer responding to ping");
                false
            }
        }
    }

    /// Classify an insertion: run the scheduled scenario when one is armed
    /// and build the event to notify, or none when the card is to be ignored.
    pub(crate) fn process_card_inserted(&self) -> Option<ReaderEvent> {
        trace!(reader = %self.name(), "processing the inserted card");

        let (scenario, notification_mode) = {
            let scheduled = self.scheduled.lock().unwrap();
            (scheduled.scenario.clone(), scheduled.notification_mode)
        };

        let Some(scenario) = scenario else {
            trace!(
                reader = %self.name(),
                "no card selection scenario defined, notifying CARD_INSERTED"
            );
            return Some(ReaderEvent::new(
                self.plugin_name(),
                self.name(),
                ReaderEventType::CardInserted,
                None,
            ));
        };

        match self.reader.transmit_card_selection_requests(
            scenario.card_selection_requests(),
            scenario.multi_selection_processing(),
            scenario.channel_control(),
        ) {
            Ok(responses) => {
                if responses.iter().any(CardSelectionResponse::has_matched) {
                    trace!(reader = %self.name(), "a scheduled selection matched");
                    return Some(ReaderEvent::new(
                        self.plugin_name(),
                        self.name(),
                        ReaderEventType::CardMatched,
                        Some(responses),
                    ));
                }
                match notification_mode {
                    NotificationMode::Always => {
                        trace!(
                            reader = %self.name(),
                            "no scheduled selection matched, notifying CARD_INSERTED"
                        );
                        return Some(ReaderEvent::new(
                            self.plugin_name(),
                            self.name(),
                            ReaderEventType::CardInserted,
                            Some(responses),
                        ));
                    }
                    NotificationMode::MatchedOnly => {
                        trace!(
                            reader = %self.name(),
                            "no scheduled selection matched, no event in MATCHED_ONLY mode"
                        );
                    }
                }
            }
            Err(e @ Error::ReaderBrokenCommunication { .. }) => {
                self.notify_observation_error(Box::new(e));
            }
            Err(Error::CardBrokenCommunication { .. }) => {
                // The card was removed or misread; no event, just log.
                self.reader.close_logical_and_physical_channels_silently();
                debug!(
                    reader = %self.name(),
                    "card communication failure while processing the selection scenario"
                );
            }
            Err(e) => {
                self.notify_observation_error(Box::new(e));
            }
        }

        // The physical channel may have been opened for a card the scenario
        // excluded.
        if let Err(source) = self.spi.close_physical_channel() {
            self.notify_observation_error(Box::new(Error::ReaderCommunication {
                message: "failed to close the physical channel".to_string(),
                source,
            }));
        }
        None
    }

    /// Close both channels silently and notify observers of the removal.
    pub(crate) fn process_card_removed(&self) {
        self.reader.close_logical_and_physical_channels_silently();
        self.notify_observers(ReaderEvent::new(
            self.plugin_name(),
            self.name(),
            ReaderEventType::CardRemoved,
            None,
        ));
    }

    /// Notify all observers from a snapshot of the observer set. Never fails:
    /// observer errors are routed to the exception handler.
    pub(crate) fn notify_observers(&self, event: ReaderEvent) {
        let snapshot = self.observation.snapshot();
        debug!(
            reader = %self.name(),
            event = ?event.event_type(),
            observers = snapshot.observers.len(),
            "notifying reader event"
        );

        match &snapshot.executor {
            None => {
                for observer in &snapshot.observers {
                    notify_reader_observer(
                        observer,
                        snapshot.exception_handler.as_ref(),
                        self.plugin_name(),
                        self.name(),
                        &event,
                    );
                }
            }
            Some(executor) => {
                for observer in snapshot.observers {
                    let handler = snapshot.exception_handler.clone();
                    let plugin_name = self.plugin_name().to_string();
                    let reader_name = self.name().to_string();
                    let event = event.clone();
                    executor.execute(Box::new(move || {
                        notify_reader_observer(
                            &observer,
                            handler.as_ref(),
                            &plugin_name,
                            &reader_name,
                            &event,
                        );
                    }));
                }
            }
        }
    }

    /// Route a monitoring or notification error to the exception handler.
    pub(crate) fn notify_observation_error(&self, error: ObservationError) {
        match self.observation.exception_handler() {
            Some(handler) => {
                if let Err(e) =
                    handler.on_reader_observation_error(self.plugin_name(), self.name(), error)
                {
                    error!(
                        reader = %self.name(),
                        error = %e,
                        "observation exception handler failed"
                    );
                }
            }
            None => {
                error!(
                    reader = %self.name(),
                    error = %error,
                    "observation error and no exception handler is set"
                );
            }
        }
    }

    /// Unregister drill: notify UNAVAILABLE, stop detection, clear observers
    /// and shut the state machine down.
    fn unregister(&self) {
        self.reader.unregister();
        self.notify_observers(ReaderEvent::new(
            self.plugin_name(),
            self.name(),
            ReaderEventType::Unavailable,
            None,
        ));
        self.on_internal_event(InternalEvent::StopDetect);
        self.observation.clear_observers();
        if let Some(this) = self.self_ref.upgrade() {
            self.machine.shutdown(&this);
        }
    }
}

impl CardInsertionApi for ObservableReaderInner {
    fn on_card_inserted(&self) {
        self.on_internal_event(InternalEvent::CardInserted);
    }
}

impl CardRemovalApi for ObservableReaderInner {
    fn on_card_removed(&self) {
        self.on_internal_event(InternalEvent::CardRemoved);
    }
}

fn notify_reader_observer(
    observer: &Arc<dyn CardReaderObserver>,
    handler: Option<&Arc<dyn ReaderObservationExceptionHandler>>,
    plugin_name: &str,
    reader_name: &str,
    event: &ReaderEvent,
) {
    if let Err(e) = observer.on_reader_event(event) {
        match handler {
            Some(handler) => {
                if let Err(e2) = handler.on_reader_observation_error(plugin_name, reader_name, e) {
                    error!(
                        reader = %reader_name,
                        error = %e2,
                        "observation exception handler failed during notification"
                    );
                }
            }
            None => {
                error!(
                    reader = %reader_name,
                    error = %e,
                    "observer failed and no exception handler is set"
                );
            }
        }
    }
}
