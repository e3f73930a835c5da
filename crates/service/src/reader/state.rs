//! Card detection state machine
//!
//! One machine per observable reader, driven by [`InternalEvent`]s posted by
//! the application API and by the monitoring jobs. Event handling is
//! serialized by a reentrant per-reader lock held for the whole run,
//! including observer notification, so events never interleave partially and
//! an observer can drive the reader (finalize, stop, restart) from inside its
//! callback. The inner lock only guards the current state id and the active
//! job, and is never held across APDU traffic or notification.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use tracing::{trace, warn};

use super::monitoring::{ActiveJob, MonitoringJob};
use super::observable::{DetectionMode, ObservableReaderInner};

/// The states the reader monitoring state machine can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitoringState {
    /// Idle, waiting for a start signal to enter card detection.
    WaitForStartDetection,
    /// Waiting for a card to be presented.
    WaitForCardInsertion,
    /// Waiting for the application to finish processing the card.
    WaitForCardProcessing,
    /// Waiting for the card to be removed.
    WaitForCardRemoval,
}

/// The events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalEvent {
    /// A card has been inserted.
    CardInserted,
    /// The card has been removed.
    CardRemoved,
    /// The application has finished processing the card.
    CardProcessed,
    /// The application requested the start of card detection.
    StartDetect,
    /// The application requested card detection to stop.
    StopDetect,
}

/// Reentrant mutual exclusion for event handling: an observer notified during
/// an event run may post follow-up events from the same thread without
/// deadlocking, while runs from other threads queue.
struct ProcessLock {
    state: Mutex<ProcessLockState>,
    unlocked: Condvar,
}

struct ProcessLockState {
    owner: Option<ThreadId>,
    depth: usize,
}

struct ProcessGuard<'a> {
    lock: &'a ProcessLock,
}

impl ProcessLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProcessLockState {
                owner: None,
                depth: 0,
            }),
            unlocked: Condvar::new(),
        }
    }

    fn lock(&self) -> ProcessGuard<'_> {
        let current = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(current);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == current => {
                    state.depth += 1;
                    break;
                }
                Some(_) => state = self.unlocked.wait(state).unwrap(),
            }
        }
        ProcessGuard { lock: self }
    }
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.lock.unlocked.notify_one();
        }
    }
}

struct CurrentState {
    state: MonitoringState,
    job: Option<ActiveJob>,
}

pub(crate) struct MonitoringStateMachine {
    process_lock: ProcessLock,
    current: Mutex<CurrentState>,
}

impl MonitoringStateMachine {
    pub(crate) fn new() -> Self {
        Self {
            process_lock: ProcessLock::new(),
            current: Mutex::new(CurrentState {
                state: MonitoringState::WaitForStartDetection,
                job: None,
            }),
        }
    }

    pub(crate) fn current_state(&self) -> MonitoringState {
        self.current.lock().unwrap().state
    }

    /// Handle one event to completion, notification included. Concurrent
    /// calls from other threads queue on the process lock; same-thread
    /// reentrant calls proceed.
    pub(crate) fn on_event(&self, reader: &Arc<ObservableReaderInner>, event: InternalEvent) {
        let _guard = self.process_lock.lock();
        let state = self.current_state();
        trace!(
            reader = %reader.name(),
            state = ?state,
            event = ?event,
            "processing monitoring event"
        );

        match state {
            MonitoringState::WaitForStartDetection => self.on_event_waiting_for_start(reader, event),
            MonitoringState::WaitForCardInsertion => {
                self.on_event_waiting_for_insertion(reader, event)
            }
            MonitoringState::WaitForCardProcessing => {
                self.on_event_waiting_for_processing(reader, event)
            }
            MonitoringState::WaitForCardRemoval => self.on_event_waiting_for_removal(reader, event),
        }
    }

    /// Stop the active job and return to the idle state. Called on
    /// unregister.
    pub(crate) fn shutdown(&self, reader: &Arc<ObservableReaderInner>) {
        trace!(reader = %reader.name(), "shutting down the monitoring state machine");
        let mut current = self.current.lock().unwrap();
        if let Some(job) = current.job.take() {
            job.stop();
        }
        current.state = MonitoringState::WaitForStartDetection;
    }

    fn on_event_waiting_for_start(
        &self,
        reader: &Arc<ObservableReaderInner>,
        event: InternalEvent,
    ) {
        match event {
            InternalEvent::StartDetect => {
                reader.observable_spi().on_start_detection();
                self.switch_state(reader, MonitoringState::WaitForCardInsertion);
            }
            _ => self.ignore(reader, event),
        }
    }

    fn on_event_waiting_for_insertion(
        &self,
        reader: &Arc<ObservableReaderInner>,
        event: InternalEvent,
    ) {
        match event {
            InternalEvent::CardInserted => {
                // The selection scenario (if any) runs here, on the thread
                // that posted the event, without holding the state lock.
                match reader.process_card_inserted() {
                    Some(reader_event) => {
                        self.switch_state(reader, MonitoringState::WaitForCardProcessing);
                        reader.notify_observers(reader_event);
                    }
                    None => {
                        // The card was rejected by the scenario: wait for the
                        // physical channel to drain.
                        self.switch_state(reader, MonitoringState::WaitForCardRemoval);
                    }
                }
            }
            InternalEvent::StopDetect => self.stop_detection(reader),
            _ => self.ignore(reader, event),
        }
    }

    fn on_event_waiting_for_processing(
        &self,
        reader: &Arc<ObservableReaderInner>,
        event: InternalEvent,
    ) {
        match event {
            InternalEvent::CardProcessed => {
                if reader.detection_mode() == DetectionMode::Repeating {
                    self.switch_state(reader, MonitoringState::WaitForCardRemoval);
                } else {
                    reader.reader().close_logical_and_physical_channels_silently();
                    self.switch_state(reader, MonitoringState::WaitForStartDetection);
                }
            }
            InternalEvent::CardRemoved => self.card_removed(reader),
            InternalEvent::StopDetect => {
                reader.reader().close_logical_and_physical_channels_silently();
                self.stop_detection(reader);
            }
            _ => self.ignore(reader, event),
        }
    }

    fn on_event_waiting_for_removal(
        &self,
        reader: &Arc<ObservableReaderInner>,
        event: InternalEvent,
    ) {
        match event {
            InternalEvent::CardRemoved => self.card_removed(reader),
            InternalEvent::StopDetect => self.stop_detection(reader),
            _ => self.ignore(reader, event),
        }
    }

    fn card_removed(&self, reader: &Arc<ObservableReaderInner>) {
        if reader.detection_mode() == DetectionMode::Repeating {
            self.switch_state(reader, MonitoringState::WaitForCardInsertion);
        } else {
            self.switch_state(reader, MonitoringState::WaitForStartDetection);
        }
        reader.process_card_removed();
    }

    fn stop_detection(&self, reader: &Arc<ObservableReaderInner>) {
        reader.observable_spi().on_stop_detection();
        self.switch_state(reader, MonitoringState::WaitForStartDetection);
    }

    fn ignore(&self, reader: &Arc<ObservableReaderInner>, event: InternalEvent) {
        warn!(
            reader = %reader.name(),
            state = ?self.current_state(),
            event = ?event,
            "event ignored in current monitoring state"
        );
    }

    /// Deactivate the previous state's job, then activate the new state's
    /// job. The old job is signaled and detached, never joined: a job posting
    /// the event that triggers its own replacement would otherwise deadlock.
    fn switch_state(&self, reader: &Arc<ObservableReaderInner>, new_state: MonitoringState) {
        let mut current = self.current.lock().unwrap();
        if let Some(job) = current.job.take() {
            job.stop();
        }

        trace!(
            reader = %reader.name(),
            from = ?current.state,
            to = ?new_state,
            "switching monitoring state"
        );
        current.state = new_state;
        current.job = self
            .job_for(reader, new_state)
            .map(|job| ActiveJob::spawn(job, reader));
    }

    /// Pick the monitoring job for a state from the capability snapshot taken
    /// at reader construction.
    fn job_for(
        &self,
        reader: &Arc<ObservableReaderInner>,
        state: MonitoringState,
    ) -> Option<Arc<dyn MonitoringJob>> {
        let capabilities = reader.capabilities();
        match state {
            MonitoringState::WaitForStartDetection => None,
            MonitoringState::WaitForCardInsertion => {
                if capabilities.autonomous_insertion {
                    // The driver pushes the event itself through the callback
                    // connected at construction.
                    None
                } else if capabilities.blocking_insertion {
                    Some(super::monitoring::card_insertion_passive(reader))
                } else {
                    Some(super::monitoring::card_insertion_active(reader))
                }
            }
            MonitoringState::WaitForCardProcessing => {
                if capabilities.skip_processing_ping || capabilities.autonomous_removal {
                    None
                } else {
                    Some(super::monitoring::card_presence_ping(reader))
                }
            }
            MonitoringState::WaitForCardRemoval => {
                if capabilities.autonomous_removal {
                    None
                } else if capabilities.blocking_removal {
                    Some(super::monitoring::card_removal_passive(reader))
                } else {
                    Some(super::monitoring::card_removal_active(reader))
                }
            }
        }
    }

}
