//! Monitoring jobs
//!
//! Each job bridges one driver-side detection primitive into an internal
//! state machine event: active jobs poll the driver on a fixed cycle, passive
//! jobs park in the driver's blocking wait. A job receives the reader when
//! its thread starts and posts events through it; `stop` must make the job
//! exit promptly, either by waking the poll sleep or by canceling the
//! driver-side wait.
//!
//! Job errors never propagate: they are routed to the reader's observation
//! exception handler or logged, and the job exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{error, trace, warn};

use termcard_plugin_spi::{ObservableReaderSpi, WaitError};

use super::observable::ObservableReaderInner;
use super::state::InternalEvent;
use crate::error::Error;

/// A monitoring job: `run` iterates until stopped, posting internal events;
/// `stop` unblocks the job promptly.
pub(crate) trait MonitoringJob: Send + Sync {
    fn run(&self, reader: Arc<ObservableReaderInner>);
    fn stop(&self);
}

/// The job currently attached to a state. The thread is detached; stopping a
/// job signals it and lets it unwind on its own.
pub(crate) struct ActiveJob {
    job: Arc<dyn MonitoringJob>,
}

impl ActiveJob {
    pub(crate) fn spawn(job: Arc<dyn MonitoringJob>, reader: &Arc<ObservableReaderInner>) -> Self {
        let weak_reader = Arc::downgrade(reader);
        let runner = Arc::clone(&job);
        let spawned = thread::Builder::new()
            .name(format!("monitoring-{}", reader.name()))
            .spawn(move || {
                if let Some(reader) = weak_reader.upgrade() {
                    runner.run(reader);
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn monitoring job thread");
        }
        Self { job }
    }

    pub(crate) fn stop(&self) {
        self.job.stop();
    }
}

/// Stop signal shared between a job and the state machine: raising it wakes a
/// sleeping poll loop immediately.
struct StopSignal {
    raised: AtomicBool,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl StopSignal {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            raised: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Sleep for one poll cycle; returns true when the job must exit.
    fn sleep(&self, cycle: Duration) -> bool {
        !matches!(self.rx.recv_timeout(cycle), Err(RecvTimeoutError::Timeout))
    }
}

/// Active insertion detection: polls card presence until a card shows up.
pub(crate) fn card_insertion_active(reader: &Arc<ObservableReaderInner>) -> Arc<dyn MonitoringJob> {
    Arc::new(CardInsertionActiveMonitoringJob {
        cycle: reader.observable_spi().monitoring_cycle(),
        stop: StopSignal::new(),
    })
}

struct CardInsertionActiveMonitoringJob {
    cycle: Duration,
    stop: StopSignal,
}

impl MonitoringJob for CardInsertionActiveMonitoringJob {
    fn run(&self, reader: Arc<ObservableReaderInner>) {
        trace!(reader = %reader.name(), "polling for card insertion");
        while !self.stop.is_raised() {
            match reader.reader().spi().check_card_presence() {
                Ok(true) => {
                    reader.on_internal_event(InternalEvent::CardInserted);
                    return;
                }
                Ok(false) => {}
                Err(source) => {
                    reader.notify_observation_error(Box::new(Error::ReaderCommunication {
                        message: "an error occurred while monitoring the reader".to_string(),
                        source,
                    }));
                    return;
                }
            }
            if self.stop.sleep(self.cycle) {
                trace!(reader = %reader.name(), "card insertion polling stopped");
                return;
            }
        }
    }

    fn stop(&self) {
        self.stop.raise();
    }
}

/// Passive insertion detection: parks in the driver's blocking wait.
pub(crate) fn card_insertion_passive(
    reader: &Arc<ObservableReaderInner>,
) -> Arc<dyn MonitoringJob> {
    Arc::new(CardInsertionPassiveMonitoringJob {
        spi: reader.observable_spi().clone(),
        stop: StopSignal::new(),
    })
}

struct CardInsertionPassiveMonitoringJob {
    spi: Arc<dyn ObservableReaderSpi>,
    stop: StopSignal,
}

impl MonitoringJob for CardInsertionPassiveMonitoringJob {
    fn run(&self, reader: Arc<ObservableReaderInner>) {
        let Some(blocking) = self.spi.insertion_blocking() else {
            return;
        };
        if self.stop.is_raised() {
            return;
        }
        trace!(reader = %reader.name(), "waiting for card insertion");
        match blocking.wait_for_card_insertion() {
            Ok(()) => reader.on_internal_event(InternalEvent::CardInserted),
            Err(WaitError::Canceled) => {
                trace!(reader = %reader.name(), "card insertion wait canceled");
            }
            Err(WaitError::Reader(e)) => {
                // Can be a disconnection of the reader, the state machine
                // sees the silence as a stop at the next tick.
                warn!(
                    reader = %reader.name(),
                    error = %e,
                    "error while waiting for card insertion"
                );
            }
        }
    }

    fn stop(&self) {
        self.stop.raise();
        if let Some(blocking) = self.spi.insertion_blocking() {
            blocking.stop_wait_for_card_insertion();
        }
    }
}

/// Active removal detection: polls card presence until the card is gone.
pub(crate) fn card_removal_active(reader: &Arc<ObservableReaderInner>) -> Arc<dyn MonitoringJob> {
    Arc::new(CardRemovalActiveMonitoringJob {
        cycle: reader.observable_spi().monitoring_cycle(),
        use_apdu_ping: false,
        stop: StopSignal::new(),
    })
}

/// Presence ping used while the application processes the card: the card is
/// considered gone as soon as it stops answering a neutral APDU.
pub(crate) fn card_presence_ping(reader: &Arc<ObservableReaderInner>) -> Arc<dyn MonitoringJob> {
    Arc::new(CardRemovalActiveMonitoringJob {
        cycle: reader.observable_spi().monitoring_cycle(),
        use_apdu_ping: true,
        stop: StopSignal::new(),
    })
}

struct CardRemovalActiveMonitoringJob {
    cycle: Duration,
    use_apdu_ping: bool,
    stop: StopSignal,
}

impl MonitoringJob for CardRemovalActiveMonitoringJob {
    fn run(&self, reader: Arc<ObservableReaderInner>) {
        trace!(
            reader = %reader.name(),
            ping = self.use_apdu_ping,
            "polling for card removal"
        );
        while !self.stop.is_raised() {
            let present = if self.use_apdu_ping {
                reader.is_card_present_ping()
            } else {
                match reader.reader().spi().check_card_presence() {
                    Ok(present) => present,
                    Err(source) => {
                        reader.notify_observation_error(Box::new(Error::ReaderCommunication {
                            message: "an error occurred while monitoring the reader".to_string(),
                            source,
                        }));
                        return;
                    }
                }
            };
            if !present {
                reader.on_internal_event(InternalEvent::CardRemoved);
                return;
            }
            if self.stop.sleep(self.cycle) {
                trace!(reader = %reader.name(), "card removal polling stopped");
                return;
            }
        }
    }

    fn stop(&self) {
        self.stop.raise();
    }
}

/// Passive removal detection: parks in the driver's blocking wait.
pub(crate) fn card_removal_passive(reader: &Arc<ObservableReaderInner>) -> Arc<dyn MonitoringJob> {
    Arc::new(CardRemovalPassiveMonitoringJob {
        spi: reader.observable_spi().clone(),
        stop: StopSignal::new(),
    })
}

struct CardRemovalPassiveMonitoringJob {
    spi: Arc<dyn ObservableReaderSpi>,
    stop: StopSignal,
}

impl MonitoringJob for CardRemovalPassiveMonitoringJob {
    fn run(&self, reader: Arc<ObservableReaderInner>) {
        let Some(blocking) = self.spi.removal_blocking() else {
            return;
        };
        if self.stop.is_raised() {
            return;
        }
        trace!(reader = %reader.name(), "waiting for card removal");
        match blocking.wait_for_card_removal() {
            Ok(()) => reader.on_internal_event(InternalEvent::CardRemoved),
            Err(WaitError::Canceled) => {
                trace!(reader = %reader.name(), "card removal wait canceled");
            }
            Err(WaitError::Reader(e)) => {
                warn!(
                    reader = %reader.name(),
                    error = %e,
                    "error while waiting for card removal"
                );
            }
        }
    }

    fn stop(&self) {
        self.stop.raise();
        if let Some(blocking) = self.spi.removal_blocking() {
            blocking.stop_wait_for_card_removal();
        }
    }
}
