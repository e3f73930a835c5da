//! Mock driver SPIs shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;

use termcard_plugin_spi::{
    AutonomousObservablePluginSpi, CardIoError, ObservablePluginSpi, ObservableReaderSpi,
    PluginEventApi, PluginFactorySpi, PluginIoError, PluginSpi, PluginSpiRef, PoolPluginFactorySpi,
    PoolPluginSpi, ReaderIoError, ReaderSpi, ReaderSpiRef, TransmitError,
};
use termcard_service::{
    ObservationError, PluginEvent, PluginObservationExceptionHandler, PluginObserver, ReaderEvent,
    ReaderObservationExceptionHandler,
};

pub const COMMON_API: &str = "2.0.1";
pub const PLUGIN_API: &str = "2.3.1";
pub const SERVICE_API: &str = "3.2.0";

/// A reader answering every APDU with the same response.
pub struct MockReaderSpi {
    name: String,
    response: Bytes,
    power_on_data: String,
    card_present: AtomicBool,
    physical_channel_open: AtomicBool,
    unregistered: AtomicBool,
}

impl MockReaderSpi {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response: Bytes::from_static(&[0x6D, 0x00]),
            power_on_data: "12345678".to_string(),
            card_present: AtomicBool::new(true),
            physical_channel_open: AtomicBool::new(false),
            unregistered: AtomicBool::new(false),
        }
    }

    pub fn with_response(mut self, response: &[u8]) -> Self {
        self.response = Bytes::copy_from_slice(response);
        self
    }

    pub fn was_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::SeqCst)
    }
}

impl ReaderSpi for MockReaderSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_physical_channel(&self) -> Result<(), TransmitError> {
        self.physical_channel_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_physical_channel(&self) -> Result<(), ReaderIoError> {
        self.physical_channel_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_physical_channel_open(&self) -> bool {
        self.physical_channel_open.load(Ordering::SeqCst)
    }

    fn check_card_presence(&self) -> Result<bool, ReaderIoError> {
        Ok(self.card_present.load(Ordering::SeqCst))
    }

    fn power_on_data(&self) -> String {
        self.power_on_data.clone()
    }

    fn transmit_apdu(&self, _apdu: &[u8]) -> Result<Bytes, TransmitError> {
        if self.card_present.load(Ordering::SeqCst) {
            Ok(self.response.clone())
        } else {
            Err(CardIoError::new("no card").into())
        }
    }

    fn is_contactless(&self) -> bool {
        false
    }

    fn is_protocol_supported(&self, _reader_protocol: &str) -> bool {
        false
    }

    fn is_current_protocol(&self, _reader_protocol: &str) -> bool {
        false
    }

    fn activate_protocol(&self, _reader_protocol: &str) {}

    fn deactivate_protocol(&self, _reader_protocol: &str) {}

    fn on_unregister(&self) {
        self.unregistered.store(true, Ordering::SeqCst);
    }
}

/// An observable reader detected by active polling on a short cycle.
pub struct MockObservableReaderSpi {
    base: MockReaderSpi,
}

impl MockObservableReaderSpi {
    pub fn new(name: &str) -> Self {
        Self {
            base: MockReaderSpi::new(name),
        }
    }

    pub fn set_card_present(&self, present: bool) {
        self.base.card_present.store(present, Ordering::SeqCst);
    }
}

impl ReaderSpi for MockObservableReaderSpi {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn open_physical_channel(&self) -> Result<(), TransmitError> {
        self.base.open_physical_channel()
    }

    fn close_physical_channel(&self) -> Result<(), ReaderIoError> {
        self.base.close_physical_channel()
    }

    fn is_physical_channel_open(&self) -> bool {
        self.base.is_physical_channel_open()
    }

    fn check_card_presence(&self) -> Result<bool, ReaderIoError> {
        self.base.check_card_presence()
    }

    fn power_on_data(&self) -> String {
        self.base.power_on_data()
    }

    fn transmit_apdu(&self, apdu: &[u8]) -> Result<Bytes, TransmitError> {
        self.base.transmit_apdu(apdu)
    }

    fn is_contactless(&self) -> bool {
        self.base.is_contactless()
    }

    fn is_protocol_supported(&self, reader_protocol: &str) -> bool {
        self.base.is_protocol_supported(reader_protocol)
    }

    fn is_current_protocol(&self, reader_protocol: &str) -> bool {
        self.base.is_current_protocol(reader_protocol)
    }

    fn activate_protocol(&self, reader_protocol: &str) {
        self.base.activate_protocol(reader_protocol);
    }

    fn deactivate_protocol(&self, reader_protocol: &str) {
        self.base.deactivate_protocol(reader_protocol);
    }

    fn on_unregister(&self) {
        self.base.on_unregister();
    }
}

impl ObservableReaderSpi for MockObservableReaderSpi {
    fn on_start_detection(&self) {}

    fn on_stop_detection(&self) {}

    fn monitoring_cycle(&self) -> Duration {
        Duration::from_millis(10)
    }
}

/// A plugin with a fixed reader set.
pub struct MockPluginSpi {
    name: String,
    readers: Mutex<Vec<ReaderSpiRef>>,
    scan_fails: AtomicBool,
    unregistered: AtomicBool,
}

impl MockPluginSpi {
    pub fn new(name: &str, readers: Vec<ReaderSpiRef>) -> Self {
        Self {
            name: name.to_string(),
            readers: Mutex::new(readers),
            scan_fails: AtomicBool::new(false),
            unregistered: AtomicBool::new(false),
        }
    }

    pub fn failing_scan(name: &str) -> Self {
        let spi = Self::new(name, Vec::new());
        spi.scan_fails.store(true, Ordering::SeqCst);
        spi
    }

    pub fn was_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::SeqCst)
    }
}

impl PluginSpi for MockPluginSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_available_readers(&self) -> Result<Vec<ReaderSpiRef>, PluginIoError> {
        if self.scan_fails.load(Ordering::SeqCst) {
            return Err(PluginIoError::new("scan failed"));
        }
        Ok(self.readers.lock().unwrap().clone())
    }

    fn on_unregister(&self) {
        self.unregistered.store(true, Ordering::SeqCst);
    }
}

/// A plugin whose reader-name set is edited by the test and polled by the
/// service watcher.
pub struct MockObservablePluginSpi {
    name: String,
    reader_names: Mutex<Vec<String>>,
    cycle: Duration,
}

impl MockObservablePluginSpi {
    pub fn new(name: &str, cycle: Duration) -> Self {
        Self {
            name: name.to_string(),
            reader_names: Mutex::new(Vec::new()),
            cycle,
        }
    }

    pub fn add_reader_name(&self, reader_name: &str) {
        self.reader_names
            .lock()
            .unwrap()
            .push(reader_name.to_string());
    }

    pub fn remove_reader_name(&self, reader_name: &str) {
        self.reader_names.lock().unwrap().retain(|n| n != reader_name);
    }
}

impl PluginSpi for MockObservablePluginSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_available_readers(&self) -> Result<Vec<ReaderSpiRef>, PluginIoError> {
        Ok(self
            .reader_names
            .lock()
            .unwrap()
            .iter()
            .map(|name| ReaderSpiRef::Simple(Arc::new(MockReaderSpi::new(name))))
            .collect())
    }

    fn on_unregister(&self) {}
}

impl ObservablePluginSpi for MockObservablePluginSpi {
    fn monitoring_cycle(&self) -> Duration {
        self.cycle
    }

    fn search_available_reader_names(&self) -> Result<Vec<String>, PluginIoError> {
        Ok(self.reader_names.lock().unwrap().clone())
    }

    fn search_reader(&self, reader_name: &str) -> Result<Option<ReaderSpiRef>, PluginIoError> {
        let known = self
            .reader_names
            .lock()
            .unwrap()
            .iter()
            .any(|n| n == reader_name);
        Ok(known.then(|| ReaderSpiRef::Simple(Arc::new(MockReaderSpi::new(reader_name)))))
    }
}

/// A plugin pushing reader events itself through the connected API.
pub struct MockAutonomousPluginSpi {
    name: String,
    api: Mutex<Option<Arc<dyn PluginEventApi>>>,
}

impl MockAutonomousPluginSpi {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            api: Mutex::new(None),
        }
    }

    pub fn push_reader(&self, reader_name: &str) {
        let api = self.api.lock().unwrap().clone().expect("api not connected");
        api.on_reader_connected(vec![ReaderSpiRef::Simple(Arc::new(MockReaderSpi::new(
            reader_name,
        )))]);
    }

    pub fn drop_reader(&self, reader_name: &str) {
        let api = self.api.lock().unwrap().clone().expect("api not connected");
        api.on_reader_disconnected(&[reader_name.to_string()]);
    }
}

impl PluginSpi for MockAutonomousPluginSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_available_readers(&self) -> Result<Vec<ReaderSpiRef>, PluginIoError> {
        Ok(Vec::new())
    }

    fn on_unregister(&self) {}
}

impl AutonomousObservablePluginSpi for MockAutonomousPluginSpi {
    fn connect_plugin_api(&self, api: Arc<dyn PluginEventApi>) {
        *self.api.lock().unwrap() = Some(api);
    }
}

/// A pool plugin minting sequentially numbered readers.
pub struct MockPoolPluginSpi {
    name: String,
    groups: Vec<String>,
    allocations: AtomicUsize,
    released: Mutex<Vec<String>>,
    release_fails: AtomicBool,
}

impl MockPoolPluginSpi {
    pub fn new(name: &str, groups: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            allocations: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
            release_fails: AtomicBool::new(false),
        }
    }

    pub fn fail_release(&self) {
        self.release_fails.store(true, Ordering::SeqCst);
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

impl PoolPluginSpi for MockPoolPluginSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn reader_group_references(&self) -> Result<Vec<String>, PluginIoError> {
        Ok(self.groups.clone())
    }

    fn allocate_reader(&self, group_reference: &str) -> Result<ReaderSpiRef, PluginIoError> {
        if !self.groups.iter().any(|g| g == group_reference) {
            return Err(PluginIoError::new(format!(
                "unknown group '{group_reference}'"
            )));
        }
        let index = self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(ReaderSpiRef::Simple(Arc::new(MockReaderSpi::new(&format!(
            "{group_reference}-{index}"
        )))))
    }

    fn release_reader(&self, reader_name: &str) -> Result<(), PluginIoError> {
        self.released.lock().unwrap().push(reader_name.to_string());
        if self.release_fails.load(Ordering::SeqCst) {
            Err(PluginIoError::new("release failed"))
        } else {
            Ok(())
        }
    }

    fn on_unregister(&self) {}
}

/// Factory wrapping any local plugin SPI variant.
pub struct MockPluginFactory {
    plugin_name: String,
    spi: PluginSpiRef,
    declared_name_override: Option<String>,
}

impl MockPluginFactory {
    pub fn new(spi: PluginSpiRef) -> Self {
        Self {
            plugin_name: spi.name().to_string(),
            spi,
            declared_name_override: None,
        }
    }

    /// Declare a name different from the SPI's, to exercise the consistency
    /// check.
    pub fn declaring_name(mut self, name: &str) -> Self {
        self.declared_name_override = Some(name.to_string());
        self
    }
}

impl PluginFactorySpi for MockPluginFactory {
    fn plugin_name(&self) -> &str {
        self.declared_name_override.as_deref().unwrap_or(&self.plugin_name)
    }

    fn plugin_api_version(&self) -> &str {
        PLUGIN_API
    }

    fn common_api_version(&self) -> &str {
        COMMON_API
    }

    fn service_api_version(&self) -> &str {
        SERVICE_API
    }

    fn plugin(&self) -> PluginSpiRef {
        self.spi.clone()
    }
}

/// Factory wrapping a pool plugin SPI.
pub struct MockPoolPluginFactory {
    spi: Arc<dyn PoolPluginSpi>,
}

impl MockPoolPluginFactory {
    pub fn new(spi: Arc<dyn PoolPluginSpi>) -> Self {
        Self { spi }
    }
}

impl PoolPluginFactorySpi for MockPoolPluginFactory {
    fn pool_plugin_name(&self) -> &str {
        self.spi.name()
    }

    fn plugin_api_version(&self) -> &str {
        PLUGIN_API
    }

    fn common_api_version(&self) -> &str {
        COMMON_API
    }

    fn service_api_version(&self) -> &str {
        SERVICE_API
    }

    fn pool_plugin(&self) -> Arc<dyn PoolPluginSpi> {
        self.spi.clone()
    }
}

/// Plugin observer forwarding events into a channel.
pub struct ChannelPluginObserver(pub Sender<PluginEvent>);

impl PluginObserver for ChannelPluginObserver {
    fn on_plugin_event(&self, event: &PluginEvent) -> Result<(), ObservationError> {
        let _ = self.0.send(event.clone());
        Ok(())
    }
}

/// Reader observer forwarding events into a channel.
pub struct ChannelReaderObserver(pub Sender<ReaderEvent>);

impl termcard_service::CardReaderObserver for ChannelReaderObserver {
    fn on_reader_event(&self, event: &ReaderEvent) -> Result<(), ObservationError> {
        let _ = self.0.send(event.clone());
        Ok(())
    }
}

/// Exception handler that ignores everything.
pub struct SilentObservationHandler;

impl PluginObservationExceptionHandler for SilentObservationHandler {
    fn on_plugin_observation_error(
        &self,
        _plugin_name: &str,
        _error: ObservationError,
    ) -> Result<(), ObservationError> {
        Ok(())
    }
}

impl ReaderObservationExceptionHandler for SilentObservationHandler {
    fn on_reader_observation_error(
        &self,
        _plugin_name: &str,
        _reader_name: &str,
        _error: ObservationError,
    ) -> Result<(), ObservationError> {
        Ok(())
    }
}
