//! Card selection driven through the application-facing manager, both
//! explicitly and scheduled on an observable reader.

mod common;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;

use common::{
    ChannelReaderObserver, MockObservableReaderSpi, MockPluginFactory, MockPluginSpi,
    MockReaderSpi, SilentObservationHandler,
};
use termcard_plugin_spi::{PluginFactorySpi, PluginSpiRef, ReaderSpiRef};
use termcard_service::{
    CardSelectionRequest, CardSelector, DetectionMode, Error, NotificationMode, ReaderEventType,
    SmartCardService,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn explicit_scenario_processing_reports_the_active_selection() {
    let service = SmartCardService::new();
    let plugin_spi = MockPluginSpi::new(
        "plugin1",
        vec![ReaderSpiRef::Simple(Arc::new(
            MockReaderSpi::new("reader1").with_response(&[0x12, 0x34, 0x90, 0x00]),
        ))],
    );
    let factory = Arc::new(MockPluginFactory::new(PluginSpiRef::Simple(Arc::new(
        plugin_spi,
    )))) as Arc<dyn PluginFactorySpi>;
    let plugin = service.register_plugin(factory).unwrap();
    let reader = plugin.reader("reader1").unwrap().unwrap();

    let mut manager = service.create_card_selection_manager();
    let rejecting = CardSelector::new().filter_by_power_on_data("NOPE").unwrap();
    manager.prepare_selection(CardSelectionRequest::new(rejecting));
    manager.prepare_selection(CardSelectionRequest::new(CardSelector::new()));

    let result = manager.process_card_selection_scenario(&reader).unwrap();
    assert_eq!(result.active_selection_index(), Some(1));
    let active = result.active_selection().unwrap();
    assert!(active.has_matched());
    assert_eq!(active.power_on_data(), "12345678");
}

#[test]
fn processing_without_prepared_selection_is_illegal_state() {
    let service = SmartCardService::new();
    let plugin_spi = MockPluginSpi::new(
        "plugin1",
        vec![ReaderSpiRef::Simple(Arc::new(MockReaderSpi::new("reader1")))],
    );
    let factory = Arc::new(MockPluginFactory::new(PluginSpiRef::Simple(Arc::new(
        plugin_spi,
    )))) as Arc<dyn PluginFactorySpi>;
    let plugin = service.register_plugin(factory).unwrap();
    let reader = plugin.reader("reader1").unwrap().unwrap();

    let manager = service.create_card_selection_manager();
    let result = manager.process_card_selection_scenario(&reader);
    assert!(matches!(result, Err(Error::IllegalState(_))));
}

#[test]
fn scheduled_scenario_rides_along_the_reader_event() {
    let service = SmartCardService::new();
    let reader_spi = Arc::new(MockObservableReaderSpi::new("reader1"));
    reader_spi.set_card_present(false);

    let plugin_spi = MockPluginSpi::new(
        "plugin1",
        vec![ReaderSpiRef::Observable(reader_spi.clone())],
    );
    let factory = Arc::new(MockPluginFactory::new(PluginSpiRef::Simple(Arc::new(
        plugin_spi,
    )))) as Arc<dyn PluginFactorySpi>;
    let plugin = service.register_plugin(factory).unwrap();
    let reader = plugin.reader("reader1").unwrap().unwrap();
    let observable = reader.as_observable().unwrap();

    let (tx, rx) = unbounded();
    observable
        .set_observation_exception_handler(Arc::new(SilentObservationHandler))
        .unwrap();
    observable
        .add_observer(Arc::new(ChannelReaderObserver(tx)))
        .unwrap();

    let mut manager = service.create_card_selection_manager();
    manager.prepare_selection(CardSelectionRequest::new(CardSelector::new()));
    manager
        .schedule_card_selection_scenario(
            observable,
            NotificationMode::MatchedOnly,
            DetectionMode::Repeating,
        )
        .unwrap();

    observable.start_card_detection(DetectionMode::Repeating).unwrap();
    reader_spi.set_card_present(true);

    let event = rx.recv_timeout(EVENT_TIMEOUT).expect("no reader event");
    assert_eq!(event.event_type(), ReaderEventType::CardMatched);

    let responses = event.scheduled_selection_responses().unwrap();
    let result = manager.parse_scheduled_card_selections_response(responses);
    assert_eq!(result.active_selection_index(), Some(0));
    assert_eq!(result.active_selection().unwrap().power_on_data(), "12345678");

    observable.stop_card_detection();
}
