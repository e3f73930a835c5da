//! Observable plugin behavior: watcher lifecycle, reader appear/disappear
//! events, autonomous drivers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};

use common::{
    ChannelPluginObserver, MockAutonomousPluginSpi, MockObservablePluginSpi, MockPluginFactory,
    SilentObservationHandler,
};
use termcard_plugin_spi::{PluginFactorySpi, PluginSpiRef};
use termcard_service::{
    Error, ObservablePlugin, PluginEvent, PluginEventType, PluginObserver, SmartCardService,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

fn register_observable(
    service: &SmartCardService,
    spi: Arc<MockObservablePluginSpi>,
) -> ObservablePlugin {
    let factory = Arc::new(MockPluginFactory::new(PluginSpiRef::Observable(spi)))
        as Arc<dyn PluginFactorySpi>;
    let plugin = service.register_plugin(factory).unwrap();
    plugin.as_observable().unwrap().clone()
}

fn expect_event(rx: &Receiver<PluginEvent>, event_type: PluginEventType) -> PluginEvent {
    let event = rx.recv_timeout(EVENT_TIMEOUT).expect("no plugin event received");
    assert_eq!(event.event_type(), event_type);
    event
}

#[test]
fn reader_connection_and_disconnection_are_notified() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockObservablePluginSpi::new(
        "plugin1",
        Duration::from_millis(50),
    ));
    let observable = register_observable(&service, spi.clone());

    let (tx, rx) = unbounded();
    observable
        .set_observation_exception_handler(Arc::new(SilentObservationHandler))
        .unwrap();
    observable
        .add_observer(Arc::new(ChannelPluginObserver(tx)))
        .unwrap();

    spi.add_reader_name("reader1");
    let event = expect_event(&rx, PluginEventType::ReaderConnected);
    assert_eq!(event.plugin_name(), "plugin1");
    assert_eq!(event.reader_names(), ["reader1".to_string()]);

    // The connected reader joined the plugin's reader map.
    let plugin = service.plugin("plugin1").unwrap();
    assert!(plugin.reader("reader1").unwrap().is_some());

    spi.remove_reader_name("reader1");
    let event = expect_event(&rx, PluginEventType::ReaderDisconnected);
    assert_eq!(event.reader_names(), ["reader1".to_string()]);
    assert!(plugin.reader("reader1").unwrap().is_none());
}

#[test]
fn adding_an_observer_without_handler_is_illegal_state() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockObservablePluginSpi::new(
        "plugin1",
        Duration::from_millis(50),
    ));
    let observable = register_observable(&service, spi);

    let (tx, _rx) = unbounded();
    let result = observable.add_observer(Arc::new(ChannelPluginObserver(tx)));
    assert!(matches!(result, Err(Error::IllegalState(_))));
}

#[test]
fn adding_an_observer_to_an_unregistered_plugin_is_illegal_state() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockObservablePluginSpi::new(
        "plugin1",
        Duration::from_millis(50),
    ));
    let observable = register_observable(&service, spi);
    service.unregister_plugin("plugin1");

    let (tx, _rx) = unbounded();
    let result = observable.add_observer(Arc::new(ChannelPluginObserver(tx)));
    assert!(matches!(result, Err(Error::IllegalState(_))));
}

#[test]
fn the_watcher_stops_with_the_last_observer() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockObservablePluginSpi::new(
        "plugin1",
        Duration::from_millis(20),
    ));
    let observable = register_observable(&service, spi.clone());

    let (tx, rx) = unbounded();
    observable
        .set_observation_exception_handler(Arc::new(SilentObservationHandler))
        .unwrap();
    let observer: Arc<dyn PluginObserver> = Arc::new(ChannelPluginObserver(tx));
    observable.add_observer(observer.clone()).unwrap();

    spi.add_reader_name("reader1");
    expect_event(&rx, PluginEventType::ReaderConnected);

    observable.remove_observer(&observer);
    assert_eq!(observable.count_observers(), 0);

    // With the watcher stopped, further changes go unnoticed.
    std::thread::sleep(Duration::from_millis(100));
    spi.add_reader_name("reader2");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn unregistering_notifies_unavailable_with_the_reader_names() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockObservablePluginSpi::new(
        "plugin1",
        Duration::from_millis(20),
    ));
    spi.add_reader_name("reader1");
    let observable = register_observable(&service, spi);

    let (tx, rx) = unbounded();
    observable
        .set_observation_exception_handler(Arc::new(SilentObservationHandler))
        .unwrap();
    observable
        .add_observer(Arc::new(ChannelPluginObserver(tx)))
        .unwrap();

    service.unregister_plugin("plugin1");

    let event = expect_event(&rx, PluginEventType::Unavailable);
    assert_eq!(event.reader_names(), ["reader1".to_string()]);
    assert_eq!(observable.count_observers(), 0);
}

#[test]
fn autonomous_plugins_push_reader_events_without_a_watcher() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockAutonomousPluginSpi::new("plugin1"));
    let factory = Arc::new(MockPluginFactory::new(PluginSpiRef::Autonomous(spi.clone())))
        as Arc<dyn PluginFactorySpi>;
    let plugin = service.register_plugin(factory).unwrap();
    let observable = plugin.as_observable().unwrap();

    let (tx, rx) = unbounded();
    observable
        .set_observation_exception_handler(Arc::new(SilentObservationHandler))
        .unwrap();
    observable
        .add_observer(Arc::new(ChannelPluginObserver(tx)))
        .unwrap();

    spi.push_reader("reader1");
    let event = expect_event(&rx, PluginEventType::ReaderConnected);
    assert_eq!(event.reader_names(), ["reader1".to_string()]);
    assert!(plugin.reader("reader1").unwrap().is_some());

    spi.drop_reader("reader1");
    expect_event(&rx, PluginEventType::ReaderDisconnected);
    assert!(plugin.reader("reader1").unwrap().is_none());
}
