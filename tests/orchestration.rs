//! End-to-end walks through the public API against the scripted driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use ble_conductor::mock::{MockAdapter, MockAdapterBuilder, MockDriver};
use ble_conductor::{
    AdapterDescriptor, AdapterEvent, AdapterRegistry, AdapterSession, AdapterState, AttributeValue,
    ConnectOutcome, ConnectionParameterNegotiator, ConnectionParameters, Device,
    DeviceAddress, DeviceConnectionManager, DriverError, Error, EventDispatcher, Notification,
    OpenOptions, ParamUpdateStatus, SessionPhase,
};

struct Harness {
    dispatcher: Arc<EventDispatcher>,
    session: Arc<AdapterSession>,
    connections: Arc<DeviceConnectionManager>,
    negotiator: ConnectionParameterNegotiator,
    discovery_rx: mpsc::UnboundedReceiver<Device>,
}

async fn harness(adapters: Vec<Arc<MockAdapter>>) -> Harness {
    let driver = Arc::new(MockDriver::new());
    for adapter in adapters {
        driver.add_adapter(adapter);
    }
    let dispatcher = Arc::new(EventDispatcher::new(64));
    let registry = Arc::new(AdapterRegistry::new(driver, Arc::clone(&dispatcher)));
    registry.start().await.unwrap();
    let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
    let session = Arc::new(AdapterSession::new(
        registry,
        Arc::clone(&dispatcher),
        discovery_tx,
    ));
    let connections = Arc::new(DeviceConnectionManager::new(
        Arc::clone(&session),
        Arc::clone(&dispatcher),
    ));
    let negotiator = ConnectionParameterNegotiator::new(Arc::clone(&session), Arc::clone(&dispatcher));
    Harness {
        dispatcher,
        session,
        connections,
        negotiator,
        discovery_rx,
    }
}

fn peer(address: &str) -> Device {
    let mut device = Device::new(DeviceAddress::random_static(address));
    device.instance_id = Some(format!("{}.instance", address));
    device
}

async fn next(rx: &mut broadcast::Receiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification stream closed")
}

#[tokio::test]
async fn test_full_session_walkthrough() {
    let target = peer("AA:BB:CC:DD:EE:FF");
    let opened_state = AdapterState {
        port: "COM3".to_string(),
        serial_number: Some("000680000000".to_string()),
        available: true,
        address: Some("DE:AD:BE:EF:00:01".to_string()),
        name: Some("nRF52840 DK".to_string()),
        firmware_version: Some("4.1.1".to_string()),
    };
    let adapter = MockAdapterBuilder::new("COM3")
        .serial_number("000680000000")
        .state(opened_state.clone())
        .connect_emits(AdapterEvent::DeviceConnected(target.clone()))
        .disconnect_emits(AdapterEvent::DeviceDisconnected(target.clone()))
        .build();

    // Wired by hand so the subscription catches the enumeration too.
    let driver = Arc::new(MockDriver::new());
    driver.add_adapter(Arc::clone(&adapter));
    let dispatcher = Arc::new(EventDispatcher::new(64));
    let mut rx = dispatcher.subscribe();
    let registry = Arc::new(AdapterRegistry::new(driver, Arc::clone(&dispatcher)));
    registry.start().await.unwrap();
    assert_eq!(
        next(&mut rx).await,
        Notification::AdapterAdded(AdapterDescriptor::with_serial_number(
            "COM3",
            "000680000000"
        ))
    );

    let (discovery_tx, mut discovery_rx) = mpsc::unbounded_channel();
    let session = Arc::new(AdapterSession::new(
        registry,
        Arc::clone(&dispatcher),
        discovery_tx,
    ));
    let connections = DeviceConnectionManager::new(Arc::clone(&session), Arc::clone(&dispatcher));
    let negotiator = ConnectionParameterNegotiator::new(Arc::clone(&session), Arc::clone(&dispatcher));

    let outcome = session.open("COM3", &OpenOptions::default()).await.unwrap();
    assert_eq!(outcome.state, opened_state);
    assert!(matches!(
        next(&mut rx).await,
        Notification::AdapterOpenInitiated(_)
    ));
    match next(&mut rx).await {
        Notification::AdapterOpened { adapter, state } => {
            assert_eq!(adapter.port, "COM3");
            assert_eq!(state.firmware_version.as_deref(), Some("4.1.1"));
        }
        other => panic!("expected AdapterOpened, got {:?}", other),
    }

    let mut changed_state = opened_state.clone();
    changed_state.name = Some("renamed".to_string());
    adapter.emit(AdapterEvent::StateChanged(changed_state.clone()));
    assert_eq!(
        next(&mut rx).await,
        Notification::AdapterStateChanged {
            adapter: AdapterDescriptor::with_serial_number("COM3", "000680000000"),
            state: changed_state,
        }
    );

    let outcome = connections.connect(&target).await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Connected(target.clone()));
    assert_eq!(
        next(&mut rx).await,
        Notification::ConnectInitiated(target.clone())
    );
    assert_eq!(
        next(&mut rx).await,
        Notification::DeviceConnected(target.clone())
    );
    let discovered = tokio::time::timeout(Duration::from_secs(1), discovery_rx.recv())
        .await
        .expect("timed out waiting for discovery request")
        .expect("discovery channel closed");
    assert_eq!(discovered, target);

    negotiator
        .accept(1, &target, &ConnectionParameters::default())
        .await
        .unwrap();
    assert_eq!(
        next(&mut rx).await,
        Notification::ConnParamUpdateStatus {
            id: 1,
            device: target.clone(),
            status: ParamUpdateStatus::Success,
        }
    );

    connections.disconnect(&target).await.unwrap();
    assert_eq!(
        next(&mut rx).await,
        Notification::DeviceDisconnected(target.clone())
    );

    session.close().await.unwrap();
    assert_eq!(
        next(&mut rx).await,
        Notification::AdapterClosed(AdapterDescriptor::with_serial_number(
            "COM3",
            "000680000000"
        ))
    );
    assert_eq!(session.phase().await, SessionPhase::Closed);
}

#[tokio::test]
async fn test_cancelled_attempt_does_not_poison_the_next_one() {
    let target = peer("AA:BB:CC:DD:EE:FF");
    let adapter = MockAdapterBuilder::new("COM3").build();
    let fx = harness(vec![Arc::clone(&adapter)]).await;
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    let mut rx = fx.dispatcher.subscribe();

    // First attempt hangs until cancelled.
    let pending = {
        let connections = Arc::clone(&fx.connections);
        let target = target.clone();
        tokio::spawn(async move { connections.connect(&target).await })
    };
    assert_eq!(
        next(&mut rx).await,
        Notification::ConnectInitiated(target.clone())
    );
    fx.connections.cancel_connect().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("connect did not settle")
        .expect("connect task panicked")
        .unwrap();
    assert_eq!(outcome, ConnectOutcome::Cancelled);
    assert_eq!(next(&mut rx).await, Notification::CancelConnectInitiated);
    assert_eq!(next(&mut rx).await, Notification::ConnectCancelled);

    // Second attempt settles normally.
    let pending = {
        let connections = Arc::clone(&fx.connections);
        let target = target.clone();
        tokio::spawn(async move { connections.connect(&target).await })
    };
    assert_eq!(
        next(&mut rx).await,
        Notification::ConnectInitiated(target.clone())
    );
    adapter.emit(AdapterEvent::DeviceConnected(target.clone()));
    let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("connect did not settle")
        .expect("connect task panicked")
        .unwrap();
    assert_eq!(outcome, ConnectOutcome::Connected(target));
}

#[tokio::test]
async fn test_fatal_error_blocks_operations_until_reopen() {
    let target = peer("AA:BB:CC:DD:EE:FF");
    let adapter = MockAdapterBuilder::new("COM3")
        .connect_emits(AdapterEvent::DeviceConnected(target.clone()))
        .build();
    let mut fx = harness(vec![Arc::clone(&adapter)]).await;
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    let mut rx = fx.dispatcher.subscribe();

    adapter.emit(AdapterEvent::Error(DriverError::fatal("firmware fault")));
    assert!(matches!(
        next(&mut rx).await,
        Notification::AdapterError { .. }
    ));
    assert_eq!(fx.session.phase().await, SessionPhase::Error);

    // Connect requires an open adapter now.
    let result = fx.connections.connect(&target).await;
    assert_eq!(result.unwrap_err(), Error::NoAdapterSelected);
    assert_eq!(adapter.calls().connect, 0);

    // Reopening the same adapter brings it back.
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    assert_eq!(fx.session.phase().await, SessionPhase::Open);
    assert_eq!(adapter.calls().open, 2);
    // An errored adapter is replaced, not closed.
    assert_eq!(adapter.calls().close, 0);

    let outcome = fx.connections.connect(&target).await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Connected(target.clone()));
    // The fresh pump still feeds service discovery.
    let discovered = tokio::time::timeout(Duration::from_secs(1), fx.discovery_rx.recv())
        .await
        .expect("timed out waiting for discovery request")
        .expect("discovery channel closed");
    assert_eq!(discovered, target);
}

#[tokio::test]
async fn test_attribute_value_changes_share_one_notification() {
    let adapter = MockAdapterBuilder::new("COM3").build();
    let fx = harness(vec![Arc::clone(&adapter)]).await;
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    let mut rx = fx.dispatcher.subscribe();

    let characteristic = AttributeValue {
        instance_id: "char-17".to_string(),
        value: vec![0x01, 0x02],
    };
    let descriptor = AttributeValue {
        instance_id: "desc-18".to_string(),
        value: vec![0x00],
    };
    adapter.emit(AdapterEvent::CharacteristicValueChanged(characteristic.clone()));
    adapter.emit(AdapterEvent::DescriptorValueChanged(descriptor.clone()));

    assert_eq!(
        next(&mut rx).await,
        Notification::AttributeValueChanged(characteristic)
    );
    assert_eq!(
        next(&mut rx).await,
        Notification::AttributeValueChanged(descriptor)
    );
}

#[tokio::test]
async fn test_param_request_round_trip_ends_rejected() {
    let target = peer("AA:BB:CC:DD:EE:FF");
    let adapter = MockAdapterBuilder::new("COM3").build();
    let fx = harness(vec![Arc::clone(&adapter)]).await;
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    let mut rx = fx.dispatcher.subscribe();

    let requested = ConnectionParameters {
        min_conn_interval_ms: 30.0,
        max_conn_interval_ms: 50.0,
        slave_latency: 4,
        conn_sup_timeout_ms: 6000,
    };
    adapter.emit(AdapterEvent::ConnParamUpdateRequest {
        device: target.clone(),
        parameters: requested.clone(),
    });
    assert_eq!(
        next(&mut rx).await,
        Notification::ConnParamUpdateRequest {
            device: target.clone(),
            parameters: requested,
        }
    );

    fx.negotiator.reject(42, &target).await.unwrap();
    assert_eq!(adapter.calls().reject_conn_params, 1);
    assert_eq!(
        next(&mut rx).await,
        Notification::ConnParamUpdateStatus {
            id: 42,
            device: target,
            status: ParamUpdateStatus::Rejected,
        }
    );
}

#[tokio::test]
async fn test_reject_failure_reports_error_status() {
    let target = peer("AA:BB:CC:DD:EE:FF");
    let adapter = MockAdapterBuilder::new("COM3")
        .fail_reject_conn_params(DriverError::new("peer gone"))
        .build();
    let fx = harness(vec![adapter]).await;
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    let mut rx = fx.dispatcher.subscribe();

    let result = fx.negotiator.reject(5, &target).await;

    assert!(matches!(result, Err(Error::Driver(_))));
    assert_eq!(
        next(&mut rx).await,
        Notification::ConnParamUpdateStatus {
            id: 5,
            device: target,
            status: ParamUpdateStatus::Error,
        }
    );
    assert!(matches!(
        next(&mut rx).await,
        Notification::RecoverableError { .. }
    ));
}

#[tokio::test]
async fn test_disconnect_failure_is_recoverable() {
    let target = peer("AA:BB:CC:DD:EE:FF");
    let adapter = MockAdapterBuilder::new("COM3")
        .fail_disconnect(DriverError::new("link supervision lost"))
        .build();
    let fx = harness(vec![adapter]).await;
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    let mut rx = fx.dispatcher.subscribe();

    let result = fx.connections.disconnect(&target).await;

    assert!(matches!(result, Err(Error::Driver(_))));
    match next(&mut rx).await {
        Notification::RecoverableError { adapter, error } => {
            assert_eq!(adapter.map(|a| a.port), Some("COM3".to_string()));
            assert_eq!(error, DriverError::new("link supervision lost"));
        }
        other => panic!("expected RecoverableError, got {:?}", other),
    }
    // The adapter stays usable.
    assert_eq!(fx.session.phase().await, SessionPhase::Open);
}

#[tokio::test]
async fn test_pair_call_failure_is_recoverable() {
    let target = peer("AA:BB:CC:DD:EE:FF");
    let adapter = MockAdapterBuilder::new("COM3")
        .fail_pair(DriverError::new("insufficient authentication"))
        .build();
    let fx = harness(vec![Arc::clone(&adapter)]).await;
    fx.session.open("COM3", &OpenOptions::default()).await.unwrap();
    let mut rx = fx.dispatcher.subscribe();

    let result = fx.connections.pair(&target).await;

    assert!(matches!(result, Err(Error::Driver(_))));
    assert_eq!(
        next(&mut rx).await,
        Notification::PairingInitiated(target)
    );
    assert!(matches!(
        next(&mut rx).await,
        Notification::RecoverableError { .. }
    ));
    assert_eq!(adapter.calls().pair, 1);
}
