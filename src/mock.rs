//! Scriptable in-memory driver for tests and demos.
//!
//! `MockDriver` plays the hardware driver: adapters are added up front or
//! pushed through discovery events, and every `MockAdapter` call can be
//! scripted to fail or to emit follow-up adapter events, which is how the
//! asynchronous outcomes of connect, pair and disconnect are simulated.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use crate::driver::{AdapterEvent, AdapterLink, BleDriver, DiscoveryEvent};
use crate::error::DriverError;
use crate::types::{
    AdapterDescriptor, AdapterState, ConnectOptions, ConnectionParameters, DeviceAddress,
    OpenOptions,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory stand-in for the hardware driver.
pub struct MockDriver {
    discovery: broadcast::Sender<DiscoveryEvent>,
    adapters: Mutex<Vec<Arc<MockAdapter>>>,
    enumerate_error: Mutex<Option<DriverError>>,
    enumerate_calls: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        let (discovery, _) = broadcast::channel(64);
        Self {
            discovery,
            adapters: Mutex::new(Vec::new()),
            enumerate_error: Mutex::new(None),
            enumerate_calls: AtomicUsize::new(0),
        }
    }

    /// Make `adapter` part of the next enumeration.
    pub fn add_adapter(&self, adapter: Arc<MockAdapter>) {
        lock(&self.adapters).push(adapter);
    }

    /// Announce a hot-plugged adapter through the discovery stream.
    pub fn emit_added(&self, adapter: Arc<MockAdapter>) {
        lock(&self.adapters).push(Arc::clone(&adapter));
        let _ = self.discovery.send(DiscoveryEvent::Added(adapter));
    }

    /// Announce an unplugged adapter through the discovery stream.
    pub fn emit_removed(&self, descriptor: AdapterDescriptor) {
        lock(&self.adapters).retain(|adapter| adapter.descriptor.port != descriptor.port);
        let _ = self.discovery.send(DiscoveryEvent::Removed(descriptor));
    }

    /// Push a driver-level failure through the discovery stream.
    pub fn emit_discovery_error(&self, error: DriverError) {
        let _ = self.discovery.send(DiscoveryEvent::Error(error));
    }

    /// Make every following `enumerate` call fail with `error`.
    pub fn fail_enumerate(&self, error: DriverError) {
        *lock(&self.enumerate_error) = Some(error);
    }

    pub fn enumerate_calls(&self) -> usize {
        self.enumerate_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleDriver for MockDriver {
    fn discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery.subscribe()
    }

    async fn enumerate(&self) -> Result<Vec<Arc<dyn AdapterLink>>, DriverError> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.enumerate_error).clone() {
            return Err(error);
        }
        Ok(lock(&self.adapters)
            .iter()
            .map(|adapter| Arc::clone(adapter) as Arc<dyn AdapterLink>)
            .collect())
    }
}

/// Holds a scripted call open until released, so a test can interleave
/// other work while the call is in flight.
pub struct CallGate {
    entered: Notify,
    release: Notify,
}

impl CallGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Wait until the gated call has reached the driver.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the gated call finish.
    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

/// Per-call failure scripts and events to replay after a call succeeds.
#[derive(Default)]
struct AdapterScript {
    fail_open: Option<DriverError>,
    fail_close: Option<DriverError>,
    fail_get_state: Option<DriverError>,
    fail_connect: Option<DriverError>,
    fail_cancel_connect: Option<DriverError>,
    fail_disconnect: Option<DriverError>,
    fail_pair: Option<DriverError>,
    fail_update_connection_parameters: Option<DriverError>,
    fail_reject_conn_params: Option<DriverError>,
    hold_close: Option<Arc<CallGate>>,
    on_connect: Vec<AdapterEvent>,
    on_disconnect: Vec<AdapterEvent>,
    on_pair: Vec<AdapterEvent>,
}

#[derive(Default)]
struct CallCounters {
    open: AtomicUsize,
    close: AtomicUsize,
    get_state: AtomicUsize,
    connect: AtomicUsize,
    cancel_connect: AtomicUsize,
    disconnect: AtomicUsize,
    pair: AtomicUsize,
    update_connection_parameters: AtomicUsize,
    reject_conn_params: AtomicUsize,
}

/// Snapshot of how often each driver call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub open: usize,
    pub close: usize,
    pub get_state: usize,
    pub connect: usize,
    pub cancel_connect: usize,
    pub disconnect: usize,
    pub pair: usize,
    pub update_connection_parameters: usize,
    pub reject_conn_params: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.open
            + self.close
            + self.get_state
            + self.connect
            + self.cancel_connect
            + self.disconnect
            + self.pair
            + self.update_connection_parameters
            + self.reject_conn_params
    }
}

/// In-memory stand-in for one adapter.
pub struct MockAdapter {
    descriptor: AdapterDescriptor,
    state: Mutex<AdapterState>,
    events: broadcast::Sender<AdapterEvent>,
    script: Mutex<AdapterScript>,
    counters: CallCounters,
}

impl MockAdapter {
    pub fn descriptor(&self) -> AdapterDescriptor {
        self.descriptor.clone()
    }

    /// Push an adapter event to everyone subscribed.
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            open: self.counters.open.load(Ordering::SeqCst),
            close: self.counters.close.load(Ordering::SeqCst),
            get_state: self.counters.get_state.load(Ordering::SeqCst),
            connect: self.counters.connect.load(Ordering::SeqCst),
            cancel_connect: self.counters.cancel_connect.load(Ordering::SeqCst),
            disconnect: self.counters.disconnect.load(Ordering::SeqCst),
            pair: self.counters.pair.load(Ordering::SeqCst),
            update_connection_parameters: self
                .counters
                .update_connection_parameters
                .load(Ordering::SeqCst),
            reject_conn_params: self.counters.reject_conn_params.load(Ordering::SeqCst),
        }
    }

    pub fn set_state(&self, state: AdapterState) {
        *lock(&self.state) = state;
    }

    pub fn fail_open(&self, error: DriverError) {
        lock(&self.script).fail_open = Some(error);
    }

    pub fn fail_close(&self, error: DriverError) {
        lock(&self.script).fail_close = Some(error);
    }

    pub fn fail_get_state(&self, error: DriverError) {
        lock(&self.script).fail_get_state = Some(error);
    }

    pub fn fail_connect(&self, error: DriverError) {
        lock(&self.script).fail_connect = Some(error);
    }

    pub fn fail_cancel_connect(&self, error: DriverError) {
        lock(&self.script).fail_cancel_connect = Some(error);
    }

    pub fn fail_disconnect(&self, error: DriverError) {
        lock(&self.script).fail_disconnect = Some(error);
    }

    pub fn fail_pair(&self, error: DriverError) {
        lock(&self.script).fail_pair = Some(error);
    }

    pub fn fail_update_connection_parameters(&self, error: DriverError) {
        lock(&self.script).fail_update_connection_parameters = Some(error);
    }

    pub fn fail_reject_conn_params(&self, error: DriverError) {
        lock(&self.script).fail_reject_conn_params = Some(error);
    }

    fn replay(&self, events: Vec<AdapterEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

#[async_trait]
impl AdapterLink for MockAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        self.descriptor.clone()
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    async fn open(&self, _options: &OpenOptions) -> Result<(), DriverError> {
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.script).fail_open.clone() {
            return Err(error);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.counters.close.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.script).hold_close.clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(error) = lock(&self.script).fail_close.clone() {
            return Err(error);
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<AdapterState, DriverError> {
        self.counters.get_state.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.script).fail_get_state.clone() {
            return Err(error);
        }
        Ok(lock(&self.state).clone())
    }

    async fn connect(
        &self,
        _address: &DeviceAddress,
        _options: &ConnectOptions,
    ) -> Result<(), DriverError> {
        self.counters.connect.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let script = lock(&self.script);
            if let Some(error) = script.fail_connect.clone() {
                return Err(error);
            }
            script.on_connect.clone()
        };
        self.replay(scripted);
        Ok(())
    }

    async fn cancel_connect(&self) -> Result<(), DriverError> {
        self.counters.cancel_connect.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.script).fail_cancel_connect.clone() {
            return Err(error);
        }
        Ok(())
    }

    async fn disconnect(&self, _instance_id: &str) -> Result<(), DriverError> {
        self.counters.disconnect.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let script = lock(&self.script);
            if let Some(error) = script.fail_disconnect.clone() {
                return Err(error);
            }
            script.on_disconnect.clone()
        };
        self.replay(scripted);
        Ok(())
    }

    async fn pair(&self, _instance_id: &str, _bond: bool) -> Result<(), DriverError> {
        self.counters.pair.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let script = lock(&self.script);
            if let Some(error) = script.fail_pair.clone() {
                return Err(error);
            }
            script.on_pair.clone()
        };
        self.replay(scripted);
        Ok(())
    }

    async fn update_connection_parameters(
        &self,
        _instance_id: &str,
        _parameters: &ConnectionParameters,
    ) -> Result<(), DriverError> {
        self.counters
            .update_connection_parameters
            .fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.script).fail_update_connection_parameters.clone() {
            return Err(error);
        }
        Ok(())
    }

    async fn reject_conn_params(&self, _instance_id: &str) -> Result<(), DriverError> {
        self.counters.reject_conn_params.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.script).fail_reject_conn_params.clone() {
            return Err(error);
        }
        Ok(())
    }
}

/// Builds a `MockAdapter` with its failure script and replay events.
pub struct MockAdapterBuilder {
    descriptor: AdapterDescriptor,
    state: Option<AdapterState>,
    script: AdapterScript,
}

impl MockAdapterBuilder {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            descriptor: AdapterDescriptor::new(port),
            state: None,
            script: AdapterScript::default(),
        }
    }

    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.descriptor.serial_number = Some(serial_number.into());
        self
    }

    pub fn state(mut self, state: AdapterState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn fail_open(mut self, error: DriverError) -> Self {
        self.script.fail_open = Some(error);
        self
    }

    pub fn fail_close(mut self, error: DriverError) -> Self {
        self.script.fail_close = Some(error);
        self
    }

    pub fn fail_get_state(mut self, error: DriverError) -> Self {
        self.script.fail_get_state = Some(error);
        self
    }

    pub fn fail_connect(mut self, error: DriverError) -> Self {
        self.script.fail_connect = Some(error);
        self
    }

    pub fn fail_cancel_connect(mut self, error: DriverError) -> Self {
        self.script.fail_cancel_connect = Some(error);
        self
    }

    pub fn fail_disconnect(mut self, error: DriverError) -> Self {
        self.script.fail_disconnect = Some(error);
        self
    }

    pub fn fail_pair(mut self, error: DriverError) -> Self {
        self.script.fail_pair = Some(error);
        self
    }

    pub fn fail_update_connection_parameters(mut self, error: DriverError) -> Self {
        self.script.fail_update_connection_parameters = Some(error);
        self
    }

    pub fn fail_reject_conn_params(mut self, error: DriverError) -> Self {
        self.script.fail_reject_conn_params = Some(error);
        self
    }

    /// Park every close call on `gate` until the test releases it.
    pub fn hold_close(mut self, gate: Arc<CallGate>) -> Self {
        self.script.hold_close = Some(gate);
        self
    }

    /// Replay `event` on the adapter stream after a successful connect call.
    pub fn connect_emits(mut self, event: AdapterEvent) -> Self {
        self.script.on_connect.push(event);
        self
    }

    /// Replay `event` on the adapter stream after a successful disconnect call.
    pub fn disconnect_emits(mut self, event: AdapterEvent) -> Self {
        self.script.on_disconnect.push(event);
        self
    }

    /// Replay `event` on the adapter stream after a successful pair call.
    pub fn pair_emits(mut self, event: AdapterEvent) -> Self {
        self.script.on_pair.push(event);
        self
    }

    pub fn build(self) -> Arc<MockAdapter> {
        let state = self.state.unwrap_or_else(|| AdapterState {
            port: self.descriptor.port.clone(),
            serial_number: self.descriptor.serial_number.clone(),
            available: true,
            address: None,
            name: None,
            firmware_version: None,
        });
        let (events, _) = broadcast::channel(64);
        Arc::new(MockAdapter {
            descriptor: self.descriptor,
            state: Mutex::new(state),
            events,
            script: Mutex::new(self.script),
            counters: CallCounters::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Device;

    #[tokio::test]
    async fn test_scripted_failure_is_persistent() {
        let adapter = MockAdapterBuilder::new("COM3")
            .fail_open(DriverError::new("busy"))
            .build();

        assert!(adapter.open(&OpenOptions::default()).await.is_err());
        assert!(adapter.open(&OpenOptions::default()).await.is_err());
        assert_eq!(adapter.calls().open, 2);
    }

    #[tokio::test]
    async fn test_connect_replays_scripted_events() {
        let device = Device::new(DeviceAddress::random_static("AA:BB:CC:DD:EE:FF"));
        let adapter = MockAdapterBuilder::new("COM3")
            .connect_emits(AdapterEvent::DeviceConnected(device.clone()))
            .build();
        let mut events = AdapterLink::events(&*adapter);

        adapter
            .connect(&device.address, &ConnectOptions::default())
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            AdapterEvent::DeviceConnected(device)
        );
    }

    #[tokio::test]
    async fn test_enumerate_failure_and_counts() {
        let driver = MockDriver::new();
        driver.add_adapter(MockAdapterBuilder::new("COM3").build());
        driver.fail_enumerate(DriverError::new("no driver"));

        assert!(driver.enumerate().await.is_err());
        assert_eq!(driver.enumerate_calls(), 1);
    }

    #[tokio::test]
    async fn test_removed_adapter_leaves_enumeration() {
        let driver = MockDriver::new();
        driver.add_adapter(MockAdapterBuilder::new("COM3").build());
        driver.emit_removed(AdapterDescriptor::new("COM3"));

        assert!(driver.enumerate().await.unwrap().is_empty());
    }
}
