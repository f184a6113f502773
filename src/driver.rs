//! Driver boundary.
//!
//! The hardware driver is an external collaborator. This module only pins
//! down the surface the orchestration layer consumes: discovery events plus
//! per-adapter events and operations. Production code plugs in a real driver
//! binding; tests use [`crate::mock`].
//!
//! Subscribing to an event stream before issuing the triggering call is the
//! contract that makes operation outcomes lossless: a receiver obtained from
//! `events()` sees every event sent after it was created.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::DriverError;
use crate::types::{
    AdapterDescriptor, AdapterState, AttributeValue, ConnectOptions, ConnectionParameters, Device,
    DeviceAddress, OpenOptions,
};

/// Adapter population changes reported by the driver.
#[derive(Clone)]
pub enum DiscoveryEvent {
    Added(Arc<dyn AdapterLink>),
    Removed(AdapterDescriptor),
    Error(DriverError),
}

impl fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::Added(link) => f.debug_tuple("Added").field(&link.descriptor()).finish(),
            DiscoveryEvent::Removed(descriptor) => {
                f.debug_tuple("Removed").field(descriptor).finish()
            }
            DiscoveryEvent::Error(error) => f.debug_tuple("Error").field(error).finish(),
        }
    }
}

/// Asynchronous events emitted by one adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Error(DriverError),
    StateChanged(AdapterState),
    DeviceConnected(Device),
    DeviceDisconnected(Device),
    ConnectTimedOut(DeviceAddress),
    ConnParamUpdateRequest {
        device: Device,
        parameters: ConnectionParameters,
    },
    CharacteristicValueChanged(AttributeValue),
    DescriptorValueChanged(AttributeValue),
    SecurityChanged(Device),
}

/// Entry point into the driver: adapter discovery.
#[async_trait]
pub trait BleDriver: Send + Sync {
    /// Subscribe to adapter added/removed/error events.
    fn discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent>;

    /// Enumerate the adapters currently attached.
    async fn enumerate(&self) -> Result<Vec<Arc<dyn AdapterLink>>, DriverError>;
}

/// Handle to one adapter.
///
/// Operations resolve once the driver has accepted or refused the request;
/// longer-lived outcomes (a device actually connecting, a connect attempt
/// timing out) arrive through the event stream.
#[async_trait]
pub trait AdapterLink: Send + Sync {
    fn descriptor(&self) -> AdapterDescriptor;

    /// Subscribe to this adapter's event stream.
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;

    async fn open(&self, options: &OpenOptions) -> Result<(), DriverError>;

    async fn close(&self) -> Result<(), DriverError>;

    async fn get_state(&self) -> Result<AdapterState, DriverError>;

    /// Ask the adapter to connect to a peer. Resolution arrives as a
    /// `DeviceConnected` or `ConnectTimedOut` event.
    async fn connect(
        &self,
        address: &DeviceAddress,
        options: &ConnectOptions,
    ) -> Result<(), DriverError>;

    /// Abort the in-flight connect attempt, whichever device it targets.
    async fn cancel_connect(&self) -> Result<(), DriverError>;

    async fn disconnect(&self, instance_id: &str) -> Result<(), DriverError>;

    /// Initiate pairing. `bond` asks the peer to store keys persistently.
    async fn pair(&self, instance_id: &str, bond: bool) -> Result<(), DriverError>;

    async fn update_connection_parameters(
        &self,
        instance_id: &str,
        parameters: &ConnectionParameters,
    ) -> Result<(), DriverError>;

    async fn reject_conn_params(&self, instance_id: &str) -> Result<(), DriverError>;
}
