//! Connection orchestration between a UI and a BLE hardware driver.
//!
//! The driver owns the radio hardware and speaks in calls and event
//! streams; a UI wants a tidy sequence of notifications. This crate is the
//! layer in between:
//!
//! - [`AdapterRegistry`] mirrors which adapters the driver can see,
//! - [`AdapterSession`] selects one adapter and owns its open/close
//!   lifecycle,
//! - [`DeviceConnectionManager`] connects, cancels, disconnects and pairs
//!   devices on the open adapter,
//! - [`ConnectionParameterNegotiator`] answers peripheral-initiated
//!   connection parameter requests,
//! - every observable state change flows through one
//!   [`EventDispatcher`] stream of [`Notification`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ble_conductor::{
//!     AdapterRegistry, AdapterSession, DeviceConnectionManager, EventDispatcher, OpenOptions,
//! };
//! use ble_conductor::mock::MockDriver;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let driver = Arc::new(MockDriver::new());
//! let dispatcher = Arc::new(EventDispatcher::new(100));
//! let registry = Arc::new(AdapterRegistry::new(driver, Arc::clone(&dispatcher)));
//! registry.start().await?;
//!
//! let (discovery_tx, mut discovery_requests) = tokio::sync::mpsc::unbounded_channel();
//! let session = Arc::new(AdapterSession::new(
//!     registry,
//!     Arc::clone(&dispatcher),
//!     discovery_tx,
//! ));
//! let connections = DeviceConnectionManager::new(Arc::clone(&session), Arc::clone(&dispatcher));
//!
//! let mut notifications = dispatcher.subscribe();
//! session.open("COM3", &OpenOptions::default()).await?;
//! // Drive the UI from `notifications`, start service discovery from
//! // `discovery_requests`, connect devices through `connections`.
//! # let _ = (&connections, &mut discovery_requests, &mut notifications);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mock;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod types;

pub use config::{LogSettings, Settings, SettingsService};
pub use connection::{ConnectOutcome, DeviceConnectionManager};
pub use dispatch::{EventDispatcher, Notification, ParamUpdateStatus};
pub use driver::{AdapterEvent, AdapterLink, BleDriver, DiscoveryEvent};
pub use error::{DriverError, Error, Result};
pub use logging::{init_logging, LogGuard};
pub use negotiation::ConnectionParameterNegotiator;
pub use registry::AdapterRegistry;
pub use session::{AdapterSession, OpenOutcome, SessionPhase};
pub use types::{
    AdapterDescriptor, AdapterState, AddressKind, AttributeValue, ConnectOptions,
    ConnectionParameters, Device, DeviceAddress, FlowControl, OpenOptions, OperationKind, Parity,
    ScanParameters,
};
