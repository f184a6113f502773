//! Value types shared across the orchestration layer.
//!
//! Adapters and devices are driver-owned; the types here only describe them.
//! Parameter structs default to the values the application has always used,
//! so callers normally reach for `Default` and override nothing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one BLE controller exposed by the driver.
///
/// The port is the stable identifier used to select an adapter; the serial
/// number is informational and may be absent for virtual adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterDescriptor {
    pub port: String,
    pub serial_number: Option<String>,
}

impl AdapterDescriptor {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            serial_number: None,
        }
    }

    pub fn with_serial_number(port: impl Into<String>, serial_number: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            serial_number: Some(serial_number.into()),
        }
    }
}

/// Driver-reported adapter status, refreshed on demand via `get_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterState {
    pub port: String,
    pub serial_number: Option<String>,
    pub available: bool,
    pub address: Option<String>,
    pub name: Option<String>,
    pub firmware_version: Option<String>,
}

/// BLE address kind passed to the driver on connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Public,
    #[default]
    RandomStatic,
}

/// A peer address together with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub value: String,
    pub kind: AddressKind,
}

impl DeviceAddress {
    pub fn new(value: impl Into<String>, kind: AddressKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }

    /// The default address kind for peers this application talks to.
    pub fn random_static(value: impl Into<String>) -> Self {
        Self::new(value, AddressKind::RandomStatic)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// A remote BLE peer.
///
/// The instance id is assigned by the driver once a connection exists and is
/// only valid while the device stays connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub instance_id: Option<String>,
}

impl Device {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            name: None,
            instance_id: None,
        }
    }
}

/// An attribute (characteristic or descriptor) value reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValue {
    pub instance_id: String,
    pub value: Vec<u8>,
}

/// Link-layer timing parameters for an active connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    #[serde(default = "default_conn_interval")]
    pub min_conn_interval_ms: f64,
    #[serde(default = "default_conn_interval")]
    pub max_conn_interval_ms: f64,
    #[serde(default)]
    pub slave_latency: u16,
    #[serde(default = "default_sup_timeout")]
    pub conn_sup_timeout_ms: u32,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            min_conn_interval_ms: default_conn_interval(),
            max_conn_interval_ms: default_conn_interval(),
            slave_latency: 0,
            conn_sup_timeout_ms: default_sup_timeout(),
        }
    }
}

fn default_conn_interval() -> f64 {
    7.5
}
fn default_sup_timeout() -> u32 {
    4000
}

/// Scan window used while a connect request is outstanding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_scan_interval")]
    pub interval_ms: f64,
    #[serde(default = "default_scan_window")]
    pub window_ms: f64,
    #[serde(default = "default_scan_timeout")]
    pub timeout_s: u32,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            active: default_true(),
            interval_ms: default_scan_interval(),
            window_ms: default_scan_window(),
            timeout_s: default_scan_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_scan_interval() -> f64 {
    100.0
}
fn default_scan_window() -> f64 {
    50.0
}
fn default_scan_timeout() -> u32 {
    20
}

/// Options handed to the driver's connect call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default)]
    pub scan: ScanParameters,
    #[serde(default)]
    pub connection: ConnectionParameters,
}

/// UART parity for the serial transport behind an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// UART flow control for the serial transport behind an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

/// Options passed through to the driver when opening an adapter.
///
/// These are opaque to the orchestration layer; the driver interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOptions {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
    #[serde(default = "default_event_interval")]
    pub event_interval_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            parity: Parity::default(),
            flow_control: FlowControl::default(),
            event_interval_ms: default_event_interval(),
            log_level: default_log_level(),
        }
    }
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_event_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The kinds of asynchronous operations tracked while in flight.
///
/// At most one operation of each kind may be pending at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Open,
    Close,
    Connect,
    CancelConnect,
    Disconnect,
    Pair,
    ParamUpdate,
    ParamReject,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Open => "open",
            OperationKind::Close => "close",
            OperationKind::Connect => "connect",
            OperationKind::CancelConnect => "cancel-connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::Pair => "pair",
            OperationKind::ParamUpdate => "connection parameter update",
            OperationKind::ParamReject => "connection parameter reject",
        };
        f.write_str(name)
    }
}
