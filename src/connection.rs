//! Device connection operations on the selected adapter.
//!
//! `connect` is the interesting one: the driver call only starts the
//! attempt, and the outcome arrives later as an adapter event. The manager
//! subscribes to the event stream and to the cancel signal before issuing
//! the call, then races connected / timed-out / cancelled to a single
//! settlement. Dropping the subscriptions afterwards is what guarantees the
//! attempt settles exactly once.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::dispatch::{EventDispatcher, Notification};
use crate::driver::{AdapterEvent, AdapterLink};
use crate::error::{DriverError, Error, Result};
use crate::session::AdapterSession;
use crate::types::{ConnectOptions, Device, DeviceAddress, OperationKind};

/// How a connection attempt settled.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Connected(Device),
    TimedOut(DeviceAddress),
    Cancelled,
}

/// Connect, cancel, disconnect and pair against the selected adapter.
pub struct DeviceConnectionManager {
    session: Arc<AdapterSession>,
    dispatcher: Arc<EventDispatcher>,
    cancel_signal: broadcast::Sender<()>,
}

impl DeviceConnectionManager {
    pub fn new(session: Arc<AdapterSession>, dispatcher: Arc<EventDispatcher>) -> Self {
        let (cancel_signal, _) = broadcast::channel(16);
        Self {
            session,
            dispatcher,
            cancel_signal,
        }
    }

    /// Connect to `device` with default scan and connection parameters.
    pub async fn connect(&self, device: &Device) -> Result<ConnectOutcome> {
        self.connect_with_options(device, &ConnectOptions::default())
            .await
    }

    /// Connect to `device`, waiting until the attempt settles.
    ///
    /// Requires an open adapter. The settlement is whichever comes first:
    /// the driver reports the device connected, the driver reports the
    /// attempt timed out, or `cancel_connect` fires. Connected and
    /// timed-out notifications are emitted by the adapter event pump, not
    /// here.
    pub async fn connect_with_options(
        &self,
        device: &Device,
        options: &ConnectOptions,
    ) -> Result<ConnectOutcome> {
        let (descriptor, link) = self.session.require_open().await?;
        let _op = self.session.begin_operation(OperationKind::Connect)?;

        // Subscribe before the driver call so the outcome cannot slip by.
        let mut events = link.events();
        let mut cancelled = self.cancel_signal.subscribe();

        info!("connecting to {}", device.address);
        self.dispatcher
            .send(Notification::ConnectInitiated(device.clone()));

        if let Err(error) = link.connect(&device.address, options).await {
            warn!("connect to {} failed: {}", device.address, error);
            self.dispatcher.send(Notification::RecoverableError {
                adapter: Some(descriptor),
                error: error.clone(),
            });
            return Err(error.into());
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(AdapterEvent::DeviceConnected(connected))
                        if connected.address.value == device.address.value =>
                    {
                        return Ok(ConnectOutcome::Connected(connected));
                    }
                    Ok(AdapterEvent::ConnectTimedOut(address))
                        if address.value == device.address.value =>
                    {
                        return Ok(ConnectOutcome::TimedOut(address));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("connect listener lagged, {} events missed", missed);
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::Driver(DriverError::fatal(
                            "adapter event stream closed",
                        )));
                    }
                },
                _ = cancelled.recv() => {
                    info!("connect to {} cancelled", device.address);
                    return Ok(ConnectOutcome::Cancelled);
                }
            }
        }
    }

    /// Abort the in-flight connection attempt.
    ///
    /// Tells the driver to stop connecting and signals the pending
    /// `connect` call, which settles as `Cancelled`.
    pub async fn cancel_connect(&self) -> Result<()> {
        let (descriptor, link) = self.session.require_selected().await?;
        let _op = self.session.begin_operation(OperationKind::CancelConnect)?;

        self.dispatcher.send(Notification::CancelConnectInitiated);
        match link.cancel_connect().await {
            Ok(()) => {
                let _ = self.cancel_signal.send(());
                self.dispatcher.send(Notification::ConnectCancelled);
                Ok(())
            }
            Err(error) => {
                warn!("cancelling connect failed: {}", error);
                self.dispatcher.send(Notification::RecoverableError {
                    adapter: Some(descriptor),
                    error: error.clone(),
                });
                Err(error.into())
            }
        }
    }

    /// Disconnect a connected device.
    ///
    /// The device must carry the instance id it was given on connection.
    /// The disconnected notification comes from the adapter event pump once
    /// the driver reports the link gone.
    pub async fn disconnect(&self, device: &Device) -> Result<()> {
        let (descriptor, link) = self.session.require_selected().await?;
        let instance_id = device.instance_id.as_deref().ok_or(Error::NotConnected {
            address: device.address.clone(),
        })?;
        let _op = self.session.begin_operation(OperationKind::Disconnect)?;

        info!("disconnecting {}", device.address);
        if let Err(error) = link.disconnect(instance_id).await {
            warn!("disconnect of {} failed: {}", device.address, error);
            self.dispatcher.send(Notification::RecoverableError {
                adapter: Some(descriptor),
                error: error.clone(),
            });
            return Err(error.into());
        }
        Ok(())
    }

    /// Pair with a connected device, waiting for security to settle.
    ///
    /// Resolves once the driver reports the security association changed;
    /// an adapter error while waiting fails the pairing.
    pub async fn pair(&self, device: &Device) -> Result<()> {
        let (descriptor, link) = self.session.require_selected().await?;
        let instance_id = device.instance_id.as_deref().ok_or(Error::NotConnected {
            address: device.address.clone(),
        })?;
        let _op = self.session.begin_operation(OperationKind::Pair)?;

        let mut events = link.events();

        info!("pairing with {}", device.address);
        self.dispatcher
            .send(Notification::PairingInitiated(device.clone()));

        if let Err(error) = link.pair(instance_id, false).await {
            warn!("pairing with {} failed: {}", device.address, error);
            self.dispatcher.send(Notification::RecoverableError {
                adapter: Some(descriptor),
                error: error.clone(),
            });
            return Err(error.into());
        }

        loop {
            match events.recv().await {
                Ok(AdapterEvent::SecurityChanged(secured))
                    if secured.address.value == device.address.value =>
                {
                    info!("paired with {}", device.address);
                    return Ok(());
                }
                // The pump reports the error itself; here it just fails
                // the pairing.
                Ok(AdapterEvent::Error(error)) => return Err(error.into()),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("pairing listener lagged, {} events missed", missed);
                }
                Err(RecvError::Closed) => {
                    return Err(Error::Driver(DriverError::fatal(
                        "adapter event stream closed",
                    )));
                }
            }
        }
    }
}
