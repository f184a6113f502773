//! Selected-adapter lifecycle.
//!
//! The session owns the single "selected" adapter and its open/close state
//! machine:
//!
//! ```text
//!   Closed -> Opening -> Open -> Closing -> Closed
//!                 \         \
//!                  +-> Error <+   (fatal driver errors)
//! ```
//!
//! Opening a second adapter displaces the first: the previous adapter is
//! closed best-effort before the new one is touched, and a close failure is
//! reported but never blocks the new open. The session is also where the
//! per-adapter event stream is turned into notifications; the pump task
//! subscribes before the driver open is issued so no event can be lost.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{EventDispatcher, Notification};
use crate::driver::{AdapterEvent, AdapterLink};
use crate::error::{DriverError, Error, Result};
use crate::registry::AdapterRegistry;
use crate::types::{AdapterDescriptor, AdapterState, Device, OpenOptions, OperationKind};

/// Lifecycle phase of the selected adapter.
///
/// `Error` is terminal for that adapter instance; selecting another adapter
/// afterwards is the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Closed,
    Opening,
    Open,
    Closing,
    Error,
}

/// Result of a successful `open`, including what happened to the adapter it
/// displaced.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    pub adapter: AdapterDescriptor,
    pub state: AdapterState,
    /// Close failure of the previously selected adapter, if there was one
    /// and closing it failed.
    pub displaced_close_error: Option<DriverError>,
}

struct SelectedAdapter {
    descriptor: AdapterDescriptor,
    link: Arc<dyn AdapterLink>,
    phase: SessionPhase,
    pump: JoinHandle<()>,
}

struct SessionShared {
    selected: Mutex<Option<SelectedAdapter>>,
}

/// Tracks which operation kinds are currently in flight.
///
/// Only one adapter is ever selected, so keying by kind alone enforces the
/// at-most-one-per-adapter rule and additionally serializes competing opens.
#[derive(Default)]
struct PendingOperations {
    in_flight: StdMutex<HashSet<OperationKind>>,
}

impl PendingOperations {
    fn begin(self: &Arc<Self>, kind: OperationKind) -> Result<OperationGuard> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(kind) {
            return Err(Error::OperationInFlight { kind });
        }
        Ok(OperationGuard {
            pending: Arc::clone(self),
            kind,
        })
    }
}

/// Releases the in-flight slot on every exit path.
pub(crate) struct OperationGuard {
    pending: Arc<PendingOperations>,
    kind: OperationKind,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.pending
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.kind);
    }
}

/// Owns the lifecycle of the currently selected adapter.
pub struct AdapterSession {
    registry: Arc<AdapterRegistry>,
    dispatcher: Arc<EventDispatcher>,
    discovery_requests: mpsc::UnboundedSender<Device>,
    shared: Arc<SessionShared>,
    pending: Arc<PendingOperations>,
}

impl AdapterSession {
    /// Create a session.
    ///
    /// `discovery_requests` is the one-way channel towards the service
    /// discovery collaborator; every device that connects while the adapter
    /// is open is pushed into it.
    pub fn new(
        registry: Arc<AdapterRegistry>,
        dispatcher: Arc<EventDispatcher>,
        discovery_requests: mpsc::UnboundedSender<Device>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            discovery_requests,
            shared: Arc::new(SessionShared {
                selected: Mutex::new(None),
            }),
            pending: Arc::new(PendingOperations::default()),
        }
    }

    /// Select and open the adapter on `port`.
    ///
    /// Any previously selected adapter is displaced first; if it was open,
    /// it is closed best-effort and a failure shows up both as a
    /// notification and in the returned outcome. The port must be known to
    /// the registry, otherwise the call fails without touching the driver.
    pub async fn open(&self, port: &str, options: &OpenOptions) -> Result<OpenOutcome> {
        let _op = self.pending.begin(OperationKind::Open)?;

        let displaced_close_error = match self.take_selected().await {
            Some(previous) => self.displace(previous).await,
            None => None,
        };

        let link = self
            .registry
            .find_by_port(port)
            .await
            .ok_or_else(|| Error::AdapterNotFound {
                port: port.to_string(),
            })?;
        let descriptor = link.descriptor();
        info!("opening adapter {}", descriptor.port);

        // Subscribe and start relaying events before open is issued.
        let pump = tokio::spawn(pump_adapter_events(
            link.events(),
            descriptor.clone(),
            Arc::downgrade(&link),
            Arc::clone(&self.shared),
            Arc::clone(&self.dispatcher),
            self.discovery_requests.clone(),
        ));
        {
            let mut selected = self.shared.selected.lock().await;
            *selected = Some(SelectedAdapter {
                descriptor: descriptor.clone(),
                link: Arc::clone(&link),
                phase: SessionPhase::Opening,
                pump,
            });
        }

        self.dispatcher
            .send(Notification::AdapterOpenInitiated(descriptor.clone()));

        if let Err(error) = link.open(options).await {
            self.fail(&link, &descriptor, error.clone()).await;
            return Err(error.into());
        }

        let state = match link.get_state().await {
            Ok(state) => state,
            Err(error) => {
                self.fail(&link, &descriptor, error.clone()).await;
                return Err(error.into());
            }
        };

        self.set_phase(&link, SessionPhase::Open).await;
        info!("adapter {} opened", descriptor.port);
        self.dispatcher.send(Notification::AdapterOpened {
            adapter: descriptor.clone(),
            state: state.clone(),
        });

        Ok(OpenOutcome {
            adapter: descriptor,
            state,
            displaced_close_error,
        })
    }

    /// Close the selected adapter.
    ///
    /// On success the adapter stays selected in the `Closed` phase. On
    /// failure the phase is left where it was so the caller may retry; the
    /// failure is reported as an adapter-scoped error.
    pub async fn close(&self) -> Result<()> {
        let (descriptor, link) = self.require_selected().await?;
        let _op = self.pending.begin(OperationKind::Close)?;

        let previous_phase = self.set_phase(&link, SessionPhase::Closing).await;

        match link.close().await {
            Ok(()) => {
                let mut selected = self.shared.selected.lock().await;
                if let Some(current) = selected.as_mut() {
                    // A replug may have swapped in a different link for the
                    // same port while the close call was in flight.
                    if Arc::ptr_eq(&current.link, &link) {
                        current.phase = SessionPhase::Closed;
                        current.pump.abort();
                    }
                }
                drop(selected);
                info!("adapter {} closed", descriptor.port);
                self.dispatcher.send(Notification::AdapterClosed(descriptor));
                Ok(())
            }
            Err(error) => {
                if let Some(phase) = previous_phase {
                    self.set_phase(&link, phase).await;
                }
                warn!("closing adapter {} failed: {}", descriptor.port, error);
                self.dispatcher.send(Notification::AdapterError {
                    adapter: descriptor,
                    error: error.clone(),
                });
                Err(error.into())
            }
        }
    }

    /// Phase of the selected adapter, `Closed` when none is selected.
    pub async fn phase(&self) -> SessionPhase {
        let selected = self.shared.selected.lock().await;
        selected
            .as_ref()
            .map(|current| current.phase)
            .unwrap_or(SessionPhase::Closed)
    }

    /// Descriptor of the selected adapter, if any.
    pub async fn selected_adapter(&self) -> Option<AdapterDescriptor> {
        let selected = self.shared.selected.lock().await;
        selected.as_ref().map(|current| current.descriptor.clone())
    }

    /// Resolve the selected adapter for an operation, whatever its phase.
    pub(crate) async fn require_selected(&self) -> Result<(AdapterDescriptor, Arc<dyn AdapterLink>)> {
        let selected = self.shared.selected.lock().await;
        selected
            .as_ref()
            .map(|current| (current.descriptor.clone(), Arc::clone(&current.link)))
            .ok_or(Error::NoAdapterSelected)
    }

    /// Resolve the selected adapter, requiring it to be open.
    pub(crate) async fn require_open(&self) -> Result<(AdapterDescriptor, Arc<dyn AdapterLink>)> {
        let selected = self.shared.selected.lock().await;
        match selected.as_ref() {
            Some(current) if current.phase == SessionPhase::Open => {
                Ok((current.descriptor.clone(), Arc::clone(&current.link)))
            }
            _ => Err(Error::NoAdapterSelected),
        }
    }

    /// Claim the in-flight slot for `kind`.
    pub(crate) fn begin_operation(&self, kind: OperationKind) -> Result<OperationGuard> {
        self.pending.begin(kind)
    }

    async fn take_selected(&self) -> Option<SelectedAdapter> {
        self.shared.selected.lock().await.take()
    }

    /// Tear down a displaced adapter. Only an open adapter gets a driver
    /// close; anything else is just dropped.
    async fn displace(&self, previous: SelectedAdapter) -> Option<DriverError> {
        let mut close_error = None;
        if previous.phase == SessionPhase::Open {
            debug!("closing displaced adapter {}", previous.descriptor.port);
            match previous.link.close().await {
                Ok(()) => {
                    self.dispatcher
                        .send(Notification::AdapterClosed(previous.descriptor.clone()));
                }
                Err(error) => {
                    warn!(
                        "closing displaced adapter {} failed: {}",
                        previous.descriptor.port, error
                    );
                    self.dispatcher.send(Notification::AdapterError {
                        adapter: previous.descriptor.clone(),
                        error: error.clone(),
                    });
                    close_error = Some(error);
                }
            }
        }
        previous.pump.abort();
        close_error
    }

    /// Move the selected adapter into `Error` and report the failure.
    async fn fail(
        &self,
        link: &Arc<dyn AdapterLink>,
        descriptor: &AdapterDescriptor,
        error: DriverError,
    ) {
        self.set_phase(link, SessionPhase::Error).await;
        warn!("adapter {} failed: {}", descriptor.port, error);
        self.dispatcher.send(Notification::AdapterError {
            adapter: descriptor.clone(),
            error,
        });
    }

    /// Set the phase if `link` is still the selected adapter; returns the
    /// previous phase when it was.
    async fn set_phase(
        &self,
        link: &Arc<dyn AdapterLink>,
        phase: SessionPhase,
    ) -> Option<SessionPhase> {
        let mut selected = self.shared.selected.lock().await;
        match selected.as_mut() {
            Some(current) if Arc::ptr_eq(&current.link, link) => {
                let previous = current.phase;
                current.phase = phase;
                Some(previous)
            }
            _ => None,
        }
    }
}

/// Relay one adapter's events into notifications until the stream closes or
/// the pump is aborted.
async fn pump_adapter_events(
    mut events: broadcast::Receiver<AdapterEvent>,
    adapter: AdapterDescriptor,
    link: Weak<dyn AdapterLink>,
    shared: Arc<SessionShared>,
    dispatcher: Arc<EventDispatcher>,
    discovery_requests: mpsc::UnboundedSender<Device>,
) {
    loop {
        match events.recv().await {
            Ok(AdapterEvent::Error(error)) => {
                if error.fatal {
                    let live = link.upgrade();
                    let mut selected = shared.selected.lock().await;
                    if let (Some(current), Some(live)) = (selected.as_mut(), live) {
                        if Arc::ptr_eq(&current.link, &live) {
                            current.phase = SessionPhase::Error;
                        }
                    }
                }
                warn!("adapter {} reported error: {}", adapter.port, error);
                dispatcher.send(Notification::AdapterError {
                    adapter: adapter.clone(),
                    error,
                });
            }
            Ok(AdapterEvent::StateChanged(state)) => {
                dispatcher.send(Notification::AdapterStateChanged {
                    adapter: adapter.clone(),
                    state,
                });
            }
            Ok(AdapterEvent::DeviceConnected(device)) => {
                info!("device connected: {}", device.address);
                dispatcher.send(Notification::DeviceConnected(device.clone()));
                // Kick service discovery; the collaborator owns the rest.
                let _ = discovery_requests.send(device);
            }
            Ok(AdapterEvent::DeviceDisconnected(device)) => {
                info!("device disconnected: {}", device.address);
                dispatcher.send(Notification::DeviceDisconnected(device));
            }
            Ok(AdapterEvent::ConnectTimedOut(address)) => {
                info!("connect attempt to {} timed out", address);
                dispatcher.send(Notification::ConnectTimedOut(address));
            }
            Ok(AdapterEvent::ConnParamUpdateRequest { device, parameters }) => {
                dispatcher.send(Notification::ConnParamUpdateRequest { device, parameters });
            }
            Ok(AdapterEvent::CharacteristicValueChanged(attribute))
            | Ok(AdapterEvent::DescriptorValueChanged(attribute)) => {
                dispatcher.send(Notification::AttributeValueChanged(attribute));
            }
            Ok(AdapterEvent::SecurityChanged(_)) => {
                // Consumed by the pairing operation, nothing to relay.
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(
                    "event stream for {} lagged, {} events missed",
                    adapter.port, missed
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
}
