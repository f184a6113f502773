//! Adapter discovery bookkeeping.
//!
//! The registry mirrors the driver's view of attached adapters. It performs
//! one initial enumeration and then follows added/removed events; it never
//! opens or owns an adapter itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::dispatch::{EventDispatcher, Notification};
use crate::driver::{AdapterLink, BleDriver, DiscoveryEvent};
use crate::error::Result;
use crate::types::AdapterDescriptor;

type AdapterMap = Arc<Mutex<HashMap<String, Arc<dyn AdapterLink>>>>;

/// Tracks the adapters the driver currently knows about.
pub struct AdapterRegistry {
    driver: Arc<dyn BleDriver>,
    dispatcher: Arc<EventDispatcher>,
    adapters: AdapterMap,
    started: AtomicBool,
}

impl AdapterRegistry {
    pub fn new(driver: Arc<dyn BleDriver>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            driver,
            dispatcher,
            adapters: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
        }
    }

    /// Subscribe to discovery events and enumerate the attached adapters.
    ///
    /// The subscription is installed once per registry lifetime; repeated
    /// calls are no-ops. The subscription is installed before the
    /// enumeration so adapters appearing mid-enumeration are not lost. An
    /// enumeration failure is reported as a recoverable error and does not
    /// stop the registry from following later discovery events.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("adapter registry already started");
            return Ok(());
        }

        let events = self.driver.discovery_events();
        tokio::spawn(pump_discovery_events(
            events,
            Arc::clone(&self.adapters),
            Arc::clone(&self.dispatcher),
        ));

        match self.driver.enumerate().await {
            Ok(links) => {
                let mut adapters = self.adapters.lock().await;
                for link in links {
                    let descriptor = link.descriptor();
                    debug!("adapter enumerated: {}", descriptor.port);
                    adapters.insert(descriptor.port.clone(), link);
                    self.dispatcher.send(Notification::AdapterAdded(descriptor));
                }
                Ok(())
            }
            Err(error) => {
                warn!("initial adapter enumeration failed: {}", error);
                self.dispatcher.send(Notification::RecoverableError {
                    adapter: None,
                    error: error.clone(),
                });
                Err(error.into())
            }
        }
    }

    /// Snapshot of the known adapters, not a live view.
    pub async fn list_adapters(&self) -> Vec<AdapterDescriptor> {
        let adapters = self.adapters.lock().await;
        adapters.values().map(|link| link.descriptor()).collect()
    }

    /// Look up an adapter by its port identifier.
    pub async fn find_by_port(&self, port: &str) -> Option<Arc<dyn AdapterLink>> {
        let adapters = self.adapters.lock().await;
        adapters.get(port).cloned()
    }
}

async fn pump_discovery_events(
    mut events: broadcast::Receiver<DiscoveryEvent>,
    adapters: AdapterMap,
    dispatcher: Arc<EventDispatcher>,
) {
    loop {
        match events.recv().await {
            Ok(DiscoveryEvent::Added(link)) => {
                let descriptor = link.descriptor();
                info!("adapter added: {}", descriptor.port);
                adapters.lock().await.insert(descriptor.port.clone(), link);
                dispatcher.send(Notification::AdapterAdded(descriptor));
            }
            Ok(DiscoveryEvent::Removed(descriptor)) => {
                info!("adapter removed: {}", descriptor.port);
                adapters.lock().await.remove(&descriptor.port);
                dispatcher.send(Notification::AdapterRemoved(descriptor));
            }
            Ok(DiscoveryEvent::Error(error)) => {
                warn!("adapter discovery error: {}", error);
                dispatcher.send(Notification::RecoverableError {
                    adapter: None,
                    error,
                });
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("discovery event stream lagged, {} events missed", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
