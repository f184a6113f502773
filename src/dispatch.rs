//! Notification fan-out.
//!
//! Every observable condition in the orchestration layer becomes exactly one
//! [`Notification`] pushed through the [`EventDispatcher`]. Observers
//! subscribe independently; nothing here carries business logic.

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::DriverError;
use crate::types::{
    AdapterDescriptor, AdapterState, AttributeValue, ConnectionParameters, Device, DeviceAddress,
};

/// Outcome of a connection parameter accept/reject, keyed by request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamUpdateStatus {
    Success,
    Error,
    Rejected,
}

/// Typed notifications emitted towards the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    AdapterAdded(AdapterDescriptor),
    AdapterRemoved(AdapterDescriptor),
    /// An open was handed to the driver; the outcome follows separately.
    AdapterOpenInitiated(AdapterDescriptor),
    AdapterOpened {
        adapter: AdapterDescriptor,
        state: AdapterState,
    },
    AdapterClosed(AdapterDescriptor),
    AdapterStateChanged {
        adapter: AdapterDescriptor,
        state: AdapterState,
    },
    /// An adapter-scoped driver failure.
    AdapterError {
        adapter: AdapterDescriptor,
        error: DriverError,
    },
    ConnectInitiated(Device),
    DeviceConnected(Device),
    ConnectTimedOut(DeviceAddress),
    DeviceDisconnected(Device),
    CancelConnectInitiated,
    ConnectCancelled,
    PairingInitiated(Device),
    /// The peer asked for new connection parameters; the application decides.
    ConnParamUpdateRequest {
        device: Device,
        parameters: ConnectionParameters,
    },
    ConnParamUpdateStatus {
        id: u32,
        device: Device,
        status: ParamUpdateStatus,
    },
    AttributeValueChanged(AttributeValue),
    /// A failure that is reported but never fatal to the layer.
    RecoverableError {
        adapter: Option<AdapterDescriptor>,
        error: DriverError,
    },
}

/// Broadcast sink for [`Notification`]s.
///
/// Sending never blocks and never fails; notifications sent while nobody is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<Notification>,
}

impl EventDispatcher {
    /// Create a dispatcher retaining up to `capacity` undelivered
    /// notifications per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn send(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            trace!("notification dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_notifications() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();

        dispatcher.send(Notification::CancelConnectInitiated);
        dispatcher.send(Notification::ConnectCancelled);

        assert_eq!(rx.recv().await.unwrap(), Notification::CancelConnectInitiated);
        assert_eq!(rx.recv().await.unwrap(), Notification::ConnectCancelled);
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_silent() {
        let dispatcher = EventDispatcher::new(16);
        dispatcher.send(Notification::ConnectCancelled);
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_notification() {
        let dispatcher = EventDispatcher::new(16);
        let mut first = dispatcher.subscribe();
        let mut second = dispatcher.subscribe();

        dispatcher.send(Notification::CancelConnectInitiated);

        assert_eq!(first.recv().await.unwrap(), Notification::CancelConnectInitiated);
        assert_eq!(second.recv().await.unwrap(), Notification::CancelConnectInitiated);
    }
}
