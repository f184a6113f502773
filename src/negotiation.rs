//! Connection parameter negotiation.
//!
//! When a peripheral asks for new connection parameters the request is
//! surfaced as a notification carrying an id. The UI answers through
//! `accept` or `reject`, and every answer is mirrored back as a status
//! notification keyed by the same id so the requesting dialog can settle.

use std::sync::Arc;

use tracing::{info, warn};

use crate::dispatch::{EventDispatcher, Notification, ParamUpdateStatus};
use crate::driver::AdapterLink;
use crate::error::{Error, Result};
use crate::session::AdapterSession;
use crate::types::{ConnectionParameters, Device, OperationKind};

/// Answers peripheral-initiated connection parameter requests.
pub struct ConnectionParameterNegotiator {
    session: Arc<AdapterSession>,
    dispatcher: Arc<EventDispatcher>,
}

impl ConnectionParameterNegotiator {
    pub fn new(session: Arc<AdapterSession>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            session,
            dispatcher,
        }
    }

    /// Accept the request identified by `id`, applying `parameters`.
    pub async fn accept(
        &self,
        id: u32,
        device: &Device,
        parameters: &ConnectionParameters,
    ) -> Result<()> {
        let (descriptor, link) = self.session.require_selected().await?;
        let instance_id = device.instance_id.as_deref().ok_or(Error::NotConnected {
            address: device.address.clone(),
        })?;
        let _op = self.session.begin_operation(OperationKind::ParamUpdate)?;

        match link
            .update_connection_parameters(instance_id, parameters)
            .await
        {
            Ok(()) => {
                info!("connection parameters updated for {}", device.address);
                self.dispatcher.send(Notification::ConnParamUpdateStatus {
                    id,
                    device: device.clone(),
                    status: ParamUpdateStatus::Success,
                });
                Ok(())
            }
            Err(error) => {
                warn!(
                    "connection parameter update for {} failed: {}",
                    device.address, error
                );
                self.dispatcher.send(Notification::ConnParamUpdateStatus {
                    id,
                    device: device.clone(),
                    status: ParamUpdateStatus::Error,
                });
                self.dispatcher.send(Notification::RecoverableError {
                    adapter: Some(descriptor),
                    error: error.clone(),
                });
                Err(error.into())
            }
        }
    }

    /// Reject the request identified by `id`.
    pub async fn reject(&self, id: u32, device: &Device) -> Result<()> {
        let (descriptor, link) = self.session.require_selected().await?;
        let instance_id = device.instance_id.as_deref().ok_or(Error::NotConnected {
            address: device.address.clone(),
        })?;
        let _op = self.session.begin_operation(OperationKind::ParamReject)?;

        match link.reject_conn_params(instance_id).await {
            Ok(()) => {
                info!("connection parameter request from {} rejected", device.address);
                self.dispatcher.send(Notification::ConnParamUpdateStatus {
                    id,
                    device: device.clone(),
                    status: ParamUpdateStatus::Rejected,
                });
                Ok(())
            }
            Err(error) => {
                warn!(
                    "rejecting connection parameters for {} failed: {}",
                    device.address, error
                );
                self.dispatcher.send(Notification::ConnParamUpdateStatus {
                    id,
                    device: device.clone(),
                    status: ParamUpdateStatus::Error,
                });
                self.dispatcher.send(Notification::RecoverableError {
                    adapter: Some(descriptor),
                    error: error.clone(),
                });
                Err(error.into())
            }
        }
    }
}
