use crate::ssh::dispatch::BoundListener;
use crate::ssh::BrokerState;
use async_trait::async_trait;
use meshd_shared::normalize_ssh_public_key;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use std::sync::Arc;
use uuid::Uuid;

/// One instance per SSH connection (`Server::new_client`). Per-session state — which device
/// authenticated, its allocated port, and the listener it's bound to — lives on the handler
/// rather than in any shared table, matching the per-connection state machine below.
pub struct ConnectionHandler {
    state: Arc<BrokerState>,
    device_id: Option<Uuid>,
    allocated_port: Option<u16>,
    bound: Option<BoundListener>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state, device_id: None, allocated_port: None, bound: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    Key(#[from] ssh_key::Error),
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = BrokerError;

    /// Opaque rejection on any failure: wrong/unknown key, inactive device, tunnelling
    /// disabled, or no allocated port yet.
    async fn auth_publickey(&mut self, _user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let raw = public_key.to_openssh()?;
        let normalized = match normalize_ssh_public_key(&raw) {
            Ok(key) => key,
            Err(_) => return Ok(Auth::Reject { proceed_with_methods: None }),
        };

        let device = {
            let conn = self.state.db.lock();
            crate::db::device::DeviceRepo::get_by_ssh_key(&conn, &normalized)
        };

        let device = match device {
            Ok(Some(device)) => device,
            _ => {
                log::warn!("SSH auth rejected: no device registered for presented key");
                return Ok(Auth::Reject { proceed_with_methods: None });
            },
        };

        if !device.active || !device.tunnel_enabled {
            log::warn!("SSH auth rejected for device {}: inactive or tunnelling disabled", device.id);
            return Ok(Auth::Reject { proceed_with_methods: None });
        }

        let Some(port) = device.tunnel_port else {
            log::warn!("SSH auth rejected for device {}: no allocated tunnel port", device.id);
            return Ok(Auth::Reject { proceed_with_methods: None });
        };

        log::info!("device {} authenticated to tunnel broker, port {}", device.id, port);
        self.device_id = Some(device.id);
        self.allocated_port = Some(port);
        Ok(Auth::Accept)
    }

    /// This broker never accepts channels the device opens — it only ever opens
    /// `forwarded-tcpip` channels toward the device.
    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn tcpip_forward(&mut self, _address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
        let (Some(device_id), Some(allocated_port)) = (self.device_id, self.allocated_port) else {
            return Ok(false);
        };

        if *port != allocated_port as u32 {
            log::warn!("device {device_id} requested tcpip-forward on port {port}, allocated port is {allocated_port}");
            return Ok(false);
        }
        if self.bound.is_some() {
            log::warn!("device {device_id} attempted a second tcpip-forward bind");
            return Ok(false);
        }

        match crate::ssh::dispatch::bind(self.state.clone(), device_id, allocated_port, session.handle()).await {
            Ok(listener) => {
                self.bound = Some(listener);
                Ok(true)
            },
            Err(e) => {
                log::error!("failed to bind tunnel listener for device {device_id} on port {allocated_port}: {e}");
                Ok(false)
            },
        }
    }

    async fn cancel_tcpip_forward(&mut self, _address: &str, _port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        if let Some(listener) = self.bound.take() {
            listener.stop();
        }
        Ok(true)
    }

    async fn channel_close(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if let Some(listener) = self.bound.take() {
            listener.stop();
        }
    }
}
