pub mod nat;
pub mod takeover;

use crate::config::{MeshConfig, ServerConfig};
use crate::ServerError;
use meshd_shared::wg::{device_peer_config, handshake_time, load_or_generate_keypair};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::time::SystemTime;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, KeyPair};

/// Reconciles peer state on the kernel WireGuard interface named in configuration. The
/// database is the source of truth; this is the only component that touches the control
/// socket, and it's serialized behind a single mutex so `add_peer`/`remove_peer`/
/// `initialize_interface` are observed as a sequence.
pub struct WireGuardManager {
    interface: InterfaceName,
    backend: Backend,
    keypair: KeyPair,
    // wireguard-control's control-socket handle isn't `Sync`-friendly across calls without
    // external coordination; the mutex is the "single-writer" serialization point described
    // in the concurrency model, not a performance-sensitive critical section.
    lock: Mutex<()>,
}

impl WireGuardManager {
    pub fn new(server_config: &ServerConfig, mesh: &MeshConfig) -> Result<Self, ServerError> {
        let interface: InterfaceName = mesh
            .interface
            .parse()
            .map_err(|_| ServerError::Validation("invalid WG_INTERFACE name".into()))?;
        let keypair = load_or_generate_keypair(&server_config.wg_private_key_path())
            .map_err(|e| ServerError::Io(e.into()))?;
        Ok(Self { interface, backend: Backend::default(), keypair, lock: Mutex::new(()) })
    }

    pub fn public_key(&self) -> String {
        self.keypair.public.to_base64()
    }

    fn device(&self) -> Result<Device, ServerError> {
        Device::get(&self.interface, self.backend).map_err(|_| ServerError::WireGuard)
    }

    /// If the interface already exists, back it up, install NAT/FORWARD rules, then set
    /// our key and listen port without touching the existing peer set. If it doesn't exist,
    /// this deployment expects the interface to have been created out-of-band (e.g. by
    /// `wg-quick` or a provisioning script) — we never create interfaces ourselves.
    pub fn initialize_interface(&self, mesh: &MeshConfig) -> Result<(), ServerError> {
        let _guard = self.lock.lock();

        let existing = Device::get(&self.interface, self.backend);
        let device = match existing {
            Ok(device) => device,
            Err(_) => return Err(ServerError::Validation("WireGuard interface not configured".into())),
        };

        if !device.peers.is_empty() || takeover::config_file_exists(&device) {
            takeover::backup(&device)?;
        }

        nat::install(&self.interface, mesh.base_network)?;

        DeviceUpdate::new()
            .set_private_key(self.keypair.private.clone())
            .set_listen_port(listen_port(mesh))
            .apply(&self.interface, self.backend)
            .map_err(|_| ServerError::WireGuard)?;

        Ok(())
    }

    /// Upsert a peer with `AllowedIPs = [vpn_ip/32]`. Applying via `add_peer` (without
    /// `replace_peers`) replaces only this peer's allowed-ip list, leaving the rest of the
    /// peer set untouched.
    pub fn add_peer(&self, public_key: &str, vpn_ip: IpAddr) -> Result<(), ServerError> {
        let _guard = self.lock.lock();
        let key = Key::from_base64(public_key).map_err(|_| ServerError::WireGuard)?;
        let config = device_peer_config(&key, vpn_ip);
        DeviceUpdate::new().add_peer(config).apply(&self.interface, self.backend).map_err(|_| ServerError::WireGuard)
    }

    /// Remove a peer; absence is not an error.
    pub fn remove_peer(&self, public_key: &str) -> Result<(), ServerError> {
        let _guard = self.lock.lock();
        let key = match Key::from_base64(public_key) {
            Ok(key) => key,
            Err(_) => return Ok(()),
        };
        DeviceUpdate::new()
            .remove_peer_by_key(&key)
            .apply(&self.interface, self.backend)
            .map_err(|_| ServerError::WireGuard)
    }

    pub fn list_peers(&self) -> Result<Vec<Key>, ServerError> {
        Ok(self.device()?.peers.into_iter().map(|p| p.config.public_key).collect())
    }

    pub fn peer_handshake(&self, public_key: &str) -> Result<Option<SystemTime>, ServerError> {
        let key = Key::from_base64(public_key).map_err(|_| ServerError::WireGuard)?;
        let device = self.device()?;
        Ok(device.peers.iter().find(|p| p.config.public_key == key).and_then(handshake_time))
    }
}

fn listen_port(mesh: &MeshConfig) -> u16 {
    mesh.server_public_endpoint.resolve().ok().map(|addr| addr.port()).unwrap_or(51820)
}
