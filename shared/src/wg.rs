use std::{
    fs::OpenOptions,
    io,
    net::IpAddr,
    path::Path,
    time::{Duration, SystemTime},
};

use crate::{chmod, IoErrorContext, WrappedIoError};
use wireguard_control::{Key, KeyPair, PeerConfigBuilder, PeerInfo};

/// Load the server's WireGuard keypair from `path`, generating and persisting a fresh one under
/// restrictive permissions if it doesn't exist yet. Mirrors the load-or-generate idiom the
/// control plane also uses for the SSH broker's host key.
pub fn load_or_generate_keypair(path: &Path) -> Result<KeyPair, WrappedIoError> {
    if path.exists() {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        let private = Key::from_base64(raw.trim())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed WireGuard private key"))
            .with_path(path)?;
        let public = private.get_public();
        Ok(KeyPair { public, private })
    } else {
        let keypair = KeyPair::generate();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_path(path)?;
        chmod(&file, 0o600).with_path(path)?;
        std::fs::write(path, keypair.private.to_base64()).with_path(path)?;
        Ok(keypair)
    }
}

/// Build the allowed-ip list for a single-device peer: always exactly `[vpn_ip/32]`. Applying
/// this via `DeviceUpdate::add_peer` replaces whatever allowed-ips the peer previously had,
/// which is the upsert semantics an `add_peer` contract calls for.
pub fn device_peer_config(public_key: &Key, vpn_ip: IpAddr) -> PeerConfigBuilder {
    PeerConfigBuilder::new(public_key)
        .add_allowed_ip(vpn_ip, 32)
        .set_persistent_keepalive_interval(crate::PERSISTENT_KEEPALIVE_INTERVAL_SECS)
}

pub trait PeerInfoExt {
    /// WireGuard rejects any communication after REJECT_AFTER_TIME, so this is a reasonable
    /// heuristic for "currently connected" without relying on heavier probes like ICMP.
    fn is_recently_connected(&self) -> bool;
}

impl PeerInfoExt for PeerInfo {
    fn is_recently_connected(&self) -> bool {
        const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

        let last_handshake = self
            .stats
            .last_handshake_time
            .and_then(|t| t.elapsed().ok())
            .unwrap_or(Duration::MAX);

        last_handshake <= REJECT_AFTER_TIME
    }
}

pub fn handshake_time(peer: &PeerInfo) -> Option<SystemTime> {
    peer.stats.last_handshake_time
}
