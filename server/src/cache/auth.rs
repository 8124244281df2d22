use crate::db::device::{Device, DeviceRepo};
use parking_lot::RwLock;
use rusqlite::Connection;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

const PORT_CACHE_TTL: Duration = Duration::from_secs(30);
const PORT_CACHE_CAP: usize = 1000;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const RATE_THRESHOLD: u32 = 10;
const MAX_BLOCK_MINUTES: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeError {
    RateLimited,
    UnknownSource,
    InactiveSource,
    InactiveTarget,
    TargetTunnelDisabled,
    CrossUser,
    TargetPortNotFound,
}

impl std::fmt::Display for AuthorizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthorizeError::RateLimited => "rate limited",
            AuthorizeError::UnknownSource => "unknown source device",
            AuthorizeError::InactiveSource => "inactive source device",
            AuthorizeError::InactiveTarget => "inactive target device",
            AuthorizeError::TargetTunnelDisabled => "target tunnel disabled",
            AuthorizeError::CrossUser => "cross-user access denied",
            AuthorizeError::TargetPortNotFound => "target port not found",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
struct CachedTarget {
    device: Device,
    expires_at: Instant,
}

#[derive(Clone)]
struct RateEntry {
    attempts: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Cross-user protection in front of the per-connection data-plane dispatch.
/// Two independently-locked tables: readers take shared
/// locks, writers exclusive, and neither lock is ever held across a database call.
#[derive(Default)]
pub struct AuthorizationCache {
    ports: RwLock<HashMap<u16, CachedTarget>>,
    rate: RwLock<HashMap<Uuid, RateEntry>>,
}

impl AuthorizationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `target_port` to its owning device for `source_device_id`, enforcing
    /// per-source rate limiting and per-user isolation. Authorization-cache failures are
    /// closed (deny) on database errors.
    pub fn authorize(&self, conn: &Connection, source_device_id: Uuid, target_port: u16) -> Result<Device, AuthorizeError> {
        if self.is_blocked(source_device_id) {
            return Err(AuthorizeError::RateLimited);
        }

        let source = match DeviceRepo::get(conn, source_device_id) {
            Ok(device) => device,
            Err(_) => {
                self.record_failure(source_device_id);
                return Err(AuthorizeError::UnknownSource);
            },
        };
        if !source.active {
            self.record_failure(source_device_id);
            return Err(AuthorizeError::InactiveSource);
        }

        let target = match self.lookup_target(conn, target_port) {
            Some(device) => device,
            None => {
                self.record_failure(source_device_id);
                return Err(AuthorizeError::TargetPortNotFound);
            },
        };
        if !target.active {
            self.record_failure(source_device_id);
            return Err(AuthorizeError::InactiveTarget);
        }
        if !target.tunnel_enabled {
            self.record_failure(source_device_id);
            return Err(AuthorizeError::TargetTunnelDisabled);
        }
        if target.user_id != source.user_id {
            self.record_failure(source_device_id);
            return Err(AuthorizeError::CrossUser);
        }

        self.clear(source_device_id);
        Ok(target)
    }

    fn lookup_target(&self, conn: &Connection, port: u16) -> Option<Device> {
        if let Some(cached) = self.ports.read().get(&port) {
            if cached.expires_at > Instant::now() {
                return Some(cached.device.clone());
            }
        }

        let mut stmt = conn
            .prepare_cached("SELECT id FROM devices WHERE tunnel_port = ?1")
            .ok()?;
        let id: Option<String> = stmt.query_row([port], |row| row.get(0)).ok();
        let device = id.and_then(|id| id.parse().ok()).and_then(|id| DeviceRepo::get(conn, id).ok())?;

        let mut ports = self.ports.write();
        if ports.len() >= PORT_CACHE_CAP {
            ports.clear();
        }
        ports.insert(port, CachedTarget { device: device.clone(), expires_at: Instant::now() + PORT_CACHE_TTL });
        Some(device)
    }

    fn is_blocked(&self, source_device_id: Uuid) -> bool {
        self.rate
            .read()
            .get(&source_device_id)
            .and_then(|entry| entry.blocked_until)
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }

    fn record_failure(&self, source_device_id: Uuid) {
        let now = Instant::now();
        let mut rate = self.rate.write();
        let entry = rate.entry(source_device_id).or_insert(RateEntry { attempts: 0, window_start: now, blocked_until: None });

        if now.duration_since(entry.window_start) > RATE_WINDOW {
            entry.attempts = 0;
            entry.window_start = now;
            entry.blocked_until = None;
        }

        entry.attempts += 1;
        if entry.attempts >= RATE_THRESHOLD {
            let minutes = (entry.attempts - RATE_THRESHOLD + 1).min(MAX_BLOCK_MINUTES as u32);
            entry.blocked_until = Some(now + Duration::from_secs(minutes as u64 * 60));
        }
    }

    fn clear(&self, source_device_id: Uuid) {
        self.rate.write().remove(&source_device_id);
    }

    /// Drop expired port entries and source entries past both their block and window.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.ports.write().retain(|_, cached| cached.expires_at > now);
        self.rate.write().retain(|_, entry| {
            let block_expired = entry.blocked_until.map(|until| until <= now).unwrap_or(true);
            let window_expired = now.duration_since(entry.window_start) > RATE_WINDOW;
            !(block_expired && window_expired)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::device::NewDevice;
    use crate::db::user::UserRepo;
    use ipnet::Ipv4Net;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", 1).unwrap();
        conn.execute_batch(crate::db::user::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(crate::db::device::CREATE_TABLE_SQL).unwrap();
        conn
    }

    fn make_device(
        conn: &Connection,
        user_email: &str,
        subnet: &str,
        name: &str,
        ip: &str,
        port: Option<u16>,
        tunnel_enabled: bool,
    ) -> Device {
        let subnet: Ipv4Net = subnet.parse().unwrap();
        let user = UserRepo::get_by_email(conn, user_email)
            .unwrap()
            .unwrap_or_else(|| UserRepo::create(conn, user_email, subnet, 5, None).unwrap());
        let device = DeviceRepo::create(
            conn,
            NewDevice {
                id: Uuid::new_v4(),
                user_id: user.id,
                name,
                wg_public_key: &format!("{:0<43}=", name),
                vpn_ip: ip.parse().unwrap(),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
            },
        )
        .unwrap();
        if let Some(port) = port {
            DeviceRepo::set_tunnel_port(conn, device.id, port).unwrap();
        }
        if tunnel_enabled {
            DeviceRepo::set_tunnel_enabled(conn, device.id, true).unwrap();
        }
        DeviceRepo::get(conn, device.id).unwrap()
    }

    #[test]
    fn same_user_authorized() {
        let conn = conn();
        let source = make_device(&conn, "a@example.com", "10.100.0.0/24", "phone", "10.100.0.2", None, false);
        let target = make_device(&conn, "a@example.com", "10.100.0.0/24", "laptop", "10.100.0.3", Some(10001), true);
        let cache = AuthorizationCache::new();
        let result = cache.authorize(&conn, source.id, 10001).unwrap();
        assert_eq!(result.id, target.id);
    }

    #[test]
    fn cross_user_denied() {
        let conn = conn();
        let source = make_device(&conn, "a@example.com", "10.100.0.0/24", "phone", "10.100.0.2", None, false);
        make_device(&conn, "b@example.com", "10.100.1.0/24", "laptop", "10.100.1.3", Some(10001), true);
        let cache = AuthorizationCache::new();
        assert_eq!(cache.authorize(&conn, source.id, 10001), Err(AuthorizeError::CrossUser));
    }

    #[test]
    fn rate_limit_blocks_after_threshold() {
        let conn = conn();
        let source = make_device(&conn, "a@example.com", "10.100.0.0/24", "phone", "10.100.0.2", None, false);
        let cache = AuthorizationCache::new();
        for _ in 0..RATE_THRESHOLD {
            assert_eq!(cache.authorize(&conn, source.id, 9999), Err(AuthorizeError::TargetPortNotFound));
        }
        assert_eq!(cache.authorize(&conn, source.id, 9999), Err(AuthorizeError::RateLimited));
    }
}
