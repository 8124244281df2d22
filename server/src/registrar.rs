use crate::db::device::{Device, DeviceRepo, NewDevice};
use crate::db::user::User;
use crate::pool::address::next_ip;
use crate::ServerError;
use meshd_shared::validate_wg_public_key;
use rusqlite::Connection;
use uuid::Uuid;

/// Max attempts before a VPN-IP uniqueness race is escalated to the caller: registration is
/// never serialized with an in-process lock, so a losing insert just recomputes the candidate
/// and retries.
const MAX_INSERT_ATTEMPTS: usize = 3;

pub struct RegisterRequest<'a> {
    pub user: &'a User,
    pub name: &'a str,
    pub wg_public_key: &'a str,
    pub username: Option<&'a str>,
    pub os: Option<&'a str>,
    pub hardware_id: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub proposed_device_id: Option<Uuid>,
}

pub struct RegisterOutcome {
    pub device: Device,
    pub replaced: bool,
    /// Set when a prior row for the same `(user, name)` was deleted so the caller can remove
    /// the stale WireGuard peer for its public key.
    pub replaced_public_key: Option<String>,
}

pub struct Registrar;

impl Registrar {
    /// Implements the device registration decision table. Validates name shape
    /// and WireGuard key shape before touching the store.
    pub fn register(conn: &Connection, req: RegisterRequest) -> Result<RegisterOutcome, ServerError> {
        if req.name.trim().is_empty() {
            return Err(ServerError::Validation("device name must not be empty".into()));
        }
        validate_wg_public_key(req.wg_public_key)
            .map_err(|e| ServerError::Validation(e.to_string()))?;

        // Step 1: same (user, name), same key -> idempotent no-op.
        if let Some(existing) = DeviceRepo::get_by_user_and_name(conn, req.user.id, req.name)? {
            if existing.wg_public_key == req.wg_public_key {
                return Ok(RegisterOutcome { device: existing, replaced: false, replaced_public_key: None });
            }
        }

        // Step 2: same (user, hardware_id), same key -> idempotent no-op.
        if let Some(hardware_id) = req.hardware_id {
            if let Some(existing) = DeviceRepo::get_by_user_and_hardware_id(conn, req.user.id, hardware_id)? {
                if existing.wg_public_key == req.wg_public_key {
                    return Ok(RegisterOutcome { device: existing, replaced: false, replaced_public_key: None });
                }
            }
        }

        // Step 3: same (user, name), different key -> the old row is replaced.
        let replacing = DeviceRepo::get_by_user_and_name(conn, req.user.id, req.name)?;

        // Step 4: the new key must not belong to a different, non-replaced row.
        if let Some(owner) = DeviceRepo::get_by_public_key(conn, req.wg_public_key)? {
            let is_the_row_being_replaced = replacing.as_ref().map(|r| r.id) == Some(owner.id);
            if !is_the_row_being_replaced {
                return Err(ServerError::Conflict("WireGuard key already registered to another device".into()));
            }
        }

        // Step 5: device cap, excluding the row being replaced.
        let excluding = replacing.as_ref().map(|r| r.id);
        let active_count = DeviceRepo::count_active_excluding(conn, req.user.id, excluding)?;
        if active_count >= req.user.device_cap {
            return Err(ServerError::Exhausted("device cap reached for this user"));
        }

        let replaced_public_key = replacing.as_ref().map(|r| r.wg_public_key.clone());

        for attempt in 0..MAX_INSERT_ATTEMPTS {
            // Step 6: reuse the replaced device's IP, else the smallest free host address.
            let vpn_ip = match &replacing {
                Some(old) => old.vpn_ip,
                None => {
                    let used = DeviceRepo::list_used_ips(conn, req.user.id)?;
                    next_ip(req.user.subnet, &used)
                        .ok_or(ServerError::Exhausted("no free VPN address in user subnet"))?
                },
            };

            if let Some(old) = &replacing {
                DeviceRepo::delete(conn, old.id)?;
            }

            // Step 7: insert, preferring the caller-proposed id.
            let id = req.proposed_device_id.unwrap_or_else(Uuid::new_v4);
            let insert_result = DeviceRepo::create(
                conn,
                NewDevice {
                    id,
                    user_id: req.user.id,
                    name: req.name,
                    wg_public_key: req.wg_public_key,
                    vpn_ip,
                    username: req.username,
                    os: req.os,
                    hardware_id: req.hardware_id,
                    display_name: req.display_name,
                },
            );

            match insert_result {
                Ok(device) => {
                    return Ok(RegisterOutcome {
                        device,
                        replaced: replacing.is_some(),
                        replaced_public_key,
                    });
                },
                Err(ServerError::Database(rusqlite::Error::SqliteFailure(e, _)))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation && attempt + 1 < MAX_INSERT_ATTEMPTS =>
                {
                    continue;
                },
                Err(e) => return Err(e),
            }
        }

        Err(ServerError::Exhausted("could not allocate a VPN address after repeated retries"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::user::UserRepo;
    use ipnet::Ipv4Net;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", 1).unwrap();
        conn.execute_batch(crate::db::user::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(crate::db::device::CREATE_TABLE_SQL).unwrap();
        conn
    }

    fn make_user(conn: &Connection) -> User {
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        UserRepo::create(conn, "a@example.com", subnet, 5, None).unwrap()
    }

    /// Valid 44-character WireGuard base64 public keys (32 decoded bytes each), for exercising
    /// the registrar without a real keypair.
    fn key(seed: u8) -> String {
        const KEYS: &[&str] = &[
            "ANdyXQOHEWDpS6xC9F8lkx9e9Le5LYxza55V1vIgAKg=",
            "Abx+ak90AIkL/6o0z8FetMUrWU/gnFM4W+BeQHlHbek=",
            "ApUo4MwZ3QkjBF+b6VJ5owAjtWiy6G3IBKYdMAw5640=",
        ];
        KEYS[seed as usize % KEYS.len()].to_string()
    }

    #[test]
    fn first_registration_allocates_smallest_ip() {
        let conn = conn();
        let user = make_user(&conn);
        let outcome = Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "laptop",
                wg_public_key: &key(1),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        )
        .unwrap();
        assert_eq!(outcome.device.vpn_ip.to_string(), "10.100.0.2");
        assert!(!outcome.replaced);
    }

    #[test]
    fn same_name_same_key_is_idempotent() {
        let conn = conn();
        let user = make_user(&conn);
        let first = Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "laptop",
                wg_public_key: &key(1),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        )
        .unwrap();
        let second = Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "laptop",
                wg_public_key: &key(1),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        )
        .unwrap();
        assert_eq!(first.device.id, second.device.id);
        assert_eq!(first.device.vpn_ip, second.device.vpn_ip);
        assert!(!second.replaced);
    }

    #[test]
    fn changed_key_replaces_and_preserves_ip() {
        let conn = conn();
        let user = make_user(&conn);
        let first = Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "laptop",
                wg_public_key: &key(1),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        )
        .unwrap();

        let second = Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "laptop",
                wg_public_key: &key(2),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        )
        .unwrap();

        assert!(second.replaced);
        assert_eq!(second.replaced_public_key.as_deref(), Some(key(1).as_str()));
        assert_eq!(second.device.vpn_ip, first.device.vpn_ip);
        assert!(DeviceRepo::get_by_public_key(&conn, &key(1)).unwrap().is_none());
    }

    #[test]
    fn duplicate_key_on_different_device_rejected() {
        let conn = conn();
        let user = make_user(&conn);
        Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "laptop",
                wg_public_key: &key(1),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        )
        .unwrap();

        let result = Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "phone",
                wg_public_key: &key(1),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        );
        assert!(matches!(result, Err(ServerError::Conflict(_))));
    }

    #[test]
    fn device_cap_enforced() {
        let conn = conn();
        let mut user = make_user(&conn);
        user.device_cap = 1;
        Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "laptop",
                wg_public_key: &key(1),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        )
        .unwrap();

        let result = Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: "phone",
                wg_public_key: &key(2),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
                proposed_device_id: None,
            },
        );
        assert!(matches!(result, Err(ServerError::Exhausted(_))));
    }
}
