use super::unix_now;
use crate::db::user::UserRepo;
use crate::registrar::{RegisterRequest, Registrar};
use crate::ServerError;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS device_auth_challenges (
      id                  TEXT PRIMARY KEY,
      proposed_device_id  TEXT,
      hostname            TEXT NOT NULL,
      source_ip           TEXT NOT NULL,
      wg_public_key       TEXT NOT NULL,
      username            TEXT,
      os                  TEXT,
      hardware_id         TEXT,
      status              TEXT NOT NULL DEFAULT 'pending',
      user_id             TEXT REFERENCES users(id),
      approved_device_id  TEXT REFERENCES devices(id),
      created_at          INTEGER NOT NULL,
      expires_at          INTEGER NOT NULL,
      decided_at          INTEGER
    )";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ChallengeStatus {
    fn as_str(self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Approved => "approved",
            ChallengeStatus::Denied => "denied",
            ChallengeStatus::Expired => "expired",
        }
    }

    fn parse(s: &str) -> rusqlite::Result<ChallengeStatus> {
        match s {
            "pending" => Ok(ChallengeStatus::Pending),
            "approved" => Ok(ChallengeStatus::Approved),
            "denied" => Ok(ChallengeStatus::Denied),
            "expired" => Ok(ChallengeStatus::Expired),
            _ => Err(rusqlite::Error::ExecuteReturnedResults),
        }
    }
}

/// An unauthenticated device waiting for a user to approve it. `user_id` is the *approving*
/// user, set only once a human decides — not an owner assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthChallenge {
    pub id: Uuid,
    pub proposed_device_id: Option<Uuid>,
    pub hostname: String,
    pub source_ip: String,
    pub wg_public_key: String,
    pub username: Option<String>,
    pub os: Option<String>,
    pub hardware_id: Option<String>,
    pub status: ChallengeStatus,
    pub user_id: Option<Uuid>,
    pub approved_device_id: Option<Uuid>,
    pub created_at: i64,
    pub expires_at: i64,
    pub decided_at: Option<i64>,
}

pub struct ChallengeRepo;

fn parse_optional_uuid(s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|s| Uuid::parse_str(&s)).transpose().map_err(|_| rusqlite::Error::ExecuteReturnedResults)
}

impl ChallengeRepo {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        conn: &Connection,
        hostname: &str,
        source_ip: &str,
        wg_public_key: &str,
        username: Option<&str>,
        os: Option<&str>,
        hardware_id: Option<&str>,
        proposed_device_id: Option<Uuid>,
        ttl_secs: i64,
    ) -> Result<DeviceAuthChallenge, ServerError> {
        let id = Uuid::new_v4();
        let created_at = unix_now();
        let expires_at = created_at + ttl_secs;
        conn.execute(
            "INSERT INTO device_auth_challenges
                (id, proposed_device_id, hostname, source_ip, wg_public_key, username, os,
                 hardware_id, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10)",
            params![
                id.to_string(),
                proposed_device_id.map(|id| id.to_string()),
                hostname,
                source_ip,
                wg_public_key,
                username,
                os,
                hardware_id,
                created_at,
                expires_at,
            ],
        )?;
        Ok(DeviceAuthChallenge {
            id,
            proposed_device_id,
            hostname: hostname.to_string(),
            source_ip: source_ip.to_string(),
            wg_public_key: wg_public_key.to_string(),
            username: username.map(String::from),
            os: os.map(String::from),
            hardware_id: hardware_id.map(String::from),
            status: ChallengeStatus::Pending,
            user_id: None,
            approved_device_id: None,
            created_at,
            expires_at,
            decided_at: None,
        })
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<DeviceAuthChallenge> {
        let id: String = row.get(0)?;
        let proposed_device_id: Option<String> = row.get(1)?;
        let status: String = row.get(8)?;
        let user_id: Option<String> = row.get(9)?;
        let approved_device_id: Option<String> = row.get(10)?;
        Ok(DeviceAuthChallenge {
            id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            proposed_device_id: parse_optional_uuid(proposed_device_id)?,
            hostname: row.get(2)?,
            source_ip: row.get(3)?,
            wg_public_key: row.get(4)?,
            username: row.get(5)?,
            os: row.get(6)?,
            hardware_id: row.get(7)?,
            status: ChallengeStatus::parse(&status)?,
            user_id: parse_optional_uuid(user_id)?,
            approved_device_id: parse_optional_uuid(approved_device_id)?,
            created_at: row.get(11)?,
            expires_at: row.get(12)?,
            decided_at: row.get(13)?,
        })
    }

    const SELECT: &'static str = "SELECT id, proposed_device_id, hostname, source_ip, wg_public_key, username, os,
                hardware_id, status, user_id, approved_device_id, created_at, expires_at, decided_at
         FROM device_auth_challenges";

    pub fn get(conn: &Connection, id: Uuid) -> Result<DeviceAuthChallenge, ServerError> {
        conn.query_row(&format!("{} WHERE id = ?1", Self::SELECT), params![id.to_string()], Self::from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound,
                e => ServerError::Database(e),
            })
    }

    /// Apply a human decision, recording `decided_by` as the approving user. Idempotent if the
    /// challenge already carries the same decision; a conflicting re-decision (e.g. deny after
    /// approve) is rejected rather than silently overwritten, since the device may already have
    /// been provisioned off the first decision. On approval, registers the device under
    /// `decided_by` via `Registrar::register` and records the resulting device id.
    pub fn decide(conn: &Connection, id: Uuid, decided_by: Uuid, approve: bool) -> Result<DeviceAuthChallenge, ServerError> {
        let challenge = Self::get(conn, id)?;
        let requested = if approve { ChallengeStatus::Approved } else { ChallengeStatus::Denied };

        if challenge.status == requested {
            return Ok(challenge);
        }
        if challenge.status == ChallengeStatus::Expired || challenge.expires_at < unix_now() {
            return Err(ServerError::Gone);
        }
        if challenge.status != ChallengeStatus::Pending {
            return Err(ServerError::Conflict("challenge already decided".into()));
        }

        let approved_device_id = if approve {
            let user = UserRepo::get(conn, decided_by)?;
            let outcome = Registrar::register(
                conn,
                RegisterRequest {
                    user: &user,
                    name: &challenge.hostname,
                    wg_public_key: &challenge.wg_public_key,
                    username: challenge.username.as_deref(),
                    os: challenge.os.as_deref(),
                    hardware_id: challenge.hardware_id.as_deref(),
                    display_name: None,
                    proposed_device_id: challenge.proposed_device_id,
                },
            )?;
            Some(outcome.device.id)
        } else {
            None
        };

        let decided_at = unix_now();
        conn.execute(
            "UPDATE device_auth_challenges SET status = ?2, user_id = ?3, approved_device_id = ?4, decided_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                requested.as_str(),
                decided_by.to_string(),
                approved_device_id.map(|id| id.to_string()),
                decided_at,
            ],
        )?;
        Ok(DeviceAuthChallenge {
            status: requested,
            user_id: Some(decided_by),
            approved_device_id,
            decided_at: Some(decided_at),
            ..challenge
        })
    }

    /// Flip any still-pending challenge whose deadline has passed. Run on the periodic sweep.
    pub fn sweep_expired(conn: &Connection) -> Result<usize, ServerError> {
        Ok(conn.execute(
            "UPDATE device_auth_challenges SET status = 'expired' WHERE status = 'pending' AND expires_at < ?1",
            params![unix_now()],
        )?)
    }

    /// Delete resolved (non-pending) challenges created more than `max_age_secs` ago.
    pub fn delete_resolved_older_than(conn: &Connection, max_age_secs: i64) -> Result<usize, ServerError> {
        Ok(conn.execute(
            "DELETE FROM device_auth_challenges WHERE status != 'pending' AND created_at < ?1",
            params![unix_now() - max_age_secs],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::device::DeviceRepo;
    use ipnet::Ipv4Net;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", 1).unwrap();
        conn.execute_batch(crate::db::user::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(crate::db::device::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(CREATE_TABLE_SQL).unwrap();
        conn
    }

    fn make_user(conn: &Connection) -> Uuid {
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        UserRepo::create(conn, "a@example.com", subnet, 5, None).unwrap().id
    }

    /// A valid 44-character WireGuard base64 public key (32 decoded bytes), for exercising the
    /// registrar without a real keypair.
    const WG_KEY: &str = "ANdyXQOHEWDpS6xC9F8lkx9e9Le5LYxza55V1vIgAKg=";

    #[test]
    fn decide_is_idempotent_same_decision() {
        let conn = conn();
        let user_id = make_user(&conn);
        let challenge = ChallengeRepo::create(&conn, "phone", "203.0.113.4", WG_KEY, None, None, None, None, 300).unwrap();
        let first = ChallengeRepo::decide(&conn, challenge.id, user_id, true).unwrap();
        let second = ChallengeRepo::decide(&conn, challenge.id, user_id, true).unwrap();
        assert_eq!(first.status, ChallengeStatus::Approved);
        assert_eq!(second.status, ChallengeStatus::Approved);
        assert_eq!(first.approved_device_id, second.approved_device_id);
    }

    #[test]
    fn decide_conflicts_on_opposite_decision() {
        let conn = conn();
        let user_id = make_user(&conn);
        let challenge = ChallengeRepo::create(&conn, "phone", "203.0.113.4", WG_KEY, None, None, None, None, 300).unwrap();
        ChallengeRepo::decide(&conn, challenge.id, user_id, true).unwrap();
        assert!(ChallengeRepo::decide(&conn, challenge.id, user_id, false).is_err());
    }

    #[test]
    fn approval_auto_registers_device() {
        let conn = conn();
        let user_id = make_user(&conn);
        let challenge = ChallengeRepo::create(
            &conn,
            "phone",
            "203.0.113.4",
            WG_KEY,
            Some("alice"),
            Some("ios"),
            Some("deadbeef"),
            None,
            300,
        )
        .unwrap();

        let decided = ChallengeRepo::decide(&conn, challenge.id, user_id, true).unwrap();

        assert_eq!(decided.status, ChallengeStatus::Approved);
        assert_eq!(decided.user_id, Some(user_id));
        let device_id = decided.approved_device_id.expect("approval must register a device");

        let device = DeviceRepo::get(&conn, device_id).unwrap();
        assert_eq!(device.user_id, user_id);
        assert_eq!(device.name, "phone");
        assert_eq!(device.wg_public_key, WG_KEY);
        assert_eq!(device.username.as_deref(), Some("alice"));
        assert_eq!(device.os.as_deref(), Some("ios"));
        assert_eq!(device.hardware_id.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn denial_does_not_register_a_device() {
        let conn = conn();
        let user_id = make_user(&conn);
        let challenge = ChallengeRepo::create(&conn, "phone", "203.0.113.4", WG_KEY, None, None, None, None, 300).unwrap();
        let decided = ChallengeRepo::decide(&conn, challenge.id, user_id, false).unwrap();
        assert_eq!(decided.status, ChallengeStatus::Denied);
        assert!(decided.approved_device_id.is_none());
    }
}
