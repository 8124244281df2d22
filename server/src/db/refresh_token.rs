use super::unix_now;
use crate::ServerError;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS refresh_tokens (
      id          TEXT PRIMARY KEY,
      device_id   TEXT NOT NULL REFERENCES devices(id),
      token       TEXT NOT NULL UNIQUE,
      created_at  INTEGER NOT NULL,
      expires_at  INTEGER NOT NULL,
      revoked     INTEGER NOT NULL DEFAULT 0
    )";

const TOKEN_BYTES: usize = 64;
const ONE_YEAR_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub device_id: Uuid,
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: bool,
}

pub struct RefreshTokenRepo;

impl RefreshTokenRepo {
    fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
    }

    pub fn create(conn: &Connection, device_id: Uuid) -> Result<RefreshToken, ServerError> {
        let id = Uuid::new_v4();
        let token = Self::generate_token();
        let created_at = unix_now();
        let expires_at = created_at + ONE_YEAR_SECS;
        conn.execute(
            "INSERT INTO refresh_tokens (id, device_id, token, created_at, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![id.to_string(), device_id.to_string(), token, created_at, expires_at],
        )?;
        Ok(RefreshToken { id, device_id, token, created_at, expires_at, revoked: false })
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<RefreshToken> {
        let id: String = row.get(0)?;
        let device_id: String = row.get(1)?;
        Ok(RefreshToken {
            id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            device_id: Uuid::parse_str(&device_id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            token: row.get(2)?,
            created_at: row.get(3)?,
            expires_at: row.get(4)?,
            revoked: row.get::<_, i64>(5)? != 0,
        })
    }

    pub fn find_valid(conn: &Connection, token: &str) -> Result<Option<RefreshToken>, ServerError> {
        conn.query_row(
            "SELECT id, device_id, token, created_at, expires_at, revoked FROM refresh_tokens
             WHERE token = ?1 AND revoked = 0 AND expires_at > ?2",
            params![token, unix_now()],
            Self::from_row,
        )
        .optional()
        .map_err(ServerError::Database)
    }

    pub fn revoke(conn: &Connection, id: Uuid) -> Result<(), ServerError> {
        conn.execute("UPDATE refresh_tokens SET revoked = 1 WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// Revoke every outstanding token for a device, called when the device is deleted or its
    /// tunnel access is disabled.
    pub fn revoke_all_for_device(conn: &Connection, device_id: Uuid) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE refresh_tokens SET revoked = 1 WHERE device_id = ?1",
            params![device_id.to_string()],
        )?;
        Ok(())
    }

    pub fn sweep_expired(conn: &Connection) -> Result<usize, ServerError> {
        Ok(conn.execute("DELETE FROM refresh_tokens WHERE expires_at < ?1", params![unix_now()])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::device::{DeviceRepo, NewDevice};
    use crate::db::user::UserRepo;
    use ipnet::Ipv4Net;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", 1).unwrap();
        conn.execute_batch(crate::db::user::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(crate::db::device::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(CREATE_TABLE_SQL).unwrap();
        conn
    }

    fn make_device(conn: &Connection) -> Uuid {
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        let user = UserRepo::create(conn, "a@example.com", subnet, 5, None).unwrap();
        DeviceRepo::create(
            conn,
            NewDevice {
                id: Uuid::new_v4(),
                user_id: user.id,
                name: "laptop",
                wg_public_key: &"A".repeat(44),
                vpn_ip: "10.100.0.2".parse().unwrap(),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn create_and_find_valid() {
        let conn = conn();
        let device_id = make_device(&conn);
        let token = RefreshTokenRepo::create(&conn, device_id).unwrap();
        let found = RefreshTokenRepo::find_valid(&conn, &token.token).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn revoked_token_not_found() {
        let conn = conn();
        let device_id = make_device(&conn);
        let token = RefreshTokenRepo::create(&conn, device_id).unwrap();
        RefreshTokenRepo::revoke(&conn, token.id).unwrap();
        assert!(RefreshTokenRepo::find_valid(&conn, &token.token).unwrap().is_none());
    }
}
