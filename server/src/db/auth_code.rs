use super::unix_now;
use crate::ServerError;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS auth_codes (
      id          TEXT PRIMARY KEY,
      email       TEXT NOT NULL,
      code        TEXT NOT NULL,
      expires_at  INTEGER NOT NULL,
      used        INTEGER NOT NULL DEFAULT 0,
      created_at  INTEGER NOT NULL
    )";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCode {
    pub id: Uuid,
    pub email: String,
    pub code: String,
    pub expires_at: i64,
    pub used: bool,
    pub created_at: i64,
}

pub struct AuthCodeRepo;

impl AuthCodeRepo {
    /// Issue a new code for `email`, valid for `ttl_secs`. Does not invalidate prior
    /// outstanding codes for the same address; verification checks expiry/used independently.
    pub fn create(conn: &Connection, email: &str, code: &str, ttl_secs: i64) -> Result<AuthCode, ServerError> {
        let id = Uuid::new_v4();
        let created_at = unix_now();
        let expires_at = created_at + ttl_secs;
        conn.execute(
            "INSERT INTO auth_codes (id, email, code, expires_at, used, created_at) VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id.to_string(), email, code, expires_at, created_at],
        )?;
        Ok(AuthCode { id, email: email.to_string(), code: code.to_string(), expires_at, used: false, created_at })
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<AuthCode> {
        let id: String = row.get(0)?;
        Ok(AuthCode {
            id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            email: row.get(1)?,
            code: row.get(2)?,
            expires_at: row.get(3)?,
            used: row.get::<_, i64>(4)? != 0,
            created_at: row.get(5)?,
        })
    }

    /// Look up the most recent unused code for `email` matching `code`, regardless of expiry;
    /// callers check `expires_at` themselves so that an expired match can be distinguished
    /// from a wrong code (both end up `Unauthorized` to the client but are logged differently).
    pub fn find_active(conn: &Connection, email: &str, code: &str) -> Result<Option<AuthCode>, ServerError> {
        conn.query_row(
            "SELECT id, email, code, expires_at, used, created_at FROM auth_codes
             WHERE email = ?1 AND code = ?2 AND used = 0
             ORDER BY created_at DESC LIMIT 1",
            params![email, code],
            Self::from_row,
        )
        .optional()
        .map_err(ServerError::Database)
    }

    pub fn mark_used(conn: &Connection, id: Uuid) -> Result<(), ServerError> {
        let changed = conn.execute("UPDATE auth_codes SET used = 1 WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }

    /// Purge codes that expired more than `grace_secs` ago. Run on the periodic sweep.
    pub fn sweep_expired(conn: &Connection, grace_secs: i64) -> Result<usize, ServerError> {
        let cutoff = unix_now() - grace_secs;
        Ok(conn.execute("DELETE FROM auth_codes WHERE expires_at < ?1", params![cutoff])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_TABLE_SQL).unwrap();
        conn
    }

    #[test]
    fn create_and_find_active() {
        let conn = conn();
        AuthCodeRepo::create(&conn, "a@example.com", "123456", 300).unwrap();
        let found = AuthCodeRepo::find_active(&conn, "a@example.com", "123456").unwrap();
        assert!(found.is_some());
        assert!(AuthCodeRepo::find_active(&conn, "a@example.com", "000000").unwrap().is_none());
    }

    #[test]
    fn used_code_not_returned() {
        let conn = conn();
        let code = AuthCodeRepo::create(&conn, "a@example.com", "123456", 300).unwrap();
        AuthCodeRepo::mark_used(&conn, code.id).unwrap();
        assert!(AuthCodeRepo::find_active(&conn, "a@example.com", "123456").unwrap().is_none());
    }
}
