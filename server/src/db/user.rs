use super::unix_now;
use crate::ServerError;
use ipnet::Ipv4Net;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
      id                 TEXT PRIMARY KEY,
      email              TEXT NOT NULL UNIQUE,
      subnet             TEXT NOT NULL UNIQUE,
      device_cap         INTEGER NOT NULL DEFAULT 5,
      active             INTEGER NOT NULL DEFAULT 1,
      auth_provider_id   TEXT,
      created_at         INTEGER NOT NULL
    )";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub subnet: Ipv4Net,
    pub device_cap: u32,
    pub active: bool,
    pub auth_provider_id: Option<String>,
    pub created_at: i64,
}

pub struct UserRepo;

impl UserRepo {
    pub fn create(
        conn: &Connection,
        email: &str,
        subnet: Ipv4Net,
        device_cap: u32,
        auth_provider_id: Option<&str>,
    ) -> Result<User, ServerError> {
        let id = Uuid::new_v4();
        let created_at = unix_now();
        conn.execute(
            "INSERT INTO users (id, email, subnet, device_cap, active, auth_provider_id, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
            params![id.to_string(), email, subnet.to_string(), device_cap, auth_provider_id, created_at],
        )?;
        Ok(User {
            id,
            email: email.to_string(),
            subnet,
            device_cap,
            active: true,
            auth_provider_id: auth_provider_id.map(String::from),
            created_at,
        })
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let id: String = row.get(0)?;
        let email = row.get(1)?;
        let subnet: String = row.get(2)?;
        Ok(User {
            id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            email,
            subnet: subnet.parse().map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            device_cap: row.get(3)?,
            active: row.get::<_, i64>(4)? != 0,
            auth_provider_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    pub fn get(conn: &Connection, id: Uuid) -> Result<User, ServerError> {
        conn.query_row(
            "SELECT id, email, subnet, device_cap, active, auth_provider_id, created_at FROM users WHERE id = ?1",
            params![id.to_string()],
            Self::from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound,
            e => ServerError::Database(e),
        })
    }

    pub fn get_by_email(conn: &Connection, email: &str) -> Result<Option<User>, ServerError> {
        conn.query_row(
            "SELECT id, email, subnet, device_cap, active, auth_provider_id, created_at FROM users WHERE email = ?1",
            params![email],
            Self::from_row,
        )
        .optional()
        .map_err(ServerError::Database)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<User>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, email, subnet, device_cap, active, auth_provider_id, created_at FROM users",
        )?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_all_subnets(conn: &Connection) -> Result<Vec<Ipv4Net>, ServerError> {
        let mut stmt = conn.prepare_cached("SELECT subnet FROM users")?;
        let rows = stmt.query_map(params![], |row| row.get::<_, String>(0))?;
        let mut subnets = Vec::new();
        for row in rows {
            let subnet: Ipv4Net = row?
                .parse()
                .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
            subnets.push(subnet);
        }
        Ok(subnets)
    }

    /// Soft-delete: clear the active flag. Subnet is left allocated so it can never be reused
    /// while a device might still reference it.
    pub fn deactivate(conn: &Connection, id: Uuid) -> Result<(), ServerError> {
        let changed = conn.execute("UPDATE users SET active = 0 WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
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
    fn create_and_get_roundtrips() {
        let conn = conn();
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        let user = UserRepo::create(&conn, "a@example.com", subnet, 5, None).unwrap();
        let fetched = UserRepo::get(&conn, user.id).unwrap();
        assert_eq!(fetched.email, "a@example.com");
        assert_eq!(fetched.subnet, subnet);
        assert!(fetched.active);
    }

    #[test]
    fn duplicate_email_rejected() {
        let conn = conn();
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        UserRepo::create(&conn, "a@example.com", subnet, 5, None).unwrap();
        let subnet2: Ipv4Net = "10.100.0.8/29".parse().unwrap();
        assert!(UserRepo::create(&conn, "a@example.com", subnet2, 5, None).is_err());
    }
}
