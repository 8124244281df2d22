use super::unix_now;
use crate::ServerError;
use rusqlite::{params, Connection, OptionalExtension};
use std::net::Ipv4Addr;
use uuid::Uuid;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS devices (
      id               TEXT PRIMARY KEY,
      user_id          TEXT NOT NULL REFERENCES users(id),
      name             TEXT NOT NULL,
      wg_public_key    TEXT NOT NULL UNIQUE,
      vpn_ip           TEXT NOT NULL,
      username         TEXT,
      os               TEXT,
      hardware_id      TEXT,
      display_name     TEXT,
      active           INTEGER NOT NULL DEFAULT 1,
      last_seen        INTEGER,
      tunnel_port      INTEGER UNIQUE,
      ssh_public_key   TEXT UNIQUE,
      tunnel_enabled   INTEGER NOT NULL DEFAULT 0,
      UNIQUE(user_id, name),
      UNIQUE(user_id, vpn_ip)
    )";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub wg_public_key: String,
    pub vpn_ip: Ipv4Addr,
    pub username: Option<String>,
    pub os: Option<String>,
    pub hardware_id: Option<String>,
    pub display_name: Option<String>,
    pub active: bool,
    pub last_seen: Option<i64>,
    pub tunnel_port: Option<u16>,
    pub ssh_public_key: Option<String>,
    pub tunnel_enabled: bool,
}

pub struct NewDevice<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: &'a str,
    pub wg_public_key: &'a str,
    pub vpn_ip: Ipv4Addr,
    pub username: Option<&'a str>,
    pub os: Option<&'a str>,
    pub hardware_id: Option<&'a str>,
    pub display_name: Option<&'a str>,
}

pub struct DeviceRepo;

impl DeviceRepo {
    pub fn create(conn: &Connection, new: NewDevice) -> Result<Device, ServerError> {
        conn.execute(
            "INSERT INTO devices
                (id, user_id, name, wg_public_key, vpn_ip, username, os, hardware_id, display_name, active, tunnel_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, 0)",
            params![
                new.id.to_string(),
                new.user_id.to_string(),
                new.name,
                new.wg_public_key,
                new.vpn_ip.to_string(),
                new.username,
                new.os,
                new.hardware_id,
                new.display_name,
            ],
        )?;
        Self::get(conn, new.id)
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Device> {
        let id: String = row.get(0)?;
        let user_id: String = row.get(1)?;
        let vpn_ip: String = row.get(4)?;
        Ok(Device {
            id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            user_id: Uuid::parse_str(&user_id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            name: row.get(2)?,
            wg_public_key: row.get(3)?,
            vpn_ip: vpn_ip.parse().map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            username: row.get(5)?,
            os: row.get(6)?,
            hardware_id: row.get(7)?,
            display_name: row.get(8)?,
            active: row.get::<_, i64>(9)? != 0,
            last_seen: row.get(10)?,
            tunnel_port: row.get::<_, Option<i64>>(11)?.map(|p| p as u16),
            ssh_public_key: row.get(12)?,
            tunnel_enabled: row.get::<_, i64>(13)? != 0,
        })
    }

    const SELECT: &'static str = "SELECT id, user_id, name, wg_public_key, vpn_ip, username, os, hardware_id,
         display_name, active, last_seen, tunnel_port, ssh_public_key, tunnel_enabled FROM devices";

    pub fn get(conn: &Connection, id: Uuid) -> Result<Device, ServerError> {
        conn.query_row(&format!("{} WHERE id = ?1", Self::SELECT), params![id.to_string()], Self::from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound,
                e => ServerError::Database(e),
            })
    }

    pub fn get_by_user_and_name(conn: &Connection, user_id: Uuid, name: &str) -> Result<Option<Device>, ServerError> {
        conn.query_row(
            &format!("{} WHERE user_id = ?1 AND name = ?2", Self::SELECT),
            params![user_id.to_string(), name],
            Self::from_row,
        )
        .optional()
        .map_err(ServerError::Database)
    }

    pub fn get_by_user_and_hardware_id(
        conn: &Connection,
        user_id: Uuid,
        hardware_id: &str,
    ) -> Result<Option<Device>, ServerError> {
        conn.query_row(
            &format!("{} WHERE user_id = ?1 AND hardware_id = ?2", Self::SELECT),
            params![user_id.to_string(), hardware_id],
            Self::from_row,
        )
        .optional()
        .map_err(ServerError::Database)
    }

    pub fn get_by_public_key(conn: &Connection, wg_public_key: &str) -> Result<Option<Device>, ServerError> {
        conn.query_row(&format!("{} WHERE wg_public_key = ?1", Self::SELECT), params![wg_public_key], Self::from_row)
            .optional()
            .map_err(ServerError::Database)
    }

    pub fn get_by_vpn_ip(conn: &Connection, vpn_ip: Ipv4Addr) -> Result<Option<Device>, ServerError> {
        conn.query_row(&format!("{} WHERE vpn_ip = ?1", Self::SELECT), params![vpn_ip.to_string()], Self::from_row)
            .optional()
            .map_err(ServerError::Database)
    }

    pub fn get_by_ssh_key(conn: &Connection, ssh_public_key: &str) -> Result<Option<Device>, ServerError> {
        conn.query_row(
            &format!("{} WHERE ssh_public_key = ?1", Self::SELECT),
            params![ssh_public_key],
            Self::from_row,
        )
        .optional()
        .map_err(ServerError::Database)
    }

    pub fn list_by_user(conn: &Connection, user_id: Uuid) -> Result<Vec<Device>, ServerError> {
        let mut stmt = conn.prepare_cached(&format!("{} WHERE user_id = ?1", Self::SELECT))?;
        let rows = stmt.query_map(params![user_id.to_string()], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_active(conn: &Connection) -> Result<Vec<Device>, ServerError> {
        let mut stmt = conn.prepare_cached(&format!("{} WHERE active = 1", Self::SELECT))?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Active device count for a user, optionally excluding one row (used by the registrar's
    /// replace path so the row being replaced doesn't count against the cap, per spec invariant 5).
    pub fn count_active_excluding(conn: &Connection, user_id: Uuid, excluding: Option<Uuid>) -> Result<u32, ServerError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE user_id = ?1 AND active = 1 AND id != ?2",
            params![user_id.to_string(), excluding.unwrap_or_else(Uuid::nil).to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn list_used_ips(conn: &Connection, user_id: Uuid) -> Result<Vec<Ipv4Addr>, ServerError> {
        let mut stmt = conn.prepare_cached("SELECT vpn_ip FROM devices WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| row.get::<_, String>(0))?;
        let mut ips = Vec::new();
        for row in rows {
            ips.push(row?.parse().map_err(|_| rusqlite::Error::ExecuteReturnedResults)?);
        }
        Ok(ips)
    }

    pub fn delete(conn: &Connection, id: Uuid) -> Result<(), ServerError> {
        let changed = conn.execute("DELETE FROM devices WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }

    pub fn set_tunnel_port(conn: &Connection, id: Uuid, port: u16) -> Result<(), ServerError> {
        conn.execute("UPDATE devices SET tunnel_port = ?2 WHERE id = ?1", params![id.to_string(), port])?;
        Ok(())
    }

    pub fn set_ssh_public_key(conn: &Connection, id: Uuid, normalized_key: &str) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE devices SET ssh_public_key = ?2 WHERE id = ?1",
            params![id.to_string(), normalized_key],
        )?;
        Ok(())
    }

    pub fn set_tunnel_enabled(conn: &Connection, id: Uuid, enabled: bool) -> Result<(), ServerError> {
        let changed = conn.execute(
            "UPDATE devices SET tunnel_enabled = ?2 WHERE id = ?1",
            params![id.to_string(), enabled],
        )?;
        if changed == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }

    pub fn mark_seen(conn: &Connection, id: Uuid) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE devices SET last_seen = ?2 WHERE id = ?1",
            params![id.to_string(), unix_now()],
        )?;
        Ok(())
    }

    /// Derived `AuthorizedTunnelKey` view: active, tunnel-enabled devices with a
    /// registered SSH key, keyed by that key for O(1) lookup at authentication time.
    pub fn list_authorized_tunnel_keys(conn: &Connection) -> Result<Vec<Device>, ServerError> {
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE active = 1 AND tunnel_enabled = 1 AND ssh_public_key IS NOT NULL AND tunnel_port IS NOT NULL",
            Self::SELECT
        ))?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
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
        conn.execute_batch(CREATE_TABLE_SQL).unwrap();
        conn
    }

    fn make_user(conn: &Connection) -> Uuid {
        let subnet: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        UserRepo::create(conn, "a@example.com", subnet, 5, None).unwrap().id
    }

    #[test]
    fn create_and_lookup() {
        let conn = conn();
        let user_id = make_user(&conn);
        let id = Uuid::new_v4();
        let device = DeviceRepo::create(
            &conn,
            NewDevice {
                id,
                user_id,
                name: "laptop",
                wg_public_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
                vpn_ip: "10.100.0.2".parse().unwrap(),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
            },
        )
        .unwrap();
        assert_eq!(device.id, id);
        assert!(DeviceRepo::get_by_user_and_name(&conn, user_id, "laptop").unwrap().is_some());
    }

    #[test]
    fn duplicate_wg_key_rejected() {
        let conn = conn();
        let user_id = make_user(&conn);
        let key: String = "B".repeat(43) + "=";
        DeviceRepo::create(
            &conn,
            NewDevice {
                id: Uuid::new_v4(),
                user_id,
                name: "laptop",
                wg_public_key: &key,
                vpn_ip: "10.100.0.2".parse().unwrap(),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
            },
        )
        .unwrap();
        let result = DeviceRepo::create(
            &conn,
            NewDevice {
                id: Uuid::new_v4(),
                user_id,
                name: "phone",
                wg_public_key: &key,
                vpn_ip: "10.100.0.3".parse().unwrap(),
                username: None,
                os: None,
                hardware_id: None,
                display_name: None,
            },
        );
        assert!(result.is_err());
    }
}
