use super::unix_now;
use crate::ServerError;
use ipnet::Ipv4Net;
use rusqlite::{params, Connection};
use uuid::Uuid;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS network_conflicts (
      id           TEXT PRIMARY KEY,
      cidr         TEXT NOT NULL,
      source       TEXT NOT NULL,
      description  TEXT,
      active       INTEGER NOT NULL DEFAULT 1,
      detected_at  INTEGER NOT NULL
    )";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSource {
    Docker,
    System,
    Manual,
}

impl ConflictSource {
    fn as_str(self) -> &'static str {
        match self {
            ConflictSource::Docker => "docker",
            ConflictSource::System => "system",
            ConflictSource::Manual => "manual",
        }
    }

    fn parse(s: &str) -> rusqlite::Result<ConflictSource> {
        match s {
            "docker" => Ok(ConflictSource::Docker),
            "system" => Ok(ConflictSource::System),
            "manual" => Ok(ConflictSource::Manual),
            _ => Err(rusqlite::Error::ExecuteReturnedResults),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConflict {
    pub id: Uuid,
    pub cidr: Ipv4Net,
    pub source: ConflictSource,
    pub description: Option<String>,
    pub active: bool,
    pub detected_at: i64,
}

pub struct ConflictRepo;

impl ConflictRepo {
    pub fn record(
        conn: &Connection,
        cidr: Ipv4Net,
        source: ConflictSource,
        description: Option<&str>,
    ) -> Result<NetworkConflict, ServerError> {
        let id = Uuid::new_v4();
        let detected_at = unix_now();
        conn.execute(
            "INSERT INTO network_conflicts (id, cidr, source, description, active, detected_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![id.to_string(), cidr.to_string(), source.as_str(), description, detected_at],
        )?;
        Ok(NetworkConflict {
            id,
            cidr,
            source,
            description: description.map(String::from),
            active: true,
            detected_at,
        })
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<NetworkConflict> {
        let id: String = row.get(0)?;
        let cidr: String = row.get(1)?;
        let source: String = row.get(2)?;
        Ok(NetworkConflict {
            id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            cidr: cidr.parse().map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            source: ConflictSource::parse(&source)?,
            description: row.get(3)?,
            active: row.get::<_, i64>(4)? != 0,
            detected_at: row.get(5)?,
        })
    }

    pub fn list_active(conn: &Connection) -> Result<Vec<NetworkConflict>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, cidr, source, description, active, detected_at FROM network_conflicts WHERE active = 1",
        )?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// A candidate subnet conflicts if it overlaps any currently-active recorded conflict.
    pub fn overlaps_active(conn: &Connection, candidate: Ipv4Net) -> Result<bool, ServerError> {
        Ok(Self::list_active(conn)?.iter().any(|c| networks_overlap(c.cidr, candidate)))
    }

    pub fn clear(conn: &Connection, id: Uuid) -> Result<(), ServerError> {
        let changed = conn.execute("UPDATE network_conflicts SET active = 0 WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }
}

fn networks_overlap(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || a.contains(&b.broadcast()) || b.contains(&a.network()) || b.contains(&a.broadcast())
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
    fn overlap_detected_against_active_conflict() {
        let conn = conn();
        let cidr: Ipv4Net = "172.17.0.0/16".parse().unwrap();
        ConflictRepo::record(&conn, cidr, ConflictSource::Docker, Some("docker0 bridge")).unwrap();
        let candidate: Ipv4Net = "172.17.5.0/24".parse().unwrap();
        assert!(ConflictRepo::overlaps_active(&conn, candidate).unwrap());
        let disjoint: Ipv4Net = "10.100.0.0/24".parse().unwrap();
        assert!(!ConflictRepo::overlaps_active(&conn, disjoint).unwrap());
    }

    #[test]
    fn cleared_conflict_no_longer_blocks() {
        let conn = conn();
        let cidr: Ipv4Net = "172.17.0.0/16".parse().unwrap();
        let conflict = ConflictRepo::record(&conn, cidr, ConflictSource::Docker, None).unwrap();
        ConflictRepo::clear(&conn, conflict.id).unwrap();
        let candidate: Ipv4Net = "172.17.5.0/24".parse().unwrap();
        assert!(!ConflictRepo::overlaps_active(&conn, candidate).unwrap());
    }
}
