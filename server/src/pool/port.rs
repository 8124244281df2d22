use crate::ServerError;
use rusqlite::{params, Connection};

pub struct PortPool;

impl PortPool {
    /// Smallest port in `[start, end]` not currently assigned to any active device. Not
    /// guarded by an exclusive lock: the caller inserts optimistically and retries on a
    /// uniqueness violation against the `devices.tunnel_port` column.
    pub fn allocate(conn: &Connection, start: u16, end: u16) -> Result<u16, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT tunnel_port FROM devices WHERE tunnel_port IS NOT NULL AND active = 1 ORDER BY tunnel_port",
        )?;
        let taken: Vec<u16> = stmt
            .query_map(params![], |row| row.get::<_, i64>(0).map(|p| p as u16))?
            .collect::<Result<_, _>>()?;

        let mut taken_iter = taken.into_iter().peekable();
        for port in start..=end {
            while matches!(taken_iter.peek(), Some(p) if *p < port) {
                taken_iter.next();
            }
            if taken_iter.peek() != Some(&port) {
                return Ok(port);
            }
        }
        Err(ServerError::Exhausted("no free tunnel port in configured range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::device::{DeviceRepo, NewDevice};
    use crate::db::user::UserRepo;
    use ipnet::Ipv4Net;
    use uuid::Uuid;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", 1).unwrap();
        conn.execute_batch(crate::db::user::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(crate::db::device::CREATE_TABLE_SQL).unwrap();
        conn
    }

    fn make_device(conn: &Connection, name: &str, ip: &str, port: Option<u16>) {
        let subnet: Ipv4Net = "10.100.0.0/24".parse().unwrap();
        let user = UserRepo::get_by_email(conn, "a@example.com")
            .unwrap()
            .unwrap_or_else(|| UserRepo::create(conn, "a@example.com", subnet, 5, None).unwrap());
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
    }

    #[test]
    fn allocate_fills_gaps_in_order() {
        let conn = conn();
        make_device(&conn, "a", "10.100.0.2", Some(10000));
        make_device(&conn, "b", "10.100.0.3", Some(10002));
        let allocated = PortPool::allocate(&conn, 10000, 10002).unwrap();
        assert_eq!(allocated, 10001);
    }

    #[test]
    fn exhaustion_reported_over_small_range() {
        let conn = conn();
        make_device(&conn, "a", "10.100.0.2", Some(10000));
        make_device(&conn, "b", "10.100.0.3", Some(10001));
        make_device(&conn, "c", "10.100.0.4", Some(10002));
        assert!(matches!(PortPool::allocate(&conn, 10000, 10002), Err(ServerError::Exhausted(_))));
    }
}
