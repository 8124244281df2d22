use super::address::{enumerate_subnets, overlaps};
use crate::db::{conflict::ConflictRepo, user::UserRepo};
use crate::ServerError;
use ipnet::Ipv4Net;
use rusqlite::Connection;

pub struct SubnetPool;

impl SubnetPool {
    /// Smallest `/subnet_size` subnet inside `base` (tried first) or, on exhaustion, inside
    /// each of `fallbacks` in order, that doesn't equal or overlap any existing user subnet and
    /// doesn't overlap any active conflict. Strict numeric ordering, no randomization.
    pub fn allocate(
        conn: &Connection,
        base: Ipv4Net,
        fallbacks: &[Ipv4Net],
        subnet_size: u8,
    ) -> Result<Ipv4Net, ServerError> {
        let taken = UserRepo::list_all_subnets(conn)?;
        let active_conflicts = ConflictRepo::list_active(conn)?;

        for candidate_base in std::iter::once(base).chain(fallbacks.iter().copied()) {
            for candidate in enumerate_subnets(candidate_base, subnet_size) {
                if taken.iter().any(|t| overlaps(*t, candidate)) {
                    continue;
                }
                if active_conflicts.iter().any(|c| overlaps(c.cidr, candidate)) {
                    continue;
                }
                return Ok(candidate);
            }
        }
        Err(ServerError::Exhausted("no free subnet in base or fallback networks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::user::UserRepo;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::db::user::CREATE_TABLE_SQL).unwrap();
        conn.execute_batch(crate::db::conflict::CREATE_TABLE_SQL).unwrap();
        conn
    }

    #[test]
    fn allocate_smallest_free_subnet() {
        let conn = conn();
        let base: Ipv4Net = "10.100.0.0/24".parse().unwrap();
        let first = SubnetPool::allocate(&conn, base, &[], 29).unwrap();
        assert_eq!(first.to_string(), "10.100.0.0/29");
        UserRepo::create(&conn, "a@example.com", first, 5, None).unwrap();
        let second = SubnetPool::allocate(&conn, base, &[], 29).unwrap();
        assert_eq!(second.to_string(), "10.100.0.8/29");
    }

    #[test]
    fn falls_back_when_base_exhausted() {
        let conn = conn();
        let base: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        let fallback: Ipv4Net = "10.101.0.0/24".parse().unwrap();
        UserRepo::create(&conn, "a@example.com", base, 5, None).unwrap();
        let allocated = SubnetPool::allocate(&conn, base, &[fallback], 29).unwrap();
        assert_eq!(allocated.to_string(), "10.101.0.0/29");
    }

    #[test]
    fn exhaustion_is_reported() {
        let conn = conn();
        let base: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        UserRepo::create(&conn, "a@example.com", base, 5, None).unwrap();
        assert!(matches!(
            SubnetPool::allocate(&conn, base, &[], 29),
            Err(ServerError::Exhausted(_))
        ));
    }

    #[test]
    fn avoids_active_conflict() {
        let conn = conn();
        let base: Ipv4Net = "10.100.0.0/24".parse().unwrap();
        let conflicting: Ipv4Net = "10.100.0.0/29".parse().unwrap();
        crate::db::conflict::ConflictRepo::record(
            &conn,
            conflicting,
            crate::db::conflict::ConflictSource::Docker,
            None,
        )
        .unwrap();
        let allocated = SubnetPool::allocate(&conn, base, &[], 29).unwrap();
        assert_eq!(allocated.to_string(), "10.100.0.8/29");
    }
}
