pub mod auth_code;
pub mod challenge;
pub mod conflict;
pub mod device;
pub mod refresh_token;
pub mod user;

use crate::ServerError;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// The whole server shares one sqlite connection behind a single mutex, the same as a
/// `Context::db` field — sqlite serializes writers anyway, and every call here is short-lived.
pub type Db = Arc<Mutex<Connection>>;

/// Open (creating if necessary) the sqlite database at `path`, enable foreign keys, and apply
/// any outstanding migrations. Called once at startup, first in the sequence.
pub fn open_database_connection(path: &Path) -> Result<Connection, ServerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", 1)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Idempotent schema migration: each table is created if missing. Mirrors the call-site
/// contract of `innernet-server`'s `db::auto_migrate` (invoked once per connection-open), here
/// re-implemented as a flat set of `CREATE TABLE IF NOT EXISTS` statements tracked by a
/// `schema_version` row rather than per-migration files, since the schema doesn't evolve yet.
pub fn migrate(conn: &Connection) -> Result<(), ServerError> {
    conn.execute_batch(&format!(
        "BEGIN;
         {users};
         {devices};
         {auth_codes};
         {challenges};
         {refresh_tokens};
         {conflicts};
         CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
         COMMIT;",
        users = user::CREATE_TABLE_SQL,
        devices = device::CREATE_TABLE_SQL,
        auth_codes = auth_code::CREATE_TABLE_SQL,
        challenges = challenge::CREATE_TABLE_SQL,
        refresh_tokens = refresh_token::CREATE_TABLE_SQL,
        conflicts = conflict::CREATE_TABLE_SQL,
    ))?;
    Ok(())
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}
