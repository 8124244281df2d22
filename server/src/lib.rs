use std::sync::Arc;

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod registrar;
pub mod ssh;
pub mod util;
pub mod wireguard;

pub use error::ServerError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a request handler or background task needs. Threaded through explicitly instead
/// of held in globals, the way a `Context` struct is, generalized to the allocator/WireGuard/
/// broker/cache components this system adds.
#[derive(Clone)]
pub struct AppState {
    pub db: db::Db,
    pub mesh: config::MeshConfig,
    pub server_config: config::ServerConfig,
    pub wireguard: Arc<wireguard::WireGuardManager>,
    pub auth_cache: Arc<cache::AuthorizationCache>,
    pub presence: Arc<cache::PresenceCache>,
}
