pub mod dispatch;
pub mod handler;
pub mod hostkey;

use crate::cache::AuthorizationCache;
use crate::config::ServerConfig;
use crate::db::Db;
use handler::ConnectionHandler;
use russh::server::Server as RusshServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// State shared by every connection the broker accepts.
pub struct BrokerState {
    pub db: Db,
    pub auth_cache: Arc<AuthorizationCache>,
}

/// The reverse-tunnel broker itself. One `Broker` per process; `russh` hands it a fresh
/// `ConnectionHandler` per accepted connection via `new_client`.
#[derive(Clone)]
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(db: Db, auth_cache: Arc<AuthorizationCache>) -> Self {
        Self { state: Arc::new(BrokerState { db, auth_cache }) }
    }

    pub fn build_config(host_key: ssh_key::PrivateKey) -> russh::server::Config {
        russh::server::Config {
            methods: russh::MethodSet::PUBLICKEY,
            keys: vec![host_key],
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Load or generate the host key, build the `russh` config, and serve forever on `addr`.
    /// Runs until the process is killed; callers spawn this as a background task.
    pub async fn run(self, server_config: &ServerConfig, addr: SocketAddr) -> anyhow::Result<()> {
        let host_key = hostkey::load_or_generate(server_config)?;
        let config = Arc::new(Self::build_config(host_key));
        let mut server = self;
        server.run_on_address(config, addr).await?;
        Ok(())
    }
}

impl RusshServer for Broker {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        log::info!("new tunnel broker connection from {peer_addr:?}");
        ConnectionHandler::new(self.state.clone())
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        log::warn!("tunnel broker session error: {error}");
    }
}
