use crate::cache::{AuthorizationCache, PresenceCache};
use crate::config::{MeshConfig, ServerConfig};
use crate::db::{auth_code::AuthCodeRepo, challenge::ChallengeRepo};
use crate::ssh::Broker;
use crate::wireguard::WireGuardManager;
use crate::{api, db, AppState};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Reserved port for the SSH tunnel broker.
const BROKER_PORT: u16 = 2222;

const AUTH_CODE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CHALLENGE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const AUTH_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PRESENCE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const CHALLENGE_RESOLVED_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const AUTH_CODE_GRACE: i64 = 60;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Startup order: migrations → repositories → WireGuard takeover/initialize → broker
/// host-key load/generate → HTTP listener → broker listener → background tasks. Runs until
/// `SIGINT`/`SIGTERM`, then shuts down in reverse: stop accepting HTTP, drain in-flight
/// requests, stop the broker, close the database.
pub async fn run(mesh: MeshConfig, server_config: ServerConfig) -> anyhow::Result<()> {
    let conn = db::open_database_connection(&server_config.database_path())?;
    let db: db::Db = Arc::new(parking_lot::Mutex::new(conn));

    let wireguard = Arc::new(WireGuardManager::new(&server_config, &mesh)?);
    wireguard.initialize_interface(&mesh)?;

    let auth_cache = Arc::new(AuthorizationCache::new());
    let presence = Arc::new(PresenceCache::new());

    let state = AppState {
        db: db.clone(),
        mesh: mesh.clone(),
        server_config: server_config.clone(),
        wireguard,
        auth_cache: auth_cache.clone(),
        presence: presence.clone(),
    };

    // Host-key load/generate happens inside `Broker::run` itself, right before it starts
    // accepting — still ahead of the HTTP listener in wall-clock startup order below.
    let broker = Broker::new(db.clone(), auth_cache.clone());
    let broker_addr = SocketAddr::new(mesh.api_host, BROKER_PORT);
    let broker_server_config = server_config.clone();
    let broker_task = tokio::spawn(async move {
        if let Err(e) = broker.run(&broker_server_config, broker_addr).await {
            log::error!("tunnel broker exited: {e}");
        }
    });

    let http_addr = SocketAddr::new(mesh.api_host, mesh.api_port);
    let make_svc = make_service_fn(move |socket: &AddrStream| {
        let remote_addr = socket.remote_addr();
        let state = state.clone();
        async move {
            Ok::<_, hyper::http::Error>(service_fn(move |req: Request<Body>| {
                log::debug!("{} - {} {}", remote_addr, req.method(), req.uri());
                api::hyper_service(req, state.clone(), remote_addr)
            }))
        }
    });

    let server = hyper::Server::bind(&http_addr).serve(make_svc).with_graceful_shutdown(wait_for_signal());

    log::info!("meshd {} listening on {http_addr}, tunnel broker on {broker_addr}", crate::VERSION);

    spawn_background_tasks(db.clone(), auth_cache, presence);

    // `with_graceful_shutdown` stops accepting new connections as soon as `wait_for_signal`
    // resolves and then drains in-flight ones with no cap of its own, so the drain wait is
    // bounded here with a timeout around the whole thing.
    let result = match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(server_result) => server_result.map_err(anyhow::Error::from),
        Err(_) => {
            log::warn!("in-flight requests did not drain within {}s, forcing shutdown", SHUTDOWN_GRACE.as_secs());
            Ok(())
        },
    };

    log::info!("HTTP listener stopped, stopping tunnel broker");
    broker_task.abort();

    result
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => log::info!("received SIGINT, no longer accepting new HTTP connections"),
        _ = terminate.recv() => log::info!("received SIGTERM, no longer accepting new HTTP connections"),
    }
}

/// One `tokio::spawn` + `interval.tick()` loop per sweep, same shape as the
/// teacher's `spawn_expired_invite_sweeper`/`spawn_hostfile_writer`.
fn spawn_background_tasks(db: db::Db, auth_cache: Arc<AuthorizationCache>, presence: Arc<PresenceCache>) {
    tokio::spawn({
        let db = db.clone();
        async move {
            let mut interval = tokio::time::interval(AUTH_CODE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                match AuthCodeRepo::sweep_expired(&db.lock(), AUTH_CODE_GRACE) {
                    Ok(n) if n > 0 => log::debug!("swept {n} expired auth codes"),
                    Err(e) => log::error!("auth code sweep failed: {e}"),
                    _ => {},
                }
            }
        }
    });

    // Merges two overlapping challenge cleanup cadences (1 min pending-expiry transition,
    // 2 min expiry transition) into one 1-minute task: the shorter cadence already satisfies
    // the longer
    // one, and "transition expired pending rows" and "expired device challenges -> expired"
    // describe the same update. Also deletes resolved rows past the 7-day retention window.
    tokio::spawn({
        let db = db.clone();
        async move {
            let mut interval = tokio::time::interval(CHALLENGE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let conn = db.lock();
                if let Err(e) = ChallengeRepo::sweep_expired(&conn) {
                    log::error!("challenge expiry sweep failed: {e}");
                }
                if let Err(e) = ChallengeRepo::delete_resolved_older_than(&conn, CHALLENGE_RESOLVED_MAX_AGE.as_secs() as i64) {
                    log::error!("challenge retention sweep failed: {e}");
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(AUTH_CACHE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            auth_cache.sweep();
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRESENCE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            presence.sweep();
        }
    });
}
