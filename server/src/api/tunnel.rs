use crate::api::{authenticate, owned_device};
use crate::db::device::DeviceRepo;
use crate::pool::port::PortPool;
use crate::util::{form_body, json_response};
use crate::{AppState, ServerError};
use hyper::{Body, Method, Request, Response};
use meshd_shared::normalize_ssh_public_key;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

const MAX_PORT_ALLOCATE_ATTEMPTS: usize = 3;

pub async fn routes(req: Request<Body>, state: AppState, mut components: VecDeque<String>) -> Result<Response<Body>, ServerError> {
    match (req.method().clone(), components.pop_front().as_deref()) {
        (Method::POST, Some("register")) => register(req, state).await,
        (Method::POST, Some("register-key")) => register_key(req, state).await,
        (Method::GET, Some("status")) => status(req, state).await,
        (Method::GET, Some("authorized-keys")) => authorized_keys(req, state).await,
        _ => Err(ServerError::NotFound),
    }
}

#[derive(Deserialize)]
struct RegisterForm {
    device_id: Uuid,
}

#[derive(Serialize)]
struct RegisterResponse {
    tunnel_port: u16,
    server_host: String,
}

/// Tunnel-port allocation, exposed as `/api/tunnel/register`. Allocation races
/// against the `tunnel_port` uniqueness constraint; a losing attempt just recomputes and
/// retries, same discipline as the registrar's VPN-IP insert loop.
async fn register(req: Request<Body>, state: AppState) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let form: RegisterForm = form_body(req).await?;
    let device = owned_device(&state, &user, &form.device_id.to_string())?;

    if let Some(port) = device.tunnel_port {
        return json_response(RegisterResponse { tunnel_port: port, server_host: state.mesh.server_public_endpoint.to_string() });
    }

    for attempt in 0..MAX_PORT_ALLOCATE_ATTEMPTS {
        let conn = state.db.lock();
        let port = PortPool::allocate(&conn, state.mesh.tunnel_port_start, state.mesh.tunnel_port_end)?;
        match DeviceRepo::set_tunnel_port(&conn, device.id, port) {
            Ok(()) => {
                return json_response(RegisterResponse { tunnel_port: port, server_host: state.mesh.server_public_endpoint.to_string() });
            },
            Err(ServerError::Database(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation && attempt + 1 < MAX_PORT_ALLOCATE_ATTEMPTS =>
            {
                continue;
            },
            Err(e) => return Err(e),
        }
    }
    Err(ServerError::Exhausted("could not allocate a tunnel port after repeated retries"))
}

#[derive(Deserialize)]
struct RegisterKeyForm {
    device_id: Uuid,
    public_key: String,
}

/// Parses and re-marshals the presented key so storage and later lookup are always the
/// canonical form (spec invariant 7). A key that doesn't parse is a 400, never a 500.
async fn register_key(req: Request<Body>, state: AppState) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let form: RegisterKeyForm = form_body(req).await?;
    let device = owned_device(&state, &user, &form.device_id.to_string())?;

    let normalized = normalize_ssh_public_key(&form.public_key)
        .map_err(|e| ServerError::Validation(format!("malformed SSH public key: {e}")))?;

    let conn = state.db.lock();
    DeviceRepo::set_ssh_public_key(&conn, device.id, &normalized)?;
    crate::util::status_response(hyper::StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct TunnelStatusEntry {
    device_id: Uuid,
    name: String,
    tunnel_port: u16,
    tunnel_enabled: bool,
}

async fn status(req: Request<Body>, state: AppState) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let conn = state.db.lock();
    let devices = DeviceRepo::list_by_user(&conn, user.id)?;
    let entries: Vec<_> = devices
        .into_iter()
        .filter_map(|d| {
            d.tunnel_port.map(|port| TunnelStatusEntry { device_id: d.id, name: d.name, tunnel_port: port, tunnel_enabled: d.tunnel_enabled })
        })
        .collect();
    json_response(entries)
}

/// Caller-scoped slice of the `AuthorizedTunnelKey` view: only this user's active,
/// tunnel-enabled devices, not the whole fleet.
async fn authorized_keys(req: Request<Body>, state: AppState) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let conn = state.db.lock();
    let devices = DeviceRepo::list_by_user(&conn, user.id)?;
    let keys: Vec<String> = devices
        .into_iter()
        .filter(|d| d.active && d.tunnel_enabled)
        .filter_map(|d| d.ssh_public_key)
        .collect();
    json_response(keys)
}
