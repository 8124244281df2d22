use crate::api::{authenticate, owned_device};
use crate::db::device::{Device, DeviceRepo};
use crate::db::refresh_token::RefreshTokenRepo;
use crate::registrar::{RegisterRequest, Registrar};
use crate::util::{form_body, json_response, status_response};
use crate::{AppState, ServerError};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

pub async fn routes(req: Request<Body>, state: AppState, mut components: VecDeque<String>) -> Result<Response<Body>, ServerError> {
    let method = req.method().clone();
    let id = components.pop_front();

    match (method, id.as_deref()) {
        (Method::GET, None) => list(req, state).await,
        (Method::POST, None) => create(req, state).await,
        (Method::GET, Some(id)) if components.is_empty() => get(req, state, id).await,
        (Method::DELETE, Some(id)) if components.is_empty() => revoke(req, state, id).await,
        (Method::PATCH, Some(id)) if components.front().map(String::as_str) == Some("config") => {
            update_config(req, state, id).await
        },
        (Method::POST, Some(id)) if components.front().map(String::as_str) == Some("heartbeat") => {
            heartbeat(req, state, id).await
        },
        (Method::PATCH, Some(id)) if components.front().map(String::as_str) == Some("tunnel") => {
            components.pop_front();
            match components.pop_front().as_deref() {
                Some("enable") => set_tunnel_enabled(req, state, id, true).await,
                Some("disable") => set_tunnel_enabled(req, state, id, false).await,
                _ => Err(ServerError::NotFound),
            }
        },
        _ => Err(ServerError::NotFound),
    }
}

#[derive(Serialize)]
struct DeviceResponse {
    id: Uuid,
    name: String,
    wg_public_key: String,
    vpn_ip: String,
    username: Option<String>,
    os: Option<String>,
    hardware_id: Option<String>,
    display_name: Option<String>,
    active: bool,
    last_seen: Option<i64>,
    tunnel_port: Option<u16>,
    tunnel_enabled: bool,
    online: bool,
}

impl DeviceResponse {
    fn from(device: Device, online: bool) -> Self {
        Self {
            id: device.id,
            name: device.name,
            wg_public_key: device.wg_public_key,
            vpn_ip: device.vpn_ip.to_string(),
            username: device.username,
            os: device.os,
            hardware_id: device.hardware_id,
            display_name: device.display_name,
            active: device.active,
            last_seen: device.last_seen,
            tunnel_port: device.tunnel_port,
            tunnel_enabled: device.tunnel_enabled,
            online,
        }
    }
}

async fn list(req: Request<Body>, state: AppState) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let devices = {
        let conn = state.db.lock();
        DeviceRepo::list_by_user(&conn, user.id)?
    };
    let response: Vec<_> = devices.into_iter().map(|d| { let online = state.presence.is_online(d.id); DeviceResponse::from(d, online) }).collect();
    json_response(response)
}

#[derive(Deserialize)]
struct CreateForm {
    name: String,
    wg_public_key: String,
    username: Option<String>,
    os: Option<String>,
    hardware_id: Option<String>,
    display_name: Option<String>,
    proposed_device_id: Option<Uuid>,
}

/// Thin wrapper over `Registrar::register` that also reconciles the kernel peer set:
/// add the new key, and drop the replaced device's old key if this registration replaced one.
async fn create(req: Request<Body>, state: AppState) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let form: CreateForm = form_body(req).await?;

    let outcome = {
        let conn = state.db.lock();
        Registrar::register(
            &conn,
            RegisterRequest {
                user: &user,
                name: &form.name,
                wg_public_key: &form.wg_public_key,
                username: form.username.as_deref(),
                os: form.os.as_deref(),
                hardware_id: form.hardware_id.as_deref(),
                display_name: form.display_name.as_deref(),
                proposed_device_id: form.proposed_device_id,
            },
        )?
    };

    if let Some(old_key) = &outcome.replaced_public_key {
        state.wireguard.remove_peer(old_key)?;
    }
    state.wireguard.add_peer(&outcome.device.wg_public_key, outcome.device.vpn_ip.into())?;

    json_response(DeviceResponse::from(outcome.device, false))
}

async fn get(req: Request<Body>, state: AppState, id: &str) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let device = owned_device(&state, &user, id)?;
    let online = state.presence.is_online(device.id);
    json_response(DeviceResponse::from(device, online))
}

/// Explicit revoke: removes the kernel peer, the device row, and any refresh tokens
/// issued to it. Peer removal happens first so a crash between the two steps never leaves a
/// live peer for a device the store no longer knows about.
async fn revoke(req: Request<Body>, state: AppState, id: &str) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let device = owned_device(&state, &user, id)?;

    state.wireguard.remove_peer(&device.wg_public_key)?;
    let conn = state.db.lock();
    RefreshTokenRepo::revoke_all_for_device(&conn, device.id)?;
    DeviceRepo::delete(&conn, device.id)?;
    status_response(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ConfigForm {
    display_name: Option<String>,
}

async fn update_config(req: Request<Body>, state: AppState, id: &str) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let device = owned_device(&state, &user, id)?;
    let form: ConfigForm = form_body(req).await?;

    let conn = state.db.lock();
    if let Some(display_name) = &form.display_name {
        conn.execute(
            "UPDATE devices SET display_name = ?2 WHERE id = ?1",
            rusqlite::params![device.id.to_string(), display_name],
        )?;
    }
    status_response(StatusCode::NO_CONTENT)
}

/// A heartbeat marks the device seen in the store and online in the presence cache.
async fn heartbeat(req: Request<Body>, state: AppState, id: &str) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let device = owned_device(&state, &user, id)?;

    let conn = state.db.lock();
    DeviceRepo::mark_seen(&conn, device.id)?;
    drop(conn);
    state.presence.mark_online(device.id);
    status_response(StatusCode::NO_CONTENT)
}

async fn set_tunnel_enabled(req: Request<Body>, state: AppState, id: &str, enabled: bool) -> Result<Response<Body>, ServerError> {
    let user = authenticate(&req, &state)?;
    let device = owned_device(&state, &user, id)?;
    let conn = state.db.lock();
    DeviceRepo::set_tunnel_enabled(&conn, device.id, enabled)?;
    status_response(StatusCode::NO_CONTENT)
}
