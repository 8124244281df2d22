pub mod devices;
pub mod tunnel;

use crate::db::user::{User, UserRepo};
use crate::{AppState, ServerError};
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{http, Body, Method, Request, Response, StatusCode};
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use uuid::Uuid;

/// Claims minted by the (external) auth glue; the core only ever verifies them, never issues
/// them; the auth-code/JWT-issuance flow is external glue this crate doesn't own. `sub` is
/// the authenticated user's id.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: Uuid,
}

pub(crate) async fn hyper_service(
    req: Request<Body>,
    state: AppState,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, http::Error> {
    if *req.method() == Method::OPTIONS {
        return preflight();
    }
    let components: VecDeque<_> = req.uri().path().trim_start_matches('/').split('/').map(String::from).collect();
    let result = routes(req, state, remote_addr, components).await.or_else(TryInto::try_into);
    result.map(with_cors)
}

async fn routes(
    req: Request<Body>,
    state: AppState,
    _remote_addr: SocketAddr,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    match components.pop_front().as_deref() {
        Some("health") => crate::util::json_response(serde_json::json!({ "status": "healthy" })),
        Some("api") => match components.pop_front().as_deref() {
            Some("tunnel") => tunnel::routes(req, state, components).await,
            Some("devices") => devices::routes(req, state, components).await,
            _ => Err(ServerError::NotFound),
        },
        _ => Err(ServerError::NotFound),
    }
}

fn preflight() -> Result<Response<Body>, http::Error> {
    with_cors_builder(Response::builder().status(StatusCode::OK)).body(Body::empty())
}

fn with_cors(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert("access-control-allow-methods", HeaderValue::from_static("GET, POST, PATCH, DELETE, OPTIONS"));
    headers.insert("access-control-allow-headers", HeaderValue::from_static("Content-Type, Authorization"));
    response
}

fn with_cors_builder(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "GET, POST, PATCH, DELETE, OPTIONS")
        .header("access-control-allow-headers", "Content-Type, Authorization")
}

/// Verifies the bearer JWT and resolves it to the active user it names. A bad JWT is an
/// `AuthFailure`, surfaced as 401 with no detail.
pub(crate) fn authenticate(req: &Request<Body>, state: &AppState) -> Result<User, ServerError> {
    let header = req.headers().get(AUTHORIZATION).ok_or(ServerError::Unauthorized)?;
    let header = header.to_str().map_err(|_| ServerError::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(ServerError::Unauthorized)?;

    let decoded = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.mesh.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ServerError::Unauthorized)?;

    let conn = state.db.lock();
    let user = UserRepo::get(&conn, decoded.claims.sub).map_err(|e| match e {
        ServerError::NotFound => ServerError::Unauthorized,
        e => e,
    })?;
    if !user.active {
        return Err(ServerError::Unauthorized);
    }
    Ok(user)
}

/// A device path component, parsed and checked for ownership so route handlers never act on
/// another user's device. Ownership mismatches read as `NotFound`, same as a nonexistent id.
pub(crate) fn owned_device(
    state: &AppState,
    user: &User,
    id: &str,
) -> Result<crate::db::device::Device, ServerError> {
    let id = Uuid::parse_str(id).map_err(|_| ServerError::Validation("invalid device id".into()))?;
    let conn = state.db.lock();
    let device = crate::db::device::DeviceRepo::get(&conn, id)?;
    if device.user_id != user.id {
        return Err(ServerError::NotFound);
    }
    Ok(device)
}
