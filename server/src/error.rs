use std::convert::TryFrom;

use hyper::{Body, Response, StatusCode};
use thiserror::Error;

/// Error kinds and their HTTP mapping.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("bad request: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("gone")]
    Gone,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("exhausted: {0}")]
    Exhausted(&'static str),

    #[error("internal database error")]
    Database(#[from] rusqlite::Error),

    #[error("internal WireGuard error")]
    WireGuard,

    #[error("internal I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing/serialization error")]
    Json(#[from] serde_json::Error),

    #[error("generic HTTP error")]
    Http(#[from] hyper::http::Error),

    #[error("generic Hyper error")]
    Hyper(#[from] hyper::Error),
}

impl From<&ServerError> for StatusCode {
    fn from(error: &ServerError) -> StatusCode {
        use ServerError::*;
        match error {
            Validation(_) | Json(_) => StatusCode::BAD_REQUEST,
            NotFound => StatusCode::NOT_FOUND,
            Gone => StatusCode::GONE,
            Conflict(_) => StatusCode::CONFLICT,
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden => StatusCode::FORBIDDEN,
            // Special-case the constraint violation situation, same as a validation error.
            Database(rusqlite::Error::SqliteFailure(libsqlite3_sys::Error { code, .. }, ..))
                if *code == libsqlite3_sys::ErrorCode::ConstraintViolation =>
            {
                StatusCode::BAD_REQUEST
            },
            Database(rusqlite::Error::QueryReturnedNoRows) => StatusCode::NOT_FOUND,
            Exhausted(_) | WireGuard | Io(_) | Database(_) | Http(_) | Hyper(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }
}

impl ServerError {
    /// The message sent to the client. AuthFailure kinds never leak detail.
    fn public_message(&self) -> String {
        match self {
            ServerError::Unauthorized | ServerError::Forbidden => "unauthorized".to_string(),
            other => other.to_string(),
        }
    }
}

impl TryFrom<ServerError> for Response<Body> {
    type Error = hyper::http::Error;

    fn try_from(e: ServerError) -> Result<Self, Self::Error> {
        if matches!(StatusCode::from(&e), StatusCode::INTERNAL_SERVER_ERROR) {
            log::error!("request failed: {}", e);
        }
        let body = serde_json::json!({ "error": e.public_message() }).to_string();
        Response::builder()
            .status(StatusCode::from(&e))
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
    }
}
