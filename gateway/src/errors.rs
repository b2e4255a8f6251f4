use crate::config::ValidationError;
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::{Response, StatusCode};
use resolver::ResolveError;
use resolver::authority::AuthorityError;
use resolver::config::SettingsError;
use serde::Serialize;
use shared::http::{ResponseBody, make_json_response};
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),
    #[error("invalid default datasource settings: {0}")]
    InvalidDefaultDatasource(#[from] SettingsError),
    #[error("metadata authority client error: {0}")]
    Authority(#[from] AuthorityError),
    #[error("could not provision default pool: {0}")]
    DefaultPool(#[from] ResolveError),
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ResponseBody> {
    make_json_response(
        status,
        &ApiErrorResponse {
            error_message: message.into(),
        },
    )
}

/// Maps a failed resolution to the response the client sees.
pub fn resolve_error_response(err: &ResolveError) -> Response<ResponseBody> {
    let status = match err {
        ResolveError::TenantNotFound(_) => StatusCode::NOT_FOUND,
        ResolveError::MetadataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ResolveError::PoolConstructionFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ResolveError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ResolveError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ResolveError::DefaultTenant => StatusCode::BAD_REQUEST,
    };

    let mut response = error_response(status, err.to_string());
    if let ResolveError::MetadataUnavailable(_) = err {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    }
    response
}
