use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, info};

use super::AppState;
use crate::error::SiteManagerError;
use crate::sitemanager::{HealthResponse, HealthStatus, ModeChangeRequest, SiteManagerStatus};

/// Failures surfaced to HTTP callers. Bodies are plain text.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Internal(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl From<SiteManagerError> for ApiError {
    fn from(e: SiteManagerError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
        }
    }
}

fn parse_request(body: &[u8]) -> Result<ModeChangeRequest, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        error!(error = %e, "Failed to parse site manager request");
        ApiError::Internal(e.to_string())
    })
}

pub async fn get_site_manager(
    State(state): State<AppState>,
) -> Result<Json<SiteManagerStatus>, ApiError> {
    info!("Site Manager: get status");
    Ok(Json(state.site.current().await?))
}

pub async fn post_site_manager(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SiteManagerStatus>, ApiError> {
    let req = parse_request(&body)?;
    Ok(Json(state.site.handle_request(req).await?))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = state.backend.health().await;
    let code = match status {
        HealthStatus::Down => StatusCode::INTERNAL_SERVER_ERROR,
        HealthStatus::Up | HealthStatus::Degraded => StatusCode::OK,
    };
    (code, Json(HealthResponse { status }))
}

pub async fn get_pre_configure(State(state): State<AppState>) -> Result<Response, ApiError> {
    let Some(pre) = state.pre_configure else {
        return Ok(StatusCode::OK.into_response());
    };
    Ok(Json(pre.current().await?).into_response())
}

pub async fn post_pre_configure(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Some(pre) = state.pre_configure else {
        return Ok(StatusCode::OK.into_response());
    };
    let req = parse_request(&body)?;
    info!(mode = %req.mode, "Pre-configure requested");
    Ok(Json(pre.handle_request(req).await?).into_response())
}
