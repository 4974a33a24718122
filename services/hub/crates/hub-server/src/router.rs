//! HTTP surface: health probe, agent socket and the device command API.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_protocol::{defaults, ttl, validate_command_id, validate_device_id};
use hub_api_types::{ApiErrorBody, CommandResponse, DeviceInfo, DeviceSnapshot, DispatchRequest};
use tower_http::trace::TraceLayer;

use crate::error::{DispatchError, HubError};
use crate::hub::Hub;
use crate::registry::secrets_match;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    /// Bearer token required on `/devices` routes when set.
    pub admin_token: Option<Arc<str>>,
    pub default_command_ttl_secs: u64,
    pub max_command_ttl_secs: u64,
}

impl AppState {
    #[must_use]
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            admin_token: None,
            default_command_ttl_secs: ttl::DEFAULT_COMMAND_SECS,
            max_command_ttl_secs: ttl::MAX_COMMAND_SECS,
        }
    }

    #[must_use]
    pub fn with_admin_token(mut self, token: impl Into<Arc<str>>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    let devices = Router::new()
        .route("/devices/{device_id}", get(get_device).delete(delete_device))
        .route("/devices/{device_id}/commands", post(dispatch_command))
        .route(
            "/devices/{device_id}/commands/{command_id}",
            get(get_command),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route(defaults::AGENT_WS_PATH, get(crate::ws::agent_socket))
        .merge(devices)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ===================================================================
// Errors
// ===================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    /// Storage or actor unavailable; carries the id of a command that was
    /// created and then marked failed.
    Unavailable {
        message: String,
        command_id: Option<String>,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, ApiErrorBody::new(msg)),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, ApiErrorBody::new("unauthorized")),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, ApiErrorBody::new(msg)),
            Self::Conflict(msg) => (StatusCode::CONFLICT, ApiErrorBody::new(msg)),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, ApiErrorBody::new(msg)),
            Self::Unavailable {
                message,
                command_id,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiErrorBody {
                    error: message,
                    command_id,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::InvalidDeviceId(reason) => Self::BadRequest(reason.to_string()),
            other => {
                tracing::warn!(error = %other, "device actor unavailable");
                Self::Unavailable {
                    message: other.to_string(),
                    command_id: None,
                }
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Invalid(e) => Self::Unprocessable(e.to_string()),
            DispatchError::QueueFull { .. } => Self::Conflict(err.to_string()),
            DispatchError::Storage { ref command, .. } => Self::Unavailable {
                command_id: Some(command.command_id.clone()),
                message: err.to_string(),
            },
            DispatchError::Hub(e) => e.into(),
        }
    }
}

// ===================================================================
// Middleware
// ===================================================================

async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(next.run(request).await);
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if secrets_match(token, expected) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!(security = true, path = %request.uri().path(), "rejected device API request");
            Err(ApiError::Unauthorized)
        }
    }
}

// ===================================================================
// Handlers
// ===================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn registered_device(state: &AppState, device_id: &str) -> Result<DeviceInfo, ApiError> {
    validate_device_id(device_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let record = state
        .hub
        .registry()
        .lookup(device_id)
        .await
        .map_err(HubError::from)?;
    record
        .map(|r| r.info())
        .ok_or_else(|| ApiError::NotFound(format!("device {device_id} is not registered")))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceSnapshot>, ApiError> {
    let device = registered_device(&state, &device_id).await?;
    let view = state.hub.view(&device_id).await?;
    Ok(Json(DeviceSnapshot {
        device,
        connection: view.connection,
        status: view.status,
        metrics: view.metrics,
    }))
}

async fn dispatch_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    registered_device(&state, &device_id).await?;

    let ttl_secs = request.ttl_secs.unwrap_or(state.default_command_ttl_secs);
    if ttl_secs == 0 || ttl_secs > state.max_command_ttl_secs {
        return Err(ApiError::Unprocessable(format!(
            "ttl_secs must be between 1 and {}",
            state.max_command_ttl_secs
        )));
    }
    let ttl = i64::try_from(ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| ApiError::Unprocessable(format!("ttl_secs {ttl_secs} is out of range")))?;

    let command = state
        .hub
        .dispatch(&device_id, request.kind, request.payload, ttl)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(CommandResponse { command })))
}

async fn get_command(
    State(state): State<AppState>,
    Path((device_id, command_id)): Path<(String, String)>,
) -> Result<Json<CommandResponse>, ApiError> {
    validate_device_id(&device_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_command_id(&command_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let command = state
        .hub
        .command(&device_id, &command_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("command {command_id} not found")))?;
    Ok(Json(CommandResponse { command }))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_device_id(&device_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.hub.delete(&device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
