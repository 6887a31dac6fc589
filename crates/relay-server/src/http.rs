//! HTTP request handlers
//!
//! Thin wrappers over the coordinators: parse the request, call one
//! operation, map the domain error to a status code.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use relay_auth::{
    BrowserExtension, MobileDevice, NewDevice, NewExtension, PairedDevice, PairedExtension,
    PairingDescriptor, TokenRequest,
};
use relay_core::{CloseStatus, DeviceId, Error, ExtensionId, TokenRequestId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error};

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Mobile device API
        .route("/mobile/devices", post(register_device_handler))
        .route("/mobile/devices/:device_id", delete(remove_device_handler))
        .route(
            "/mobile/devices/:device_id/browser_extensions",
            post(pair_handler).get(device_extensions_handler),
        )
        .route(
            "/mobile/devices/:device_id/browser_extensions/2fa_requests",
            get(pending_requests_handler),
        )
        .route(
            "/mobile/devices/:device_id/browser_extensions/:extension_id",
            delete(unpair_handler),
        )
        .route(
            "/mobile/devices/:device_id/commands/send_2fa_token",
            post(send_token_handler),
        )
        // Browser extension API
        .route("/browser_extensions", post(register_extension_handler))
        .route("/browser_extensions/:extension_id", delete(remove_extension_handler))
        .route(
            "/browser_extensions/:extension_id/devices",
            get(extension_devices_handler),
        )
        .route(
            "/browser_extensions/:extension_id/commands/request_2fa_token",
            post(request_token_handler),
        )
        .route(
            "/browser_extensions/:extension_id/2fa_requests/:request_id",
            get(get_request_handler),
        )
        .route(
            "/browser_extensions/:extension_id/2fa_requests/:request_id/commands/close_2fa_request",
            post(close_request_handler),
        )
        // WebSocket endpoints
        .route("/ws/mobile/devices/:device_id", get(crate::websocket::device_ws_handler))
        .route(
            "/ws/browser_extensions/:extension_id",
            get(crate::websocket::extension_ws_handler),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// Domain error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Expired(_) => StatusCode::GONE,
            Error::Validation(_) | Error::InvalidPublicKey(_) => StatusCode::BAD_REQUEST,
            Error::Transport(_) | Error::Storage(_) | Error::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.0.to_string();
        if status.is_server_error() {
            error!(code = status.as_u16(), %message, "API error");
        } else {
            debug!(code = status.as_u16(), %message, "Client error");
        }
        (
            status,
            Json(ErrorBody {
                code: status.as_u16(),
                message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Number of live channel hubs
    pub channels: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        channels: state.registry.len(),
    })
}

// ============================================================================
// Mobile Device Handlers
// ============================================================================

async fn register_device_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewDevice>,
) -> ApiResult<(StatusCode, Json<MobileDevice>)> {
    let device = state.directory.register_device(request).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn remove_device_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<DeviceId>,
) -> ApiResult<StatusCode> {
    state.directory.remove_device(device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of a pairing request
#[derive(Debug, Deserialize)]
pub struct PairRequest {
    pub extension_id: ExtensionId,
    pub device_public_key: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

async fn pair_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<DeviceId>,
    Json(request): Json<PairRequest>,
) -> ApiResult<Json<PairingDescriptor>> {
    let pairing = state
        .pair(
            device_id,
            request.extension_id,
            &request.device_public_key,
            request.device_name.as_deref(),
        )
        .await?;
    Ok(Json(pairing))
}

async fn device_extensions_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<DeviceId>,
) -> ApiResult<Json<Vec<PairedExtension>>> {
    Ok(Json(state.pairings.extensions_for_device(device_id).await?))
}

async fn unpair_handler(
    State(state): State<Arc<AppState>>,
    Path((device_id, extension_id)): Path<(DeviceId, ExtensionId)>,
) -> ApiResult<StatusCode> {
    state.pairings.unpair(device_id, extension_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pending_requests_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<DeviceId>,
) -> ApiResult<Json<Vec<TokenRequest>>> {
    Ok(Json(state.requests.list_pending(device_id).await?))
}

/// Body of a device's answer
#[derive(Debug, Deserialize)]
pub struct SendTokenRequest {
    pub token_request_id: TokenRequestId,
    pub extension_id: ExtensionId,
    pub token: String,
}

async fn send_token_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<DeviceId>,
    Json(request): Json<SendTokenRequest>,
) -> ApiResult<StatusCode> {
    // resolve through the extension so a mismatched pair reads as not found
    state
        .requests
        .get(request.extension_id, request.token_request_id)
        .await?;
    state
        .requests
        .respond(request.token_request_id, device_id, &request.token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Browser Extension Handlers
// ============================================================================

async fn register_extension_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewExtension>,
) -> ApiResult<(StatusCode, Json<BrowserExtension>)> {
    let extension = state.directory.register_extension(request).await?;
    Ok((StatusCode::CREATED, Json(extension)))
}

async fn remove_extension_handler(
    State(state): State<Arc<AppState>>,
    Path(extension_id): Path<ExtensionId>,
) -> ApiResult<StatusCode> {
    state.directory.remove_extension(extension_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn extension_devices_handler(
    State(state): State<Arc<AppState>>,
    Path(extension_id): Path<ExtensionId>,
) -> ApiResult<Json<Vec<PairedDevice>>> {
    Ok(Json(state.pairings.devices_for_extension(extension_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RequestTokenRequest {
    pub domain: String,
}

/// Response to a token request
#[derive(Debug, Serialize)]
pub struct RequestTokenResponse {
    pub token_request_id: TokenRequestId,
}

async fn request_token_handler(
    State(state): State<Arc<AppState>>,
    Path(extension_id): Path<ExtensionId>,
    Json(request): Json<RequestTokenRequest>,
) -> ApiResult<(StatusCode, Json<RequestTokenResponse>)> {
    let created = state.requests.create(extension_id, &request.domain).await?;
    Ok((
        StatusCode::CREATED,
        Json(RequestTokenResponse {
            token_request_id: created.id,
        }),
    ))
}

async fn get_request_handler(
    State(state): State<Arc<AppState>>,
    Path((extension_id, request_id)): Path<(ExtensionId, TokenRequestId)>,
) -> ApiResult<Json<TokenRequest>> {
    Ok(Json(state.requests.get(extension_id, request_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CloseRequestBody {
    pub status: CloseStatus,
}

async fn close_request_handler(
    State(state): State<Arc<AppState>>,
    Path((extension_id, request_id)): Path<(ExtensionId, TokenRequestId)>,
    Json(body): Json<CloseRequestBody>,
) -> ApiResult<StatusCode> {
    state
        .requests
        .close(extension_id, request_id, body.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
