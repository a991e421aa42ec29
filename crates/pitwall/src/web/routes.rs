//! HTTP handlers and error mapping

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::WebState;
use crate::command::{CommandAck, CommandId, ProfileOrigin};
use crate::error::{ControlError, StreamErrorReason};
use crate::protocol::{now_ms, TRUCK_TOKEN_HEADER};
use crate::state::{Heartbeat, StreamController};
use crate::vehicle::VehicleKey;

/// JSON error body: `{error, reason, hint}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    reason: Option<StreamErrorReason>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            reason: None,
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Missing or invalid credentials")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        let status = match &e {
            ControlError::InvalidCamera(_)
            | ControlError::InvalidProfile(_)
            | ControlError::CameraUnavailable(_)
            | ControlError::UnknownCommand(_)
            | ControlError::InvalidParams { .. } => StatusCode::BAD_REQUEST,
            ControlError::VehicleNotRegistered(_) => StatusCode::NOT_FOUND,
            ControlError::EdgeOffline(_) | ControlError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            ControlError::EncoderKeyNotConfigured(_) => StatusCode::PRECONDITION_FAILED,
            ControlError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        Self {
            status,
            error: e.to_string(),
            reason: Some(e.reason()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.error,
            "reason": self.reason,
            "hint": self.reason.map(StreamErrorReason::remediation),
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub(super) fn require_admin(
    state: &WebState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected) = &state.admin_token else {
        return Ok(());
    };
    match bearer(headers).or(query_token) {
        Some(given) if given == expected.expose() => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

/// Resolve the calling edge from its truck token.
pub(super) fn edge_identity(state: &WebState, headers: &HeaderMap) -> Result<VehicleKey, ApiError> {
    let token = headers
        .get(TRUCK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(ApiError::unauthorized)?;
    state
        .plane
        .authenticate_edge(token)
        .ok_or_else(ApiError::unauthorized)
}

#[derive(Debug, Deserialize)]
pub struct VehicleBody {
    event_id: String,
    vehicle_id: String,
}

impl VehicleBody {
    fn key(&self) -> VehicleKey {
        VehicleKey::new(self.event_id.as_str(), self.vehicle_id.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct SwitchCameraBody {
    #[serde(flatten)]
    vehicle: VehicleBody,
    camera: String,
}

#[derive(Debug, Deserialize)]
pub struct SwitchProfileBody {
    #[serde(flatten)]
    vehicle: VehicleBody,
    profile: String,
}

#[derive(Debug, Deserialize)]
pub struct StartBody {
    #[serde(flatten)]
    vehicle: VehicleBody,
    camera: String,
    #[serde(default)]
    controller: StreamController,
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    #[serde(flatten)]
    vehicle: VehicleBody,
    #[serde(default)]
    controller: StreamController,
}

#[derive(Debug, Deserialize)]
pub struct CommandBody {
    #[serde(flatten)]
    vehicle: VehicleBody,
    command: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    controller: StreamController,
}

#[derive(Debug, Deserialize)]
pub struct ProfileRequestBody {
    profile: String,
}

/// POST /api/stream/switch-camera
pub async fn switch_camera(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<SwitchCameraBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    let ticket = state
        .plane
        .switch_camera(&body.vehicle.key(), &body.camera, now_ms())?;
    Ok(Json(json!(ticket)))
}

/// POST /api/stream/switch-profile
pub async fn switch_profile(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<SwitchProfileBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    let ticket = state.plane.switch_profile(
        &body.vehicle.key(),
        &body.profile,
        ProfileOrigin::Manual,
        now_ms(),
    )?;
    Ok(Json(json!(ticket)))
}

/// POST /api/stream/start
pub async fn start_stream(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    let id = state
        .plane
        .start_stream(&body.vehicle.key(), &body.camera, body.controller, now_ms())?;
    Ok(Json(json!({ "command_id": id, "status": "pending" })))
}

/// POST /api/stream/stop
pub async fn stop_stream(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<StopBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    let id = state
        .plane
        .stop_stream(&body.vehicle.key(), body.controller, now_ms())?;
    Ok(Json(json!({ "command_id": id, "status": "pending" })))
}

/// POST /api/stream/retry
pub async fn retry(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<VehicleBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    let stream = state.plane.retry(&body.key(), now_ms())?;
    Ok(Json(json!(stream)))
}

/// POST /api/stream/command
pub async fn dispatch(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    let dispatched = state.plane.dispatch(
        &body.vehicle.key(),
        &body.command,
        &body.params,
        body.controller,
        now_ms(),
    )?;
    Ok(Json(json!(dispatched)))
}

/// GET /api/stream/status?event_id=..&vehicle_id=..
pub async fn status(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Query(query): Query<VehicleBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    let status = state.plane.status(&query.key(), now_ms())?;
    Ok(Json(json!(status)))
}

/// GET /api/commands/{id}
pub async fn command(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    state
        .plane
        .command(&CommandId(id.clone()), now_ms())
        .map(|record| Json(json!(record)))
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("No command '{}'", id)))
}

/// POST /api/featured
pub async fn featured(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<VehicleBody>,
) -> ApiResult {
    require_admin(&state, &headers, None)?;
    state.plane.feature(&body.key())?;
    Ok(Json(json!({ "ok": true })))
}

/// POST /api/edge/heartbeat
pub async fn edge_heartbeat(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(hb): Json<Heartbeat>,
) -> ApiResult {
    let key = edge_identity(&state, &headers)?;
    let stream = state.plane.handle_heartbeat(&key, hb, now_ms());
    Ok(Json(json!({ "ok": true, "state": stream.state })))
}

/// POST /api/edge/command-response
///
/// Always answers 200 for an authenticated edge: stale and unknown ACKs are
/// normal under network flaps and are only logged.
pub async fn edge_command_response(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(ack): Json<CommandAck>,
) -> ApiResult {
    let key = edge_identity(&state, &headers)?;
    let now = now_ms();

    if let Some(record) = state.plane.command(&ack.command_id, now) {
        if record.vehicle != key {
            warn!(
                vehicle = %key,
                command_id = %ack.command_id,
                owner = %record.vehicle,
                "Edge acknowledged another vehicle's command"
            );
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "Command belongs to another vehicle",
            ));
        }
    }

    let accepted = state.plane.handle_ack(&ack, now).is_some();
    debug!(vehicle = %key, command_id = %ack.command_id, accepted, "Command response");
    Ok(Json(json!({ "ok": true, "accepted": accepted })))
}

/// POST /api/edge/profile-request
pub async fn edge_profile_request(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(body): Json<ProfileRequestBody>,
) -> ApiResult {
    let key = edge_identity(&state, &headers)?;
    let ticket = state
        .plane
        .switch_profile(&key, &body.profile, ProfileOrigin::Auto, now_ms())?;
    Ok(Json(json!(ticket)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_errors_map_to_status_codes() {
        let cases = [
            (ControlError::InvalidCamera("x".into()), StatusCode::BAD_REQUEST),
            (
                ControlError::VehicleNotRegistered("e/v".into()),
                StatusCode::NOT_FOUND,
            ),
            (ControlError::EdgeOffline("e/v".into()), StatusCode::CONFLICT),
            (
                ControlError::EncoderKeyNotConfigured("e/v".into()),
                StatusCode::PRECONDITION_FAILED,
            ),
            (
                ControlError::RateLimited { retry_after_ms: 10 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError::from(err).status(), code);
        }
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        assert_eq!(bearer(&headers), Some("s3cret"));
    }
}
