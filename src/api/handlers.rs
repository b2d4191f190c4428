use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::Role;
use crate::status::PrimaryStatus;

use super::error::ApiError;
use super::AppState;

#[derive(Deserialize)]
pub(super) struct CreateSessionRequest {
    name: String,
}

#[derive(Serialize)]
pub(super) struct CreateSessionResponse {
    status: &'static str,
    admin_code: String,
    vehicle_code: String,
    staffelfuehrer_code: String,
}

/// Create a session and issue its three access codes.
pub(super) async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Json<CreateSessionResponse> {
    let codes = state.manager.registry().create_session(&req.name);
    Json(CreateSessionResponse {
        status: "success",
        admin_code: codes.session,
        vehicle_code: codes.vehicle,
        staffelfuehrer_code: codes.leader,
    })
}

pub(super) async fn session_info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .manager
        .registry()
        .get(&code)
        .ok_or(ApiError::SessionNotFound)?;
    Ok(Json(json!({
        "status": "success",
        "name": session.name,
        "vehicle_code": session.vehicle_code,
        "staffelfuehrer_code": session.leader_code,
    })))
}

pub(super) async fn leader_info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (session, role) = state
        .manager
        .registry()
        .resolve(&code)
        .map_err(|_| ApiError::InvalidCode)?;
    if role != Role::Leader {
        return Err(ApiError::Unauthorized);
    }
    Ok(Json(json!({ "status": "success", "name": session.name })))
}

#[derive(Deserialize)]
pub(super) struct StatusInfoQuery {
    code: String,
    #[allow(dead_code)]
    name: Option<String>,
}

pub(super) async fn status_info(
    State(state): State<AppState>,
    Query(query): Query<StatusInfoQuery>,
) -> Result<Json<Value>, ApiError> {
    let (session, role) = state
        .manager
        .registry()
        .resolve(&query.code)
        .map_err(|_| ApiError::InvalidCode)?;
    // The primary code is not a vehicle entry point.
    if role == Role::Dispatcher {
        return Err(ApiError::InvalidCode);
    }
    Ok(Json(json!({ "status": "success", "leitstelle_name": session.name })))
}

#[derive(Deserialize)]
pub(super) struct MessageRequest {
    message: String,
    #[serde(default)]
    target_name: Option<String>,
}

/// Send a free-text message to one or all vehicles. The sender tag comes
/// from the code used: the primary code speaks as "LS", the secondary
/// codes as "SF".
pub(super) async fn send_message(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let (session, role) = state
        .manager
        .registry()
        .resolve(&code)
        .map_err(|_| ApiError::InvalidCode)?;
    let sender = if role == Role::Dispatcher { "LS" } else { "SF" };
    state
        .manager
        .send_message(&session, sender, req.target_name.as_deref(), &req.message)
        .await;
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Deserialize)]
pub(super) struct ChatHistoryQuery {
    target_name: String,
}

pub(super) async fn chat_history(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<ChatHistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let (session, _) = state
        .manager
        .registry()
        .resolve(&code)
        .map_err(|_| ApiError::InvalidCode)?;
    let messages = state.manager.chat_history(&session, &query.target_name).await;
    Ok(Json(json!({ "status": "success", "messages": messages })))
}

#[derive(Deserialize)]
pub(super) struct TargetRequest {
    target_name: String,
}

pub(super) async fn clear_special(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .manager
        .registry()
        .get(&code)
        .ok_or(ApiError::SessionNotFound)?;
    state
        .manager
        .clear_special(&session, &req.target_name)
        .await
        .map_err(|_| ApiError::VehicleNotFound)?;
    Ok(Json(json!({ "status": "success" })))
}

pub(super) async fn clear_short_status(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .manager
        .registry()
        .get(&code)
        .ok_or(ApiError::SessionNotFound)?;
    state
        .manager
        .clear_short_status(&session, &req.target_name)
        .await
        .map_err(|_| ApiError::VehicleNotFound)?;
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Deserialize)]
pub(super) struct NoteRequest {
    target_name: String,
    note: String,
}

/// Update the note for an identity. The primary code writes the
/// dispatcher note, secondary codes write the leader note.
pub(super) async fn update_note(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<NoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let (session, role) = state
        .manager
        .registry()
        .resolve(&code)
        .map_err(|_| ApiError::InvalidCode)?;
    let leader = role != Role::Dispatcher;
    state
        .manager
        .update_note(&session, &req.target_name, &req.note, leader)
        .await;
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Deserialize)]
pub(super) struct SetStatusRequest {
    target_name: String,
    status: String,
}

/// Dispatcher override: set a vehicle's status directly.
pub(super) async fn set_status(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .manager
        .registry()
        .get(&code)
        .ok_or(ApiError::SessionNotFound)?;
    let status: PrimaryStatus = serde_json::from_value(Value::String(req.status.clone()))
        .map_err(|_| ApiError::InvalidStatus(req.status.clone()))?;
    state
        .manager
        .set_status_direct(&session, &req.target_name, status)
        .await
        .map_err(|_| ApiError::VehicleNotFound)?;
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Deserialize)]
pub(super) struct NoticeRequest {
    target_name: String,
    text: String,
}

/// Leader: create a pending notice for a vehicle. Requires the leader
/// code specifically.
pub(super) async fn create_notice(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<NoticeRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = resolve_leader(&state, &code)?;
    state
        .manager
        .create_notice(&session, &req.target_name, &req.text)
        .await;
    Ok(Json(json!({ "status": "success" })))
}

/// Leader: acknowledge (remove) a vehicle's notice.
pub(super) async fn acknowledge_notice(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = resolve_leader(&state, &code)?;
    state
        .manager
        .acknowledge_notice(&session, &req.target_name)
        .await
        .map_err(|_| ApiError::NoticeNotFound)?;
    Ok(Json(json!({ "status": "success" })))
}

fn resolve_leader(
    state: &AppState,
    code: &str,
) -> Result<std::sync::Arc<crate::session::Session>, ApiError> {
    let (session, role) = state
        .manager
        .registry()
        .resolve(code)
        .map_err(|_| ApiError::InvalidCode)?;
    if role != Role::Leader {
        return Err(ApiError::Unauthorized);
    }
    Ok(session)
}
