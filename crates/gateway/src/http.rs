//! REST endpoints for client → gateway control operations:
//! create/close/cancel/mode/model/message/permission-decision plus
//! filesystem and Git inspection, all translated into a Session Router
//! RPC and returned with the fixed error-to-status mapping.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hub_protocol::ids::SessionId;
use hub_protocol::rpc::{
    DiscoverParams, FsEntriesParams, FsFileParams, GitFileDiffParams, GitStatusParams, MessageSendParams,
    PermissionDecisionParams, RpcMethod, SessionCreateParams, SessionIdParams, SessionSetModeParams, SessionSetModelParams,
};
use hub_protocol::HubError;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{authenticate_client, identify_client_optional};
use crate::state::AppState;

/// Wraps a [`HubError`] so it serializes as the fixed `{error: {...}}`
/// envelope with the matching HTTP status.
struct ApiError(HubError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::json!({ "error": self.0 }))).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        ApiError(e)
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/whoami", get(whoami))
        .route("/sessions", post(create_session))
        .route("/sessions/discover", get(discover_sessions))
        .route("/sessions/{session_id}", post(close_session).delete(close_session))
        .route("/sessions/{session_id}/cancel", post(cancel_session))
        .route("/sessions/{session_id}/mode", post(set_mode))
        .route("/sessions/{session_id}/model", post(set_model))
        .route("/sessions/{session_id}/message", post(send_message))
        .route("/sessions/{session_id}/permission", post(permission_decision))
        .route("/sessions/{session_id}/load", post(load_session))
        .route("/sessions/{session_id}/reload", post(reload_session))
        .route("/fs/roots", get(fs_roots))
        .route("/fs/entries", get(fs_entries))
        .route("/fs/file", get(fs_file))
        .route("/git/status", get(git_status))
        .route("/git/file-diff", get(git_file_diff))
}

async fn caller(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    Ok(authenticate_client(state.identity.as_ref(), headers).await?.user_id)
}

/// The one optional-auth endpoint: surfaces the caller's user id when a
/// bearer token or session cookie is present, never fails when it isn't.
async fn whoami(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let identity = identify_client_optional(state.identity.as_ref(), &headers).await;
    Json(serde_json::json!({ "userId": identity.map(|i| i.user_id) }))
}

async fn create_session(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<SessionCreateParams>) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = state.router.resolve_host(body.host_id.as_ref(), &user_id).await?;
    let result = state.router.call(&target, RpcMethod::SessionCreate, serde_json::to_value(body).unwrap()).await?;
    Ok(Json(result))
}

async fn discover_sessions(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<DiscoverParams>) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = state.router.resolve_host(params.host_id.as_ref(), &user_id).await?;
    let result = state.router.call(&target, RpcMethod::SessionsDiscover, serde_json::to_value(params).unwrap()).await?;
    Ok(Json(result))
}

async fn dispatch_session_scoped(
    state: &AppState,
    headers: &HeaderMap,
    session_id: &SessionId,
    method: RpcMethod,
    params: Value,
) -> Result<Value, ApiError> {
    let user_id = caller(state, headers).await?;
    let target = state.router.resolve_session_host(session_id, &user_id)?;
    Ok(state.router.call(&target, method, params).await?)
}

async fn close_session(State(state): State<AppState>, headers: HeaderMap, Path(session_id): Path<SessionId>) -> Result<Json<Value>, ApiError> {
    let params = serde_json::to_value(SessionIdParams { session_id: session_id.clone() }).unwrap();
    let result = dispatch_session_scoped(&state, &headers, &session_id, RpcMethod::SessionClose, params).await?;
    Ok(Json(result))
}

async fn cancel_session(State(state): State<AppState>, headers: HeaderMap, Path(session_id): Path<SessionId>) -> Result<Json<Value>, ApiError> {
    let params = serde_json::to_value(SessionIdParams { session_id: session_id.clone() }).unwrap();
    let result = dispatch_session_scoped(&state, &headers, &session_id, RpcMethod::SessionCancel, params).await?;
    Ok(Json(result))
}

async fn load_session(State(state): State<AppState>, headers: HeaderMap, Path(session_id): Path<SessionId>) -> Result<Json<Value>, ApiError> {
    let params = serde_json::to_value(SessionIdParams { session_id: session_id.clone() }).unwrap();
    let result = dispatch_session_scoped(&state, &headers, &session_id, RpcMethod::SessionLoad, params).await?;
    Ok(Json(result))
}

async fn reload_session(State(state): State<AppState>, headers: HeaderMap, Path(session_id): Path<SessionId>) -> Result<Json<Value>, ApiError> {
    let params = serde_json::to_value(SessionIdParams { session_id: session_id.clone() }).unwrap();
    let result = dispatch_session_scoped(&state, &headers, &session_id, RpcMethod::SessionReload, params).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct SetModeBody {
    mode_id: String,
}

async fn set_mode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<SessionId>,
    Json(body): Json<SetModeBody>,
) -> Result<Json<Value>, ApiError> {
    let params = serde_json::to_value(SessionSetModeParams { session_id: session_id.clone(), mode_id: body.mode_id }).unwrap();
    let result = dispatch_session_scoped(&state, &headers, &session_id, RpcMethod::SessionMode, params).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct SetModelBody {
    model_id: String,
}

async fn set_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<SessionId>,
    Json(body): Json<SetModelBody>,
) -> Result<Json<Value>, ApiError> {
    let params = serde_json::to_value(SessionSetModelParams { session_id: session_id.clone(), model_id: body.model_id }).unwrap();
    let result = dispatch_session_scoped(&state, &headers, &session_id, RpcMethod::SessionModel, params).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct SendMessageBody {
    prompt: Vec<hub_protocol::rpc::PromptBlock>,
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<SessionId>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<Value>, ApiError> {
    let params = serde_json::to_value(MessageSendParams { session_id: session_id.clone(), prompt: body.prompt }).unwrap();
    let result = dispatch_session_scoped(&state, &headers, &session_id, RpcMethod::MessageSend, params).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct PermissionDecisionBody {
    request_id: String,
    outcome: hub_protocol::permission::PermissionOutcome,
}

/// Returns `ok` as soon as the decision is forwarded; delivery to the
/// agent is best-effort, the true confirmation arrives as a
/// `permission_result` event over the client socket.
async fn permission_decision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<SessionId>,
    Json(body): Json<PermissionDecisionBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = state.router.resolve_session_host(&session_id, &user_id)?;
    let params = PermissionDecisionParams {
        session_id: session_id.clone(),
        request_id: body.request_id,
        outcome: body.outcome,
    };
    state
        .router
        .forward_fire_and_forget(&target, RpcMethod::PermissionDecision, serde_json::to_value(params).unwrap())
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn fs_roots(State(state): State<AppState>, headers: HeaderMap, Query(host_id): Query<HostIdQuery>) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = state.router.resolve_host(host_id.host_id.as_ref(), &user_id).await?;
    let result = state.router.call(&target, RpcMethod::HostFsRoots, Value::Null).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct HostIdQuery {
    host_id: Option<String>,
}

async fn fs_entries(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<FsEntriesParams>) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = fs_git_target(&state, &user_id, params.session_id.as_deref()).await?;
    let result = state.router.call(&target, RpcMethod::FsEntries, serde_json::to_value(params).unwrap()).await?;
    Ok(Json(result))
}

async fn fs_file(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<FsFileParams>) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = fs_git_target(&state, &user_id, params.session_id.as_deref()).await?;
    let result = state.router.call(&target, RpcMethod::FsFile, serde_json::to_value(params).unwrap()).await?;
    Ok(Json(result))
}

async fn git_status(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<GitStatusParams>) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = fs_git_target(&state, &user_id, params.session_id.as_deref()).await?;
    let result = state.router.call(&target, RpcMethod::GitStatus, serde_json::to_value(params).unwrap()).await?;
    Ok(Json(result))
}

async fn git_file_diff(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<GitFileDiffParams>) -> Result<Json<Value>, ApiError> {
    let user_id = caller(&state, &headers).await?;
    let target = fs_git_target(&state, &user_id, params.session_id.as_deref()).await?;
    let result = state.router.call(&target, RpcMethod::GitFileDiff, serde_json::to_value(params).unwrap()).await?;
    Ok(Json(result))
}

/// Filesystem and Git calls carry an optional `sessionId`; when present
/// they route like any other session-scoped call, otherwise they fall
/// back to the caller's first connected host.
async fn fs_git_target(state: &AppState, user_id: &str, session_id: Option<&str>) -> Result<crate::registry::HostEntry, HubError> {
    match session_id {
        Some(sid) => state.router.resolve_session_host(sid, &user_id.to_string()),
        None => state.router.resolve_host(None, &user_id.to_string()).await,
    }
}
