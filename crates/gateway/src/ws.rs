//! WebSocket upgrade handlers for both socket populations the gateway
//! serves: agent hosts (`/ws/host`) and browser clients (`/ws/client`).
//! Both follow the same connection lifecycle — split the socket, spawn an
//! outbound-drain task, process inbound frames on the current task, clean
//! up the registry on disconnect.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use hub_protocol::event::Event;
use hub_protocol::frames::{GatewayFrame, HostFrame};
use hub_protocol::ids::{HostId, SessionId};
use hub_protocol::permission::{PermissionRequestNotice, PermissionResultNotice};
use hub_protocol::session::SessionSummary;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::authenticate_client;
use crate::fanout::{fan_out_event, RoomMessage};
use crate::state::AppState;

/// Frames the gateway sends to a browser client over `/ws/client`. Kept
/// local to this module rather than in `hub-protocol` since it's a
/// presentation-layer contract between the gateway and its own browser
/// clients, not a cross-process contract a host needs to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename = "session:event")]
    SessionEvent(Event),
    #[serde(rename = "permission:request")]
    PermissionRequest(PermissionRequestNotice),
    #[serde(rename = "permission:result")]
    PermissionResult(PermissionResultNotice),
    #[serde(rename = "session:attached")]
    SessionAttached { session_id: SessionId, host_id: HostId },
    #[serde(rename = "session:detached")]
    SessionDetached {
        session_id: SessionId,
        host_id: HostId,
        reason: Option<String>,
    },
    #[serde(rename = "sessions:changed")]
    SessionsChanged {
        host_id: HostId,
        added: Vec<SessionSummary>,
        updated: Vec<SessionSummary>,
        removed: Vec<SessionId>,
    },
    Error { message: String },
}

/// The only frame a browser client sends: an ack for events it has
/// rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientInbound {
    Ack { session_id: SessionId, revision: u64, up_to_seq: u64 },
}

// ─── Host socket ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct HostAuthQuery {
    api_key: Option<String>,
}

pub async fn host_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HostAuthQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let api_key = bearer_or_query(&headers, query.api_key);
    ws.on_upgrade(move |socket| handle_host_connection(socket, state, api_key))
}

fn bearer_or_query(headers: &axum::http::HeaderMap, query_key: Option<String>) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or(query_key)
}

async fn handle_host_connection(socket: WebSocket, state: AppState, api_key: Option<String>) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    let Some(api_key) = api_key else {
        let _ = sink
            .send(Message::Text(serde_json::to_string(&GatewayFrame::CliError {
                code: "AUTH_REQUIRED".into(),
                message: "no API key supplied at connect time".into(),
            }).unwrap().into()))
            .await;
        return;
    };

    let user_id = match crate::auth::authenticate_host(state.identity.as_ref(), &api_key).await {
        Ok(user_id) => user_id,
        Err(err) => {
            let _ = sink
                .send(Message::Text(serde_json::to_string(&GatewayFrame::CliError {
                    code: "INVALID_KEY".into(),
                    message: err.message,
                }).unwrap().into()))
                .await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<GatewayFrame>();
    let outbound_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    error!("failed to serialize gateway frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut host_id: Option<HostId> = None;

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };
        let frame: HostFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!("malformed host frame: {e}");
                continue;
            }
        };
        if let HostFrame::Register { host_id: hid, .. } = &frame {
            host_id = Some(hid.clone());
        }
        handle_host_frame(&state, &socket_id, &user_id, &tx, frame).await;
    }

    info!("host socket {socket_id} disconnected");
    outbound_task.abort();
    state.registry.unregister(&socket_id).await;
    if let Some(hid) = host_id {
        state.router.cancel_pending_for_host(&hid, "host socket disconnected");
    }
}

async fn handle_host_frame(
    state: &AppState,
    socket_id: &str,
    user_id: &str,
    tx: &mpsc::UnboundedSender<GatewayFrame>,
    frame: HostFrame,
) {
    let registry = &state.registry;
    match frame {
        HostFrame::Register { host_id, hostname, backends, default_backend, .. } => {
            registry
                .register(socket_id.to_string(), host_id.clone(), hostname, user_id.to_string(), backends, default_backend, tx.clone())
                .await;
            info!("host {host_id} registered on socket {socket_id}");
        }
        HostFrame::Heartbeat {} => {}
        HostFrame::SessionsList { sessions } => registry.apply_snapshot(socket_id, sessions),
        HostFrame::SessionsChanged(delta) => registry.apply_delta(socket_id, delta),
        HostFrame::SessionsDiscovered { sessions, .. } => registry.add_discovered(socket_id, sessions),
        HostFrame::SessionAttached { session_id, host_id, .. } => {
            state.fanout.broadcast(user_id, RoomMessage::SessionAttached { session_id, host_id });
        }
        HostFrame::SessionDetached { session_id, host_id, reason, .. } => {
            state.fanout.broadcast(user_id, RoomMessage::SessionDetached { session_id, host_id, reason });
        }
        HostFrame::SessionEvent(event) => fan_out_event(&state.fanout, user_id, event, tx),
        HostFrame::PermissionRequest(notice) => state.fanout.broadcast(user_id, RoomMessage::PermissionRequest(notice)),
        HostFrame::PermissionResult(notice) => state.fanout.broadcast(user_id, RoomMessage::PermissionResult(notice)),
        HostFrame::RpcResponse(response) => state.router.resolve_response(&response.request_id, response.outcome),
    }
}

// ─── Client socket ────────────────────────────────────────────

pub async fn client_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, headers: axum::http::HeaderMap) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_connection(socket, state, headers))
}

async fn handle_client_connection(socket: WebSocket, state: AppState, headers: axum::http::HeaderMap) {
    let (mut sink, mut stream) = socket.split();

    let identity = match authenticate_client(state.identity.as_ref(), &headers).await {
        Ok(identity) => identity,
        Err(err) => {
            let _ = sink
                .send(Message::Text(serde_json::to_string(&ClientFrame::Error { message: err.message }).unwrap().into()))
                .await;
            return;
        }
    };

    let socket_id = Uuid::new_v4().to_string();
    let (room_tx, mut room_rx) = mpsc::unbounded_channel::<RoomMessage>();
    state.fanout.join(identity.user_id.clone(), socket_id.clone(), room_tx);

    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = room_rx.recv().await {
            let frame: ClientFrame = msg.into();
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    error!("failed to serialize client frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };
        match serde_json::from_str::<ClientInbound>(&text) {
            Ok(ClientInbound::Ack { session_id, revision, up_to_seq }) => {
                if let Some(entry) = state.registry.find_host_by_session(&session_id) {
                    let _ = entry.tx.send(GatewayFrame::EventsAck { session_id, revision, up_to_seq });
                }
            }
            Err(e) => warn!("malformed client frame: {e}"),
        }
    }

    outbound_task.abort();
    state.fanout.leave(&identity.user_id, &socket_id);
}
