//! The Session Supervisor : per-host orchestrator sitting
//! between Agent Links and the Event Log, and the target of every RPC the
//! gateway forwards down to this host.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use hub_protocol::event::{Event, EventKind};
use hub_protocol::ids::{BackendId, HostId, RequestId, SessionId, UserId};
use hub_protocol::permission::{PermissionOutcome, PermissionRequestNotice, PermissionResultNotice};
use hub_protocol::session::{AgentState, Session, SessionSummary};
use hub_protocol::HubError;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::agent_link::{AgentLink, AgentMessage, IdlePool};
use crate::backend::BackendRegistry;
use crate::event_log::EventLog;

/// Everything the Supervisor pushes outward; the Host Uplink drains this
/// channel and maps each variant onto a `HostFrame`.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    SessionAdded(SessionSummary),
    SessionUpdated(SessionSummary),
    SessionRemoved(SessionId),
    SessionAttached { session_id: SessionId, host_id: HostId },
    SessionDetached { session_id: SessionId, host_id: HostId, reason: Option<String> },
    SessionEvent(Event),
    PermissionRequest(PermissionRequestNotice),
    PermissionResult(PermissionResultNotice),
}

struct SessionEntry {
    session: Session,
    link: Arc<AgentLink>,
    metadata: HashMap<String, Value>,
    pending_permissions: HashMap<RequestId, oneshot::Sender<PermissionOutcome>>,
}

/// Per-host orchestrator. One instance per running `hub-host` process.
pub struct Supervisor {
    host_id: HostId,
    event_log: EventLog,
    backends: BackendRegistry,
    pool: IdlePool,
    sessions: DashMap<SessionId, Arc<Mutex<SessionEntry>>>,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
}

impl Supervisor {
    pub fn new(
        host_id: HostId,
        event_log: EventLog,
        backends: BackendRegistry,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            host_id,
            event_log,
            backends,
            pool: IdlePool::new(),
            sessions: DashMap::new(),
            outbound: tx,
        });
        (supervisor, rx)
    }

    fn emit(&self, event: OutboundEvent) {
        let _ = self.outbound.send(event);
    }

    async fn acquire_link(&self, backend_id: &BackendId) -> Result<Arc<AgentLink>, HubError> {
        if let Some(link) = self.pool.acquire(backend_id).await {
            return Ok(link);
        }
        let backend = self.backends.resolve(Some(backend_id))?.clone();
        let link = Arc::new(AgentLink::new(backend));
        link.connect().await?;
        Ok(link)
    }

    fn release_link(&self, backend_id: &BackendId, link: Arc<AgentLink>) {
        self.pool.release(backend_id, link);
    }

    /// Spawns the task that pumps agent notifications/requests into this
    /// session's handling until the link is stopped or the session closes.
    fn spawn_notification_pump(self: &Arc<Self>, session_id: SessionId, link: Arc<AgentLink>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                match link.recv().await {
                    Some(message) => supervisor.handle_agent_message(&session_id, message).await,
                    None => {
                        supervisor.handle_agent_exit(&session_id).await;
                        break;
                    }
                }
            }
        });
    }

    async fn handle_agent_exit(&self, session_id: &SessionId) {
        let Some((_, entry)) = self.sessions.remove(session_id) else { return };
        let guard = entry.lock().await;
        let host_id = guard.session.host_id.clone();
        let revision = guard.session.revision;
        drop(guard);
        if let Ok(event) = self
            .event_log
            .append_event(session_id, &self.host_id, revision, session_error("agent exited"))
            .await
        {
            self.emit(OutboundEvent::SessionEvent(event));
        }
        self.emit(OutboundEvent::SessionDetached {
            session_id: session_id.clone(),
            host_id,
            reason: Some("agent_exit".to_string()),
        });
        self.emit(OutboundEvent::SessionRemoved(session_id.clone()));
    }

    async fn handle_agent_message(&self, session_id: &SessionId, message: AgentMessage) {
        match message {
            AgentMessage::Notification { method, params } => {
                self.handle_notification(session_id, &method, params).await;
            }
            AgentMessage::Request { id, method, params } => {
                if method == "session/request_permission" {
                    self.handle_permission_request(session_id, id, params).await;
                } else {
                    warn!("unhandled inbound agent request: {method}");
                }
            }
        }
    }

    async fn handle_notification(&self, session_id: &SessionId, method: &str, params: Value) {
        let Some(entry) = self.sessions.get(session_id).map(|e| e.clone()) else { return };
        let mut guard = entry.lock().await;

        let kind = map_notification(method, &params);
        if let EventKind::SessionInfoUpdate { payload } = &kind {
            merge_meta(&mut guard.metadata, payload.get("_meta"));
        }

        let revision = guard.session.revision;
        drop(guard);

        match self.event_log.append_event(session_id, &self.host_id, revision, kind).await {
            Ok(event) => self.emit(OutboundEvent::SessionEvent(event)),
            Err(e) => {
                warn!("event log append failed for session {session_id}, tearing session down: {e}");
                self.handle_agent_exit(session_id).await;
            }
        }
    }

    async fn handle_permission_request(&self, session_id: &SessionId, id: Value, params: Value) {
        let Some(entry) = self.sessions.get(session_id).map(|e| e.clone()) else { return };
        let request_id = hub_protocol::ids::short_id();
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = entry.lock().await;
            guard.pending_permissions.insert(request_id.clone(), tx);
        }

        let notice = PermissionRequestNotice {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            params: params.clone(),
        };
        let revision = entry.lock().await.session.revision;
        if let Ok(event) = self
            .event_log
            .append_event(session_id, &self.host_id, revision, EventKind::PermissionRequest { payload: params })
            .await
        {
            self.emit(OutboundEvent::SessionEvent(event));
        }
        self.emit(OutboundEvent::PermissionRequest(notice));

        let link = entry.lock().await.link.clone();
        let event_log = self.event_log.clone();
        let host_id = self.host_id.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let outcome = rx.await.unwrap_or(PermissionOutcome::Cancelled);
            let result = json!({"outcome": serde_json::to_value(&outcome).unwrap_or(Value::Null)});
            let _ = link.respond(id, Ok(result)).await;
            let payload = serde_json::to_value(&outcome).unwrap_or(Value::Null);
            if let Ok(event) = event_log.append_event(&session_id, &host_id, revision, EventKind::PermissionResult { payload }).await {
                let _ = event;
            }
        });
    }

    /// **Create session** . Takes `&Arc<Self>` because it
    /// spawns a notification-pump task holding its own clone of the
    /// supervisor.
    pub async fn create_session(
        self: &Arc<Self>,
        user_id: UserId,
        backend_id: Option<BackendId>,
        cwd: String,
        title: Option<String>,
    ) -> Result<Session, HubError> {
        let backend = self.backends.resolve(backend_id.as_ref())?.clone();
        let link = self.acquire_link(&backend.id).await?;

        let session_id = hub_protocol::ids::short_id();
        link.call("session/new", json!({"sessionId": session_id, "cwd": cwd})).await?;

        let title = title.unwrap_or_else(|| "Untitled session".to_string());
        let revision = self.event_log.ensure_session(&session_id, &self.host_id, &user_id, &backend.id, &cwd, &title)?;

        let now = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            host_id: self.host_id.clone(),
            user_id,
            backend_id: backend.id.clone(),
            title,
            cwd,
            created_at: now,
            updated_at: now,
            revision,
            agent_state: AgentState::Ready,
            model_id: None,
            mode_id: None,
            available_modes: link.available_modes().await,
            available_models: link.available_models().await,
            is_attached: true,
            wrapped_dek: None,
        };

        let entry = Arc::new(Mutex::new(SessionEntry {
            session: session.clone(),
            link: link.clone(),
            metadata: HashMap::new(),
            pending_permissions: HashMap::new(),
        }));
        self.sessions.insert(session_id.clone(), entry);
        self.spawn_notification_pump(session_id.clone(), link);

        info!("session {session_id} created on backend {}", session.backend_id);
        self.emit(OutboundEvent::SessionAdded(SessionSummary::from(&session)));
        self.emit(OutboundEvent::SessionAttached {
            session_id: session.session_id.clone(),
            host_id: session.host_id.clone(),
        });
        Ok(session)
    }

    /// **Load session (historical)** . If already loaded, emits
    /// a forced re-attach and returns the live record unchanged.
    pub async fn load_session(
        self: &Arc<Self>,
        user_id: &UserId,
        session_id: &SessionId,
        backend_id: Option<BackendId>,
    ) -> Result<Session, HubError> {
        if let Some(entry) = self.sessions.get(session_id) {
            let guard = entry.lock().await;
            if guard.session.user_id != *user_id {
                return Err(HubError::authorization("session is owned by a different user"));
            }
            let session = guard.session.clone();
            drop(guard);
            self.emit(OutboundEvent::SessionAttached {
                session_id: session.session_id.clone(),
                host_id: session.host_id.clone(),
            });
            return Ok(session);
        }

        let backend = self.backends.resolve(backend_id.as_ref())?.clone();
        let link = self.acquire_link(&backend.id).await?;

        // Pre-subscribe before issuing the load RPC: the link's inbound
        // channel is unbounded, so notifications that arrive during the
        // load call queue in order rather than being dropped.
        let existing_revision = self.event_log.known_sessions()?.get(session_id).map(|m| m.revision);
        let revision = match existing_revision {
            Some(_) => self.event_log.increment_revision(session_id)?,
            None => self.event_log.ensure_session(session_id, &self.host_id, user_id, &backend.id, "", "Untitled session")?,
        };

        link.call("session/load", json!({"sessionId": session_id})).await?;

        let now = Utc::now();
        let meta = self.event_log.known_sessions()?.remove(session_id);
        let session = Session {
            session_id: session_id.clone(),
            host_id: self.host_id.clone(),
            user_id: user_id.clone(),
            backend_id: backend.id.clone(),
            title: meta.as_ref().map(|m| m.title.clone()).unwrap_or_default(),
            cwd: meta.as_ref().map(|m| m.cwd.clone()).unwrap_or_default(),
            created_at: now,
            updated_at: now,
            revision,
            agent_state: AgentState::Ready,
            model_id: None,
            mode_id: None,
            available_modes: link.available_modes().await,
            available_models: link.available_models().await,
            is_attached: true,
            wrapped_dek: None,
        };

        let entry = Arc::new(Mutex::new(SessionEntry {
            session: session.clone(),
            link: link.clone(),
            metadata: HashMap::new(),
            pending_permissions: HashMap::new(),
        }));
        self.sessions.insert(session_id.clone(), entry);
        self.spawn_notification_pump(session_id.clone(), link);

        self.emit(OutboundEvent::SessionAttached {
            session_id: session.session_id.clone(),
            host_id: session.host_id.clone(),
        });
        Ok(session)
    }

    /// **Reload session** : always increments revision and
    /// refreshes mode/model/capabilities, even if already loaded.
    pub async fn reload_session(self: &Arc<Self>, user_id: &UserId, session_id: &SessionId) -> Result<Session, HubError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::session_not_found(session_id.clone()))?
            .clone();
        let mut guard = entry.lock().await;
        if guard.session.user_id != *user_id {
            return Err(HubError::authorization("session is owned by a different user"));
        }

        let revision = self.event_log.increment_revision(session_id)?;
        guard.link.call("session/load", json!({"sessionId": session_id})).await?;
        guard.session.revision = revision;
        guard.session.available_modes = guard.link.available_modes().await;
        guard.session.available_models = guard.link.available_models().await;
        guard.session.updated_at = Utc::now();
        let summary = SessionSummary::from(&guard.session);
        let session = guard.session.clone();
        drop(guard);

        self.emit(OutboundEvent::SessionUpdated(summary));
        Ok(session)
    }

    /// **Cancel** : cancels pending permissions (outcome
    /// `cancelled`) and forwards cancel to the agent. Does not close.
    pub async fn cancel(&self, session_id: &SessionId) -> Result<(), HubError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::session_not_found(session_id.clone()))?
            .clone();
        let mut guard = entry.lock().await;
        for (_, tx) in guard.pending_permissions.drain() {
            let _ = tx.send(PermissionOutcome::Cancelled);
        }
        let link = guard.link.clone();
        drop(guard);
        link.cancel(session_id).await
    }

    /// **Close** : cancel, disconnect, remove, emit deltas.
    pub async fn close(&self, session_id: &SessionId) -> Result<(), HubError> {
        self.cancel(session_id).await.ok();
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return Err(HubError::session_not_found(session_id.clone()));
        };
        let guard = entry.lock().await;
        let host_id = guard.session.host_id.clone();
        let link = guard.link.clone();
        drop(guard);
        link.stop(Some("closed".to_string())).await;

        self.emit(OutboundEvent::SessionDetached {
            session_id: session_id.clone(),
            host_id,
            reason: Some("closed".to_string()),
        });
        self.emit(OutboundEvent::SessionRemoved(session_id.clone()));
        Ok(())
    }

    /// **Set mode** : cache-miss re-validation per the chosen
    /// Open Question resolution — a stale `available_modes` list is
    /// refreshed once from the agent before failing validation.
    pub async fn set_mode(&self, session_id: &SessionId, mode_id: &str) -> Result<Session, HubError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::session_not_found(session_id.clone()))?
            .clone();
        let mut guard = entry.lock().await;

        if !guard.link.capabilities().await.list && guard.session.available_modes.is_empty() {
            return Err(HubError::capability_not_supported("modes"));
        }

        if !guard.session.available_modes.iter().any(|m| m == mode_id) {
            guard.session.available_modes = guard.link.available_modes().await;
            if !guard.session.available_modes.iter().any(|m| m == mode_id) {
                return Err(HubError::validation(format!("unknown mode_id '{mode_id}'")));
            }
        }

        guard.link.call("session/set_mode", json!({"sessionId": session_id, "modeId": mode_id})).await?;
        guard.session.mode_id = Some(mode_id.to_string());
        guard.session.updated_at = Utc::now();
        let summary = SessionSummary::from(&guard.session);
        let session = guard.session.clone();
        drop(guard);
        self.emit(OutboundEvent::SessionUpdated(summary));
        Ok(session)
    }

    /// **Set model** : same re-validation contract as `set_mode`.
    pub async fn set_model(&self, session_id: &SessionId, model_id: &str) -> Result<Session, HubError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::session_not_found(session_id.clone()))?
            .clone();
        let mut guard = entry.lock().await;

        if !guard.session.available_models.iter().any(|m| m == model_id) {
            guard.session.available_models = guard.link.available_models().await;
            if !guard.session.available_models.iter().any(|m| m == model_id) {
                return Err(HubError::validation(format!("unknown model_id '{model_id}'")));
            }
        }

        guard.link.call("session/set_model", json!({"sessionId": session_id, "modelId": model_id})).await?;
        guard.session.model_id = Some(model_id.to_string());
        guard.session.updated_at = Utc::now();
        let summary = SessionSummary::from(&guard.session);
        let session = guard.session.clone();
        drop(guard);
        self.emit(OutboundEvent::SessionUpdated(summary));
        Ok(session)
    }

    /// **Send message** — routes a prompt to the agent on this session.
    pub async fn send_message(&self, session_id: &SessionId, prompt: Value) -> Result<(), HubError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::session_not_found(session_id.clone()))?
            .clone();
        let guard = entry.lock().await;
        guard.link.call("session/prompt", json!({"sessionId": session_id, "prompt": prompt})).await?;
        Ok(())
    }

    /// Routes a client's permission decision to the pending request it
    /// answers, matched by `requestId`.
    pub async fn resolve_permission(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
        outcome: PermissionOutcome,
    ) -> Result<(), HubError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HubError::session_not_found(session_id.clone()))?
            .clone();
        let mut guard = entry.lock().await;
        let tx = guard
            .pending_permissions
            .remove(request_id)
            .ok_or_else(|| HubError::validation(format!("no pending permission request '{request_id}'")))?;
        drop(guard);
        let _ = tx.send(outcome.clone());
        self.emit(OutboundEvent::PermissionResult(PermissionResultNotice {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            outcome,
        }));
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

fn session_error(message: &str) -> EventKind {
    EventKind::SessionError { payload: json!({"message": message}) }
}

/// Maps one agent notification to an event kind . A single lookup on the `sessionUpdate` discriminant, falling
/// back to the raw JSON-RPC method name, and finally to `unknown_update`
/// for anything the core doesn't recognize yet.
fn map_notification(method: &str, params: &Value) -> EventKind {
    let sub_kind = params
        .get("sessionUpdate")
        .or_else(|| params.get("update").and_then(|u| u.get("sessionUpdate")))
        .and_then(Value::as_str)
        .unwrap_or(method);

    let payload = params.clone();
    match sub_kind {
        "user_message_chunk" | "user_message" => EventKind::UserMessage { payload },
        "agent_message_chunk" => EventKind::AgentMessageChunk { payload },
        "agent_thought_chunk" => EventKind::AgentThoughtChunk { payload },
        "tool_call" => EventKind::ToolCall { payload },
        "tool_call_update" => EventKind::ToolCallUpdate { payload },
        "session_info_update" | "current_mode_update" | "available_commands_update" => {
            EventKind::SessionInfoUpdate { payload }
        }
        "plan" => EventKind::Plan { payload },
        "usage" | "token_usage" => EventKind::Usage { payload },
        "terminal_output" => EventKind::TerminalOutput { payload },
        "mode_model_update" => EventKind::ModeModelUpdate { payload },
        other => EventKind::UnknownUpdate { original_kind: other.to_string(), payload },
    }
}

/// Applies `_meta` merge semantics to a session's in-memory metadata map
/// : `null` clears everything, a key with
/// a `null` value deletes that key, any other value upserts it.
fn merge_meta(existing: &mut HashMap<String, Value>, meta: Option<&Value>) {
    match meta {
        None => {}
        Some(Value::Null) => existing.clear(),
        Some(Value::Object(map)) => {
            for (k, v) in map {
                if v.is_null() {
                    existing.remove(k);
                } else {
                    existing.insert(k.clone(), v.clone());
                }
            }
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_notification_collapses_session_info_subkinds() {
        let params = json!({"sessionUpdate": "current_mode_update", "modeId": "code"});
        let kind = map_notification("session/update", &params);
        assert!(matches!(kind, EventKind::SessionInfoUpdate { .. }));
    }

    #[test]
    fn map_notification_falls_back_to_unknown_update() {
        let params = json!({"sessionUpdate": "from_the_future"});
        let kind = map_notification("session/update", &params);
        match kind {
            EventKind::UnknownUpdate { original_kind, .. } => assert_eq!(original_kind, "from_the_future"),
            _ => panic!("expected unknown_update"),
        }
    }

    #[test]
    fn merge_meta_null_clears_everything() {
        let mut existing = HashMap::from([("a".to_string(), json!(1))]);
        merge_meta(&mut existing, Some(&Value::Null));
        assert!(existing.is_empty());
    }

    #[test]
    fn merge_meta_per_key_null_deletes_only_that_key() {
        let mut existing = HashMap::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);
        merge_meta(&mut existing, Some(&json!({"a": null, "c": 3})));
        assert_eq!(existing.get("a"), None);
        assert_eq!(existing.get("b"), Some(&json!(2)));
        assert_eq!(existing.get("c"), Some(&json!(3)));
    }
}
