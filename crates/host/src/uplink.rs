//! The Host Uplink: the single authenticated full-duplex connection from
//! this host to the gateway. Connects, splits the socket, spawns an
//! outbound sender task and a heartbeat task, drains inbound frames until
//! disconnect, then retries after a fixed delay.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hub_protocol::frames::{GatewayFrame, HostFrame, SessionsChanged};
use hub_protocol::ids::SessionId;
use hub_protocol::rpc::{
    DiscoverParams, MessageSendParams, PermissionDecisionParams, RpcMethod, RpcResponse, SessionCreateParams,
    SessionIdParams, SessionSetModeParams, SessionSetModelParams,
};
use hub_protocol::session::SessionSummary;
use hub_protocol::HubError;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::backend::BackendRegistry;
use crate::event_log::EventLog;
use crate::supervisor::{OutboundEvent, Supervisor};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Uplink {
    gateway_url: String,
    api_key: String,
    host_id: String,
    user_id: String,
    hostname: String,
    client_version: String,
    backends: BackendRegistry,
    supervisor: Arc<Supervisor>,
    event_log: EventLog,
    current_tx: tokio::sync::Mutex<Option<mpsc::UnboundedSender<HostFrame>>>,
}

impl Uplink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway_url: String,
        api_key: String,
        host_id: String,
        user_id: String,
        hostname: String,
        client_version: String,
        backends: BackendRegistry,
        supervisor: Arc<Supervisor>,
        event_log: EventLog,
    ) -> Self {
        Self {
            gateway_url,
            api_key,
            host_id,
            user_id,
            hostname,
            client_version,
            backends,
            supervisor,
            event_log,
            current_tx: tokio::sync::Mutex::new(None),
        }
    }

    /// Runs the reconnect loop forever.
    ///
    /// `outbound_events` outlives any single connection, so it is drained by
    /// one long-lived task that forwards into whichever connection's frame
    /// sender is currently live; `connect_once` only ever hands that task a
    /// clone of its own `tx`, never the receiver itself.
    pub async fn run(self: Arc<Self>, outbound_events: mpsc::UnboundedReceiver<OutboundEvent>) {
        let drain_self = self.clone();
        tokio::spawn(async move { drain_self.drain_outbound_events(outbound_events).await });

        loop {
            info!("connecting to gateway at {}", self.gateway_url);
            match self.connect_once().await {
                Ok(()) => warn!("disconnected from gateway"),
                Err(e) => error!("gateway connection failed: {e}"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn drain_outbound_events(self: Arc<Self>, mut outbound_events: mpsc::UnboundedReceiver<OutboundEvent>) {
        while let Some(event) = outbound_events.recv().await {
            let tx = self.current_tx.lock().await.clone();
            if let Some(tx) = tx {
                self.forward_outbound(event, &tx).await;
            }
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<(), HubError> {
        let mut request = self
            .gateway_url
            .clone()
            .into_client_request()
            .map_err(|e| HubError::registration(format!("invalid gateway url: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| HubError::registration(format!("invalid api key header: {e}")))?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| HubError::registration(format!("websocket connect failed: {e}")))?;
        info!("connected to gateway");

        let (ws_sink, mut ws_source) = ws_stream.split();
        let ws_sink = Arc::new(tokio::sync::Mutex::new(ws_sink));

        let (tx, mut rx) = mpsc::unbounded_channel::<HostFrame>();
        *self.current_tx.lock().await = Some(tx.clone());

        let register = HostFrame::Register {
            host_id: self.host_id.clone(),
            hostname: self.hostname.clone(),
            version: self.client_version.clone(),
            backends: self.backends.all().to_vec(),
            default_backend: self.backends.default_backend_id().cloned(),
        };
        let _ = tx.send(register);

        let sender_sink = ws_sink.clone();
        let outbound_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Ok(text) = serde_json::to_string(&frame) {
                    let mut sink = sender_sink.lock().await;
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let heartbeat_self = self.clone();
        let heartbeat_tx = tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                let sessions = heartbeat_self.snapshot_sessions();
                if heartbeat_tx.send(HostFrame::SessionsList { sessions }).is_err() {
                    break;
                }
                if heartbeat_tx.send(HostFrame::Heartbeat {}).is_err() {
                    break;
                }
            }
        });

        self.replay_unacked(&tx)?;

        while let Some(message) = ws_source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Ok(frame) = serde_json::from_str::<GatewayFrame>(&text) {
                        self.handle_gateway_frame(frame, &tx).await;
                    } else {
                        warn!("ignoring malformed gateway frame");
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("gateway socket error: {e}");
                    break;
                }
            }
        }

        *self.current_tx.lock().await = None;
        outbound_task.abort();
        heartbeat_task.abort();
        Ok(())
    }

    fn snapshot_sessions(&self) -> Vec<SessionSummary> {
        // A full rebuild from the log keeps the heartbeat snapshot correct
        // even if the in-memory session map and the log briefly disagree.
        self.event_log
            .known_sessions()
            .unwrap_or_default()
            .into_values()
            .map(|meta| {
                let is_attached = self.supervisor.list_sessions().contains(&meta.session_id);
                SessionSummary {
                    session_id: meta.session_id,
                    host_id: meta.host_id,
                    title: meta.title,
                    cwd: meta.cwd,
                    backend_id: meta.backend_id,
                    updated_at: chrono::Utc::now(),
                    is_attached,
                }
            })
            .collect()
    }

    /// On reconnect, re-emits the unacked suffix of every known session so
    /// the gateway's cache catches up.
    fn replay_unacked(&self, tx: &mpsc::UnboundedSender<HostFrame>) -> Result<(), HubError> {
        for (session_id, meta) in self.event_log.known_sessions()? {
            let unacked = self.event_log.get_unacked(&session_id, meta.revision)?;
            for event in unacked {
                let _ = tx.send(HostFrame::SessionEvent(event));
            }
        }
        Ok(())
    }

    async fn forward_outbound(&self, event: OutboundEvent, tx: &mpsc::UnboundedSender<HostFrame>) {
        let frame = match event {
            OutboundEvent::SessionAdded(s) => HostFrame::SessionsChanged(SessionsChanged {
                added: vec![s],
                ..Default::default()
            }),
            OutboundEvent::SessionUpdated(s) => HostFrame::SessionsChanged(SessionsChanged {
                updated: vec![s],
                ..Default::default()
            }),
            OutboundEvent::SessionRemoved(id) => HostFrame::SessionsChanged(SessionsChanged {
                removed: vec![id],
                ..Default::default()
            }),
            OutboundEvent::SessionAttached { session_id, host_id } => HostFrame::SessionAttached {
                session_id,
                host_id,
                attached_at: chrono::Utc::now(),
            },
            OutboundEvent::SessionDetached { session_id, host_id, reason } => HostFrame::SessionDetached {
                session_id,
                host_id,
                detached_at: chrono::Utc::now(),
                reason,
            },
            OutboundEvent::SessionEvent(event) => HostFrame::SessionEvent(event),
            OutboundEvent::PermissionRequest(notice) => HostFrame::PermissionRequest(notice),
            OutboundEvent::PermissionResult(notice) => HostFrame::PermissionResult(notice),
        };
        let _ = tx.send(frame);
    }

    async fn handle_gateway_frame(&self, frame: GatewayFrame, tx: &mpsc::UnboundedSender<HostFrame>) {
        match frame {
            GatewayFrame::Rpc(request) => {
                let request_id = request.request_id.clone();
                let outcome = self.dispatch_rpc(request.method, request.params).await;
                let response = match outcome {
                    Ok(result) => RpcResponse::ok(request_id, result),
                    Err(e) => RpcResponse::err(request_id, e),
                };
                let _ = tx.send(HostFrame::RpcResponse(response));
            }
            GatewayFrame::EventsAck { session_id, revision, up_to_seq } => {
                if let Err(e) = self.event_log.ack(&session_id, revision, up_to_seq) {
                    warn!("failed to apply ack for session {session_id}: {e}");
                }
            }
            GatewayFrame::CliRegistered { host_id, user_id } => {
                info!("registered with gateway as host {host_id} for user {user_id}");
            }
            GatewayFrame::CliError { code, message } => {
                error!("gateway rejected registration: {code}: {message}");
            }
        }
    }

    /// The single dispatch table for every RPC the gateway may invoke on
    /// this host.
    async fn dispatch_rpc(&self, method: RpcMethod, params: Value) -> Result<Value, HubError> {
        match method {
            RpcMethod::SessionCreate => {
                let p: SessionCreateParams = decode(params)?;
                let user_id = self.current_user_id();
                let session = self
                    .supervisor
                    .create_session(user_id, p.backend_id, p.cwd, p.title)
                    .await?;
                Ok(serde_json::to_value(session).unwrap())
            }
            RpcMethod::SessionLoad => {
                let p: SessionIdParams = decode(params)?;
                let user_id = self.current_user_id();
                let session = self.supervisor.load_session(&user_id, &p.session_id, None).await?;
                Ok(serde_json::to_value(session).unwrap())
            }
            RpcMethod::SessionReload => {
                let p: SessionIdParams = decode(params)?;
                let user_id = self.current_user_id();
                let session = self.supervisor.reload_session(&user_id, &p.session_id).await?;
                Ok(serde_json::to_value(session).unwrap())
            }
            RpcMethod::SessionCancel => {
                let p: SessionIdParams = decode(params)?;
                self.supervisor.cancel(&p.session_id).await?;
                Ok(Value::Null)
            }
            RpcMethod::SessionClose => {
                let p: SessionIdParams = decode(params)?;
                self.supervisor.close(&p.session_id).await?;
                Ok(Value::Null)
            }
            RpcMethod::SessionMode => {
                let p: SessionSetModeParams = decode(params)?;
                let session = self.supervisor.set_mode(&p.session_id, &p.mode_id).await?;
                Ok(serde_json::to_value(session).unwrap())
            }
            RpcMethod::SessionModel => {
                let p: SessionSetModelParams = decode(params)?;
                let session = self.supervisor.set_model(&p.session_id, &p.model_id).await?;
                Ok(serde_json::to_value(session).unwrap())
            }
            RpcMethod::MessageSend => {
                let p: MessageSendParams = decode(params)?;
                self.supervisor
                    .send_message(&p.session_id, serde_json::to_value(p.prompt).unwrap())
                    .await?;
                Ok(Value::Null)
            }
            RpcMethod::PermissionDecision => {
                let p: PermissionDecisionParams = decode(params)?;
                self.supervisor.resolve_permission(&p.session_id, &p.request_id, p.outcome).await?;
                Ok(Value::Null)
            }
            RpcMethod::SessionsDiscover => {
                let p: DiscoverParams = decode(params)?;
                self.discover_sessions(p).await
            }
            RpcMethod::SessionEvents => self.session_events(params).await,
            RpcMethod::FsRoots | RpcMethod::FsEntries | RpcMethod::FsFile | RpcMethod::FsResources => {
                crate::fs::dispatch(method, params).await
            }
            RpcMethod::HostFsRoots | RpcMethod::HostFsEntries => crate::fs::dispatch(method, params).await,
            RpcMethod::GitStatus | RpcMethod::GitFileDiff => crate::git::dispatch(method, params).await,
        }
    }

    async fn discover_sessions(&self, params: DiscoverParams) -> Result<Value, HubError> {
        let backend_id = params
            .backend_id
            .or_else(|| self.backends.default_backend_id().cloned())
            .ok_or_else(|| HubError::validation("no backend_id given and host has no default backend"))?;
        let discovered = self.event_log.get_discovered(Some(&backend_id))?;
        let backend = self.backends.resolve(Some(&backend_id))?;
        let result = hub_protocol::rpc::DiscoverResult {
            sessions: discovered,
            capabilities: hub_protocol::session::Capabilities { list: true, load: true },
            next_cursor: None,
            backend_id: backend.id.clone(),
            backend_label: backend.label.clone(),
        };
        Ok(serde_json::to_value(result).unwrap())
    }

    async fn session_events(&self, params: Value) -> Result<Value, HubError> {
        #[derive(serde::Deserialize)]
        struct Params {
            session_id: SessionId,
            revision: u64,
            after_seq: u64,
            limit: usize,
        }
        let p: Params = decode(params)?;
        let page = self.event_log.query_events(&p.session_id, p.revision, p.after_seq, p.limit)?;
        Ok(serde_json::json!({"events": page.events, "hasMore": page.has_more}))
    }

    fn current_user_id(&self) -> String {
        // The API key authenticates exactly one user per host process;
        // the gateway enforces ownership on every subsequent RPC, this is
        // a defense-in-depth check at the event log.
        self.user_id.clone()
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, HubError> {
    serde_json::from_value(params).map_err(|e| HubError::validation(format!("invalid RPC params: {e}")))
}
