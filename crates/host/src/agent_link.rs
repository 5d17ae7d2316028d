//! One connection to a local agent subprocess.
//!
//! The subprocess speaks newline-delimited JSON-RPC 2.0 over stdio, the
//! same framing the pack's ACP-host reference (`crucible-acp::host`) uses,
//! generalized here into a request/response/notification multiplexer so
//! the link can both call into the agent (`create_session`, `prompt`, ...)
//! and be called by it (`request_permission`).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hub_protocol::session::{Backend, Capabilities};
use hub_protocol::HubError;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

/// The Agent Link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Ready,
    Busy,
    Stopped(Option<String>),
}

/// A single inbound message from the agent, addressed to the supervisor.
/// JSON-RPC notifications map to [`AgentMessage::Notification`]; inbound
/// requests (the agent asking the host for something, e.g. a permission
/// decision) map to [`AgentMessage::Request`] and must be answered via
/// [`AgentLink::respond`].
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Notification { method: String, params: Value },
    Request { id: Value, method: String, params: Value },
}

struct Pending {
    responder: oneshot::Sender<Result<Value, HubError>>,
}

/// Manages one subprocess implementing the agent-client protocol.
pub struct AgentLink {
    backend: Backend,
    state: Mutex<LinkState>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Arc<std::sync::Mutex<HashMap<u64, Pending>>>,
    next_id: AtomicU64,
    inbound_tx: mpsc::UnboundedSender<AgentMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<AgentMessage>>,
    capabilities: Mutex<Capabilities>,
    available_modes: Mutex<Vec<String>>,
    available_models: Mutex<Vec<String>>,
}

impl AgentLink {
    pub fn new(backend: Backend) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            backend,
            state: Mutex::new(LinkState::Idle),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            inbound_tx: tx,
            inbound_rx: Mutex::new(rx),
            capabilities: Mutex::new(Capabilities::default()),
            available_modes: Mutex::new(Vec::new()),
            available_models: Mutex::new(Vec::new()),
        }
    }

    pub async fn state(&self) -> LinkState {
        self.state.lock().await.clone()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// `idle → connecting → ready`: launches the subprocess on a blocking
    /// worker thread  and performs the initialize handshake.
    pub async fn connect(&self) -> Result<(), HubError> {
        *self.state.lock().await = LinkState::Connecting;

        let backend = self.backend.clone();
        let mut command = tokio::process::Command::new(&backend.command);
        command.args(&backend.args);
        for (k, v) in &backend.envs {
            command.env(k, v);
        }
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|e| {
            self.fail(format!("failed to spawn backend '{}': {e}", backend.id))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.fail_sync("agent subprocess has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.fail_sync("agent subprocess has no stdout"))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let pending = self.pending.clone();
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        handle_line(&line, &pending, &inbound_tx);
                    }
                    Ok(None) => {
                        debug!("agent stdout closed");
                        break;
                    }
                    Err(e) => {
                        error!("agent stdout read error: {e}");
                        break;
                    }
                }
            }
        });

        let init_result = self
            .call_raw("initialize", json!({"protocolVersion": 1, "clientInfo": {"name": "hub-host"}}))
            .await?;

        if let Some(caps) = init_result.get("capabilities") {
            let mut capabilities = self.capabilities.lock().await;
            capabilities.list = caps.get("loadSession").and_then(Value::as_bool).unwrap_or(false);
            capabilities.load = caps.get("loadSession").and_then(Value::as_bool).unwrap_or(false);
        }

        *self.state.lock().await = LinkState::Ready;
        Ok(())
    }

    fn fail(&self, message: impl Into<String>) -> HubError {
        HubError::internal(message)
    }

    fn fail_sync(&self, message: impl Into<String>) -> HubError {
        HubError::internal(message)
    }

    pub async fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock().await
    }

    pub async fn available_modes(&self) -> Vec<String> {
        self.available_modes.lock().await.clone()
    }

    pub async fn available_models(&self) -> Vec<String> {
        self.available_models.lock().await.clone()
    }

    pub async fn set_available_modes(&self, modes: Vec<String>) {
        *self.available_modes.lock().await = modes;
    }

    pub async fn set_available_models(&self, models: Vec<String>) {
        *self.available_models.lock().await = models;
    }

    /// Calls a method on the agent and waits for its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, HubError> {
        let state = self.state().await;
        if matches!(state, LinkState::Stopped(_)) {
            return Err(HubError::internal(format!("agent link is stopped, cannot call {method}")));
        }
        self.call_raw(method, params).await
    }

    async fn call_raw(&self, method: &str, params: Value) -> Result<Value, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, Pending { responder: tx });

        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.write_line(&request).await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(HubError::internal(format!("agent link closed before responding to {method}"))),
        }
    }

    /// Answers an inbound request from the agent (e.g. `request_permission`).
    pub async fn respond(&self, id: Value, result: Result<Value, HubError>) -> Result<(), HubError> {
        let message = match result {
            Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
            Err(e) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000, "message": e.message}}),
        };
        self.write_line(&message).await
    }

    async fn write_line(&self, value: &Value) -> Result<(), HubError> {
        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| HubError::internal("agent link has no stdin"))?;
        let mut line = serde_json::to_string(value).map_err(|e| HubError::internal(format!("encode error: {e}")))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            HubError::internal(format!("failed to write to agent stdin: {e}"))
        })?;
        stdin.flush().await.map_err(|e| HubError::internal(format!("failed to flush agent stdin: {e}")))
    }

    /// Receives the next notification or inbound request from the agent.
    /// Returns `None` once the agent has disconnected.
    pub async fn recv(&self) -> Option<AgentMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn cancel(&self, session_id: &str) -> Result<(), HubError> {
        self.call("session/cancel", json!({"sessionId": session_id})).await.map(|_| ())
    }

    /// `ready → stopped`: kills the subprocess and marks the link dead.
    pub async fn stop(&self, reason: Option<String>) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
        *self.stdin.lock().await = None;
        *self.state.lock().await = LinkState::Stopped(reason);
        let mut pending = self.pending.lock().unwrap();
        for (_, p) in pending.drain() {
            let _ = p.responder.send(Err(HubError::internal("agent link stopped")));
        }
    }
}

fn handle_line(
    line: &str,
    pending: &Arc<std::sync::Mutex<HashMap<u64, Pending>>>,
    inbound_tx: &mpsc::UnboundedSender<AgentMessage>,
) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!("ignoring malformed line from agent: {e}");
            return;
        }
    };

    // A response to a call we made: has "id" and ("result" xor "error"),
    // and the id matches one we issued (numeric).
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if value.get("result").is_some() || value.get("error").is_some() {
            let mut pending = pending.lock().unwrap();
            if let Some(p) = pending.remove(&id) {
                let outcome = if let Some(result) = value.get("result") {
                    Ok(result.clone())
                } else {
                    let message = value
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("agent returned an error")
                        .to_string();
                    Err(HubError::internal(message))
                };
                let _ = p.responder.send(outcome);
                return;
            }
        }
    }

    let method = value.get("method").and_then(Value::as_str).map(str::to_string);
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    match (method, value.get("id").cloned()) {
        (Some(method), Some(id)) => {
            let _ = inbound_tx.send(AgentMessage::Request { id, method, params });
        }
        (Some(method), None) => {
            let _ = inbound_tx.send(AgentMessage::Notification { method, params });
        }
        _ => warn!("ignoring unaddressed message from agent: {line}"),
    }
}

/// A per-backend idle connection pool of size one . A pool hit
/// re-verifies the link is still `ready`; a stale entry is discarded and a
/// fresh subprocess is launched by the caller.
#[derive(Default)]
pub struct IdlePool {
    slots: std::sync::Mutex<HashMap<String, Arc<AgentLink>>>,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl IdlePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire races release in favour of acquire : `take()` on
    /// the backing map is atomic under the mutex, so a concurrent release
    /// either lands before or after this call but never corrupts state.
    pub async fn acquire(&self, backend_id: &str) -> Option<Arc<AgentLink>> {
        let candidate = { self.slots.lock().unwrap().remove(backend_id) };
        match candidate {
            Some(link) if link.state().await == LinkState::Ready => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(link)
            }
            Some(stale) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let stale = stale.clone();
                tokio::spawn(async move { stale.stop(Some("stale idle pool entry".to_string())).await });
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn release(&self, backend_id: &str, link: Arc<AgentLink>) {
        self.slots.lock().unwrap().insert(backend_id.to_string(), link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_pool_miss_on_empty_slot() {
        let pool = IdlePool::new();
        assert!(pool.acquire("claude").await.is_none());
        assert_eq!(pool.misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn new_link_starts_idle() {
        let backend = Backend {
            id: "claude".into(),
            label: "Claude".into(),
            command: "true".into(),
            args: vec![],
            envs: vec![],
        };
        let link = AgentLink::new(backend);
        assert_eq!(link.next_id.load(Ordering::SeqCst), 1);
    }
}
