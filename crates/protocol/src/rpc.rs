//! RPC methods the gateway may invoke on a host.
//!
//! The envelope (`RpcRequest`/`RpcResponse`) carries an opaque JSON `params`
//! value; each method's concrete parameter/result shape is defined here and
//! decoded by the host's dispatch table (`hub-host::uplink::dispatch`) and
//! encoded back by the same table. Keeping the envelope untyped lets the
//! much larger method surface stay organized per-method instead of as one
//! giant variant list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{BackendId, HostId, RequestId, SessionId};
use crate::permission::PermissionOutcome;

/// The closed set of RPC method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    #[serde(rename = "session:create")]
    SessionCreate,
    #[serde(rename = "session:close")]
    SessionClose,
    #[serde(rename = "session:cancel")]
    SessionCancel,
    #[serde(rename = "session:mode")]
    SessionMode,
    #[serde(rename = "session:model")]
    SessionModel,
    #[serde(rename = "message:send")]
    MessageSend,
    #[serde(rename = "permission:decision")]
    PermissionDecision,
    #[serde(rename = "sessions:discover")]
    SessionsDiscover,
    #[serde(rename = "session:load")]
    SessionLoad,
    #[serde(rename = "session:reload")]
    SessionReload,
    #[serde(rename = "session:events")]
    SessionEvents,
    #[serde(rename = "fs:roots")]
    FsRoots,
    #[serde(rename = "fs:entries")]
    FsEntries,
    #[serde(rename = "fs:file")]
    FsFile,
    #[serde(rename = "fs:resources")]
    FsResources,
    #[serde(rename = "hostfs:roots")]
    HostFsRoots,
    #[serde(rename = "hostfs:entries")]
    HostFsEntries,
    #[serde(rename = "git:status")]
    GitStatus,
    #[serde(rename = "git:fileDiff")]
    GitFileDiff,
}

/// `G→H rpc:<method>` — a request the gateway forwards to a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: RequestId,
    pub method: RpcMethod,
    pub params: Value,
}

/// `H→G rpc:response` — a host's reply, either a result or a structured
/// error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcOutcome {
    Result { result: Value },
    Error { error: crate::error::HubError },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn ok(request_id: RequestId, result: Value) -> Self {
        Self {
            request_id,
            outcome: RpcOutcome::Result { result },
        }
    }

    pub fn err(request_id: RequestId, error: crate::error::HubError) -> Self {
        Self {
            request_id,
            outcome: RpcOutcome::Error { error },
        }
    }
}

// ─── Typed params for the session-lifecycle methods ──────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateParams {
    pub host_id: Option<HostId>,
    pub backend_id: Option<BackendId>,
    pub cwd: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIdParams {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSetModeParams {
    pub session_id: SessionId,
    pub mode_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSetModelParams {
    pub session_id: SessionId,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSendParams {
    pub session_id: SessionId,
    pub prompt: Vec<PromptBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptBlock {
    Text { text: String },
    ResourceLink { uri: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecisionParams {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub outcome: PermissionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverParams {
    pub host_id: Option<HostId>,
    pub backend_id: Option<BackendId>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResult {
    pub sessions: Vec<crate::session::DiscoveredSession>,
    pub capabilities: crate::session::Capabilities,
    pub next_cursor: Option<String>,
    pub backend_id: BackendId,
    pub backend_label: String,
}

// ─── Typed params for filesystem/Git inspection RPCs ─────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsEntriesParams {
    pub session_id: Option<SessionId>,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsFileParams {
    pub session_id: Option<SessionId>,
    pub path: String,
    /// Maximum number of bytes to return; callers cap this to avoid
    /// shipping multi-gigabyte files through the gateway.
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsFileResult {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitStatusParams {
    pub session_id: Option<SessionId>,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitFileEntry {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitStatusResult {
    pub branch: Option<String>,
    pub files: Vec<GitFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitFileDiffParams {
    pub session_id: Option<SessionId>,
    pub cwd: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitFileDiffResult {
    pub path: String,
    pub diff: String,
}
