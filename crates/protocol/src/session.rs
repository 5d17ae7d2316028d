//! Session, host, and backend records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BackendId, HostId, SessionId, UserId};

/// A named agent CLI the host can spawn: a command, its arguments, and any
/// environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: BackendId,
    pub label: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<(String, String)>,
}

/// A backend-advertised boolean flag, e.g. whether historical sessions can
/// be listed or loaded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub list: bool,
    pub load: bool,
}

/// A live or historical agent conversation bound to a working directory
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub host_id: HostId,
    pub user_id: UserId,
    pub backend_id: BackendId,
    pub title: String,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
    pub agent_state: AgentState,
    pub model_id: Option<String>,
    pub mode_id: Option<String>,
    #[serde(default)]
    pub available_modes: Vec<String>,
    #[serde(default)]
    pub available_models: Vec<String>,
    pub is_attached: bool,
    /// Opaque per-session key blob; the gateway transports it without ever
    /// reading it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_dek: Option<String>,
}

/// Lifecycle state of the agent subprocess backing a session, mirroring
/// the Agent Link state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Connecting,
    Ready,
    Busy,
    Stopped,
}

/// Lightweight projection of a [`Session`] used in summaries and discovery
/// listings, where the full record would be wasteful to ship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub host_id: HostId,
    pub title: String,
    pub cwd: String,
    pub backend_id: BackendId,
    pub updated_at: DateTime<Utc>,
    pub is_attached: bool,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        SessionSummary {
            session_id: s.session_id.clone(),
            host_id: s.host_id.clone(),
            title: s.title.clone(),
            cwd: s.cwd.clone(),
            backend_id: s.backend_id.clone(),
            updated_at: s.updated_at,
            is_attached: s.is_attached,
        }
    }
}

/// A historical session the agent reports it knows about but which is not
/// currently loaded on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredSession {
    pub session_id: SessionId,
    pub backend_id: BackendId,
    pub backend_label: String,
    pub title: String,
    pub cwd: String,
    pub updated_at: DateTime<Utc>,
    /// Set when a later `sessions:discover` round no longer reports this
    /// session; kept rather than deleted so a brief gateway-side refresh
    /// doesn't thrash the "added"/"removed" deltas.
    pub stale: bool,
}

/// A host's registration record as held in the gateway's Client Registry
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_id: HostId,
    pub hostname: String,
    pub user_id: UserId,
    pub backends: Vec<Backend>,
    pub default_backend: Option<BackendId>,
    pub sessions: Vec<SessionSummary>,
    pub registered_at: DateTime<Utc>,
}
