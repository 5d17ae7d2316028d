//! The host↔gateway duplex transport envelope.
//!
//! Frames are JSON objects tagged by a `type` field, split into two
//! directions so a host and a gateway never confuse who may send what.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::ids::{HostId, SessionId, UserId};
use crate::permission::{PermissionRequestNotice, PermissionResultNotice};
use crate::rpc::{RpcRequest, RpcResponse};
use crate::session::{Backend, SessionSummary};

/// A delta to the set of sessions a host advertises.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsChanged {
    #[serde(default)]
    pub added: Vec<SessionSummary>,
    #[serde(default)]
    pub updated: Vec<SessionSummary>,
    #[serde(default)]
    pub removed: Vec<SessionId>,
}

impl SessionsChanged {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Frames a host sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Register {
        host_id: HostId,
        hostname: String,
        version: String,
        backends: Vec<Backend>,
        default_backend: Option<String>,
    },
    Heartbeat {},
    #[serde(rename = "sessions:list")]
    SessionsList { sessions: Vec<SessionSummary> },
    #[serde(rename = "sessions:changed")]
    SessionsChanged(SessionsChanged),
    #[serde(rename = "sessions:discovered")]
    SessionsDiscovered {
        sessions: Vec<crate::session::DiscoveredSession>,
        capabilities: crate::session::Capabilities,
        next_cursor: Option<String>,
        backend_id: String,
        backend_label: String,
    },
    #[serde(rename = "session:attached")]
    SessionAttached {
        session_id: SessionId,
        host_id: HostId,
        attached_at: DateTime<Utc>,
    },
    #[serde(rename = "session:detached")]
    SessionDetached {
        session_id: SessionId,
        host_id: HostId,
        detached_at: DateTime<Utc>,
        reason: Option<String>,
    },
    #[serde(rename = "session:event")]
    SessionEvent(Event),
    #[serde(rename = "permission:request")]
    PermissionRequest(PermissionRequestNotice),
    #[serde(rename = "permission:result")]
    PermissionResult(PermissionResultNotice),
    #[serde(rename = "rpc:response")]
    RpcResponse(RpcResponse),
}

/// Frames the gateway sends to a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    /// `rpc:<method>` — `method` lives inside the embedded request so one
    /// variant covers the whole method surface.
    Rpc(RpcRequest),
    #[serde(rename = "events:ack")]
    EventsAck {
        session_id: SessionId,
        revision: u64,
        up_to_seq: u64,
    },
    #[serde(rename = "cli:registered")]
    CliRegistered { host_id: HostId, user_id: UserId },
    #[serde(rename = "cli:error")]
    CliError { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_round_trips() {
        let frame = HostFrame::Register {
            host_id: "h1".into(),
            hostname: "laptop".into(),
            version: "1.0.0".into(),
            backends: vec![],
            default_backend: None,
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"register\""));
        let back: HostFrame = serde_json::from_str(&text).unwrap();
        matches!(back, HostFrame::Register { .. });
    }

    #[test]
    fn events_ack_round_trips() {
        let frame = GatewayFrame::EventsAck {
            session_id: "s1".into(),
            revision: 0,
            up_to_seq: 7,
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: GatewayFrame = serde_json::from_str(&text).unwrap();
        match back {
            GatewayFrame::EventsAck { up_to_seq, .. } => assert_eq!(up_to_seq, 7),
            _ => panic!("wrong variant"),
        }
    }
}
