//! The event model.
//!
//! `EventKind` is open at the edge and closed at the core: unrecognized
//! `kind` strings never fail to deserialize, they fall into
//! [`EventKind::Unknown`] carrying the original payload so replay and query
//! still succeed across protocol upgrades.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;

/// The fixed set of event kinds the core understands, plus an open
/// `unknown_update` bucket for forward compatibility.
///
/// Deserialization is hand-written rather than derived: `#[serde(tag =
/// "kind")]` on a derived enum rejects any `kind` it doesn't list, but a
/// gateway must accept events tagged with kinds a newer host invented after
/// this binary was built. The hand-written impl reads the tag itself and
/// falls back to [`EventKind::UnknownUpdate`] instead of erroring.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    UserMessage { payload: Value },
    AgentMessageChunk { payload: Value },
    AgentThoughtChunk { payload: Value },
    ToolCall { payload: Value },
    ToolCallUpdate { payload: Value },
    SessionInfoUpdate { payload: Value },
    ModeModelUpdate { payload: Value },
    Plan { payload: Value },
    Usage { payload: Value },
    TerminalOutput { payload: Value },
    PermissionRequest { payload: Value },
    PermissionResult { payload: Value },
    SessionError { payload: Value },
    TurnEnd { payload: Value },
    /// Forward-compat bucket: anything the core doesn't recognize yet.
    /// `original_kind` preserves what the agent actually sent.
    UnknownUpdate {
        original_kind: String,
        payload: Value,
    },
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| D::Error::custom("event kind must be a JSON object"))?;
        let kind = obj
            .remove("kind")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| D::Error::custom("missing `kind` tag"))?;
        let payload = obj.remove("payload").unwrap_or(Value::Null);

        Ok(match kind.as_str() {
            "user_message" => EventKind::UserMessage { payload },
            "agent_message_chunk" => EventKind::AgentMessageChunk { payload },
            "agent_thought_chunk" => EventKind::AgentThoughtChunk { payload },
            "tool_call" => EventKind::ToolCall { payload },
            "tool_call_update" => EventKind::ToolCallUpdate { payload },
            "session_info_update" => EventKind::SessionInfoUpdate { payload },
            "mode_model_update" => EventKind::ModeModelUpdate { payload },
            "plan" => EventKind::Plan { payload },
            "usage" => EventKind::Usage { payload },
            "terminal_output" => EventKind::TerminalOutput { payload },
            "permission_request" => EventKind::PermissionRequest { payload },
            "permission_result" => EventKind::PermissionResult { payload },
            "session_error" => EventKind::SessionError { payload },
            "turn_end" => EventKind::TurnEnd { payload },
            "unknown_update" => {
                let original_kind = obj
                    .remove("original_kind")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or(kind);
                EventKind::UnknownUpdate { original_kind, payload }
            }
            other => EventKind::UnknownUpdate { original_kind: other.to_string(), payload },
        })
    }
}

impl EventKind {
    /// The payload carried by this event, regardless of kind.
    pub fn payload(&self) -> &Value {
        match self {
            EventKind::UserMessage { payload }
            | EventKind::AgentMessageChunk { payload }
            | EventKind::AgentThoughtChunk { payload }
            | EventKind::ToolCall { payload }
            | EventKind::ToolCallUpdate { payload }
            | EventKind::SessionInfoUpdate { payload }
            | EventKind::ModeModelUpdate { payload }
            | EventKind::Plan { payload }
            | EventKind::Usage { payload }
            | EventKind::TerminalOutput { payload }
            | EventKind::PermissionRequest { payload }
            | EventKind::PermissionResult { payload }
            | EventKind::SessionError { payload }
            | EventKind::TurnEnd { payload }
            | EventKind::UnknownUpdate { payload, .. } => payload,
        }
    }

    /// The snake_case label used as the wire `kind` tag and in the event
    /// log's index. Mirrors `#[serde(rename_all = "snake_case")]` but
    /// exposed as a method so the log can key on it without a round trip
    /// through serde.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::UserMessage { .. } => "user_message",
            EventKind::AgentMessageChunk { .. } => "agent_message_chunk",
            EventKind::AgentThoughtChunk { .. } => "agent_thought_chunk",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::ToolCallUpdate { .. } => "tool_call_update",
            EventKind::SessionInfoUpdate { .. } => "session_info_update",
            EventKind::ModeModelUpdate { .. } => "mode_model_update",
            EventKind::Plan { .. } => "plan",
            EventKind::Usage { .. } => "usage",
            EventKind::TerminalOutput { .. } => "terminal_output",
            EventKind::PermissionRequest { .. } => "permission_request",
            EventKind::PermissionResult { .. } => "permission_result",
            EventKind::SessionError { .. } => "session_error",
            EventKind::TurnEnd { .. } => "turn_end",
            EventKind::UnknownUpdate { .. } => "unknown_update",
        }
    }
}

/// An immutable, ordered record in a session's event log.
///
/// `seq` is strictly increasing within `(session_id, revision)`; `revision`
/// increases each time historical content is reloaded into a live session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub session_id: SessionId,
    pub host_id: String,
    pub revision: u64,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_round_trips_without_loss() {
        let raw = serde_json::json!({
            "kind": "hypothetical_future_kind",
            "original_kind": "hypothetical_future_kind",
            "payload": {"anything": true}
        });
        let kind: EventKind = serde_json::from_value(raw).unwrap();
        assert!(matches!(kind, EventKind::UnknownUpdate { .. }));
        assert_eq!(kind.label(), "unknown_update");
    }

    #[test]
    fn event_round_trips() {
        let event = Event {
            session_id: "s1".into(),
            host_id: "h1".into(),
            revision: 0,
            seq: 1,
            created_at: Utc::now(),
            kind: EventKind::TurnEnd {
                payload: serde_json::json!({"stopReason": "end_turn"}),
            },
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }
}
