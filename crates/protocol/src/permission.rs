//! Tool permission requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RequestId, SessionId};

/// The outcome of a permission request, however it was resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// The user chose one of the options the agent offered.
    Selected { option_id: String },
    /// The request was cancelled (session cancel/close raced the user).
    Cancelled,
}

/// Wire shape of `permission:request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequestNotice {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub params: Value,
}

/// Wire shape of `permission:result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResultNotice {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub outcome: PermissionOutcome,
}

/// A client's decision on an outstanding permission request, routed
/// client → router → uplink → supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub outcome: PermissionOutcome,
}
