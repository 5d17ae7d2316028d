//! The closed error taxonomy shared by every edge of the hub.
//!
//! Every fallible core operation returns a [`HubError`] instead of an ad hoc
//! string. The code is closed; the message is free text for
//! humans; `retryable` and `scope` drive client behaviour without the
//! caller needing to pattern-match on `code`.

use serde::{Deserialize, Serialize};

/// The closed set of error codes a caller may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequestValidationFailed,
    AuthorizationFailed,
    AuthRequired,
    InvalidKey,
    SessionNotFound,
    CapabilityNotSupported,
    InternalError,
    Timeout,
    RegistrationError,
}

/// Which layer raised the error; used for UI presentation, not for control
/// flow (errors that deserve a retry are already marked `retryable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    Request,
    Session,
    Auth,
    Transport,
    Service,
}

/// A tagged error record, serialized verbatim over the wire in RPC
/// responses and HTTP error bodies.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct HubError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub scope: ErrorScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl HubError {
    pub fn new(code: ErrorCode, scope: ErrorScope, message: impl Into<String>) -> Self {
        Self {
            code,
            scope,
            message: message.into(),
            retryable: false,
            detail: None,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RequestValidationFailed, ErrorScope::Request, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthorizationFailed, ErrorScope::Auth, message)
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthRequired, ErrorScope::Auth, message)
    }

    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidKey, ErrorScope::Auth, message)
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            ErrorScope::Session,
            format!("session {} not found", session_id.into()),
        )
    }

    pub fn capability_not_supported(capability: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CapabilityNotSupported,
            ErrorScope::Session,
            format!("capability not supported: {}", capability.into()),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, ErrorScope::Service, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, ErrorScope::Transport, message).retryable()
    }

    pub fn registration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RegistrationError, ErrorScope::Transport, message)
    }

    /// The fixed HTTP status for this error's code.
    pub fn http_status(&self) -> u16 {
        match self.code {
            ErrorCode::RequestValidationFailed => 400,
            ErrorCode::AuthRequired => 401,
            ErrorCode::AuthorizationFailed => 403,
            ErrorCode::SessionNotFound => 404,
            ErrorCode::CapabilityNotSupported => 409,
            ErrorCode::InvalidKey => 401,
            ErrorCode::Timeout => 504,
            ErrorCode::InternalError | ErrorCode::RegistrationError => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_denial_is_403_never_404() {
        let err = HubError::authorization("user B does not own session s1");
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn unknown_session_is_404() {
        let err = HubError::session_not_found("s404");
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn round_trips_through_json() {
        let err = HubError::timeout("rpc timed out").with_detail(serde_json::json!({"method": "session:create"}));
        let text = serde_json::to_string(&err).unwrap();
        let back: HubError = serde_json::from_str(&text).unwrap();
        assert_eq!(back.code, ErrorCode::Timeout);
        assert!(back.retryable);
    }
}
