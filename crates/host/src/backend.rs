//! The backend registry: the named agent CLIs this host can spawn,
//! advertised at registration and resolved by
//! [`crate::supervisor::Supervisor::create_session`].

use hub_protocol::ids::BackendId;
use hub_protocol::session::Backend;
use hub_protocol::{ErrorCode, ErrorScope, HubError};

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Vec<Backend>,
    default_backend: Option<BackendId>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Backend>, default_backend: Option<BackendId>) -> Self {
        Self { backends, default_backend }
    }

    /// A single `claude` backend pointed at `PATH`, used when no
    /// configuration file is present, so the daemon works out of the box.
    pub fn with_default_claude_backend() -> Self {
        let backend = Backend {
            id: "claude".to_string(),
            label: "Claude Code".to_string(),
            command: "claude".to_string(),
            args: vec!["--acp".to_string()],
            envs: vec![],
        };
        Self::new(vec![backend], Some("claude".to_string()))
    }

    pub fn all(&self) -> &[Backend] {
        &self.backends
    }

    pub fn default_backend_id(&self) -> Option<&BackendId> {
        self.default_backend.as_ref()
    }

    /// Resolves a requested backend id, falling back to the configured
    /// default when none is given.
    pub fn resolve(&self, requested: Option<&BackendId>) -> Result<&Backend, HubError> {
        let wanted = requested.or(self.default_backend.as_ref()).ok_or_else(|| {
            HubError::new(
                ErrorCode::RequestValidationFailed,
                ErrorScope::Request,
                "no backend_id given and host has no default backend configured",
            )
        })?;
        self.backends
            .iter()
            .find(|b| &b.id == wanted)
            .ok_or_else(|| HubError::validation(format!("unknown backend_id '{wanted}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_default() {
        let reg = BackendRegistry::with_default_claude_backend();
        let backend = reg.resolve(None).unwrap();
        assert_eq!(backend.id, "claude");
    }

    #[test]
    fn resolve_rejects_unknown_backend() {
        let reg = BackendRegistry::with_default_claude_backend();
        assert!(reg.resolve(Some(&"nonexistent".to_string())).is_err());
    }
}
