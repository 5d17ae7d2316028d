//! Host daemon configuration, read from named environment settings with a
//! constant-with-env-override pattern rather than a config-file parser.

use std::path::PathBuf;

/// Default gateway WebSocket URL when `GATEWAY_URL` is unset.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.example.internal/host";

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_url: String,
    pub home: PathBuf,
    pub machine_id: String,
    pub user_id: String,
    pub api_key: String,
    pub client_name: String,
    pub client_version: String,
    pub worktree_base_dir: Option<PathBuf>,
    pub compaction_enabled: bool,
}

impl Config {
    /// Reads configuration from the process environment. Never fails —
    /// every setting has a documented default.
    pub fn from_env() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home());

        let machine_id = std::env::var("MACHINE_ID").unwrap_or_else(|_| derive_machine_id());

        Self {
            gateway_url: std::env::var("GATEWAY_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string()),
            user_id: std::env::var("USER_ID").unwrap_or_else(|_| machine_id.clone()),
            api_key: std::env::var("HUB_API_KEY").unwrap_or_default(),
            machine_id,
            client_name: std::env::var("CLIENT_NAME").unwrap_or_else(|_| "hub-host".to_string()),
            client_version: std::env::var("CLIENT_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            worktree_base_dir: std::env::var("WORKTREE_BASE_DIR").ok().map(PathBuf::from),
            compaction_enabled: std::env::var("COMPACTION_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            home,
        }
    }
}

fn default_home() -> PathBuf {
    dirs_home().join(".hub-host")
}

/// Minimal home-directory lookup with one well-known fallback, overridable
/// by `HOME`, rather than pulling in a `dirs` crate dependency.
fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn derive_machine_id() -> String {
    hub_protocol::ids::short_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_vars_fall_back_to_documented_defaults() {
        // Don't mutate process env in a parallel test run; just check the
        // pure helpers the struct composes from.
        assert_eq!(DEFAULT_GATEWAY_URL, "wss://gateway.example.internal/host");
    }
}
