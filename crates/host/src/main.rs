//! # Agent Host Daemon
//!
//! A background daemon that supervises local agent CLI subprocesses and
//! speaks the host uplink protocol to a gateway, so a browser client can
//! drive a coding agent running on this machine.
//!
//! ## Modules
//!
//! - [`agent_link`]  — one subprocess connection, its state machine and
//!   idle connection pool
//! - [`backend`]     — the registry of agent CLIs this host can spawn
//! - [`config`]      — environment-derived daemon configuration
//! - [`event_log`]   — durable per-session, per-revision event store
//! - [`fs`] / [`git`] — host-local filesystem and Git inspection RPCs
//! - [`home`]        — home-directory layout and pid-file locking
//! - [`supervisor`]  — per-host session orchestrator
//! - [`uplink`]      — authenticated duplex connection to the gateway

mod agent_link;
mod backend;
mod config;
mod event_log;
mod fs;
mod git;
mod home;
mod supervisor;
mod uplink;

use std::sync::Arc;

use tracing::{error, info};

use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::home::Home;
use crate::supervisor::Supervisor;
use crate::uplink::Uplink;

/// Daemon entry point: claims the home directory, opens the event log,
/// and runs the uplink's reconnect loop until the process is killed.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "hub_host=info".into()))
        .init();

    let config = Config::from_env();
    let home = Home::new(config.home.clone());
    if let Err(e) = home.ensure() {
        error!("failed to set up home directory: {e}");
        std::process::exit(1);
    }
    if let Err(e) = home.claim_pid_file() {
        error!("{e}");
        std::process::exit(1);
    }

    let result = run(config, &home).await;

    let _ = home.release_pid_file();
    if let Err(e) = result {
        error!("hub-host exited with error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config, home: &Home) -> Result<(), hub_protocol::HubError> {
    let event_log = event_log::EventLog::open(&home.events_db())?;
    let backends = BackendRegistry::with_default_claude_backend();

    let (supervisor, outbound_rx) = Supervisor::new(config.machine_id.clone(), event_log.clone(), backends.clone());

    let hostname = hostname();
    info!("hub-host {} starting as host {}", config.client_version, config.machine_id);

    let uplink = Arc::new(Uplink::new(
        config.gateway_url.clone(),
        config.api_key.clone(),
        config.machine_id.clone(),
        config.user_id.clone(),
        hostname,
        config.client_version.clone(),
        backends,
        supervisor,
        event_log,
    ));

    uplink.run(outbound_rx).await;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
