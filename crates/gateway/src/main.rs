//! # Session Hub Gateway
//!
//! The duplex relay between agent hosts and browser clients: indexes
//! connected hosts, routes client requests to the right one, and fans
//! out host-originated events back to the owning user's sockets.
//!
//! ## Modules
//!
//! - [`auth`]       — identity provider gate for hosts and browser clients
//! - [`fanout`]     — per-user broadcast rooms for host-originated events
//! - [`http`]       — REST endpoints for session/filesystem/Git control
//! - [`pending_rpc`] — router→host RPC correlation and timeouts
//! - [`registry`]   — the Client Registry: connected hosts, indexed three ways
//! - [`router`]     — the Session Router: ownership, correlation, dispatch
//! - [`state`]      — shared `AppState` wiring
//! - [`ws`]         — `/ws/host` and `/ws/client` upgrade handlers

mod auth;
mod fanout;
mod http;
mod pending_rpc;
mod registry;
mod router;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::auth::StaticIdentityProvider;
use crate::fanout::RoomMessage;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "hub_gateway=info".into()))
        .init();

    let identity: Arc<dyn auth::IdentityProvider> = Arc::new(StaticIdentityProvider::from_env());
    let (state, mut changes_rx) = AppState::new(identity);

    // Forward Client Registry deltas into each owning user's fan-out room
    // as a `sessions:changed` client frame.
    let fanout_for_changes = state.fanout.clone();
    tokio::spawn(async move {
        while let Some(change) = changes_rx.recv().await {
            fanout_for_changes.broadcast(
                &change.user_id,
                RoomMessage::SessionsChanged {
                    host_id: change.host_id,
                    added: change.added,
                    updated: change.updated,
                    removed: change.removed,
                },
            );
        }
    });

    let app = Router::new()
        .route("/ws/host", get(ws::host_ws_handler))
        .route("/ws/client", get(ws::client_ws_handler))
        .nest("/api", http::router())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 7878));
    info!("hub-gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
