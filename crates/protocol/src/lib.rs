//! # hub-protocol
//!
//! Wire types shared by the agent-host daemon and the gateway: the event
//! and session data model, the closed error taxonomy, the host↔gateway
//! frame envelope, and the RPC method surface the gateway drives on a host.
//!
//! This crate carries no transport or I/O — it exists so `hub-host` and
//! `hub-gateway` can agree on a message shape without depending on each
//! other.

pub mod error;
pub mod event;
pub mod frames;
pub mod ids;
pub mod permission;
pub mod rpc;
pub mod session;

pub use error::{ErrorCode, ErrorScope, HubError};
pub use event::{Event, EventKind};
pub use frames::{GatewayFrame, HostFrame, SessionsChanged};
pub use ids::{BackendId, HostId, RequestId, SessionId, UserId};
