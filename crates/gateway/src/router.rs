//! Session Router: converts a client request into an RPC aimed at the
//! correct host, resolves ownership, and matches the response against the
//! pending-RPC table.

use std::sync::Arc;

use hub_protocol::ids::{HostId, RequestId, UserId};
use hub_protocol::ids::short_id;
use hub_protocol::rpc::{RpcMethod, RpcRequest};
use hub_protocol::HubError;
use serde_json::Value;
use tracing::warn;

use crate::pending_rpc::PendingRpcTable;
use crate::registry::{ClientRegistry, HostEntry};

pub struct SessionRouter {
    registry: Arc<ClientRegistry>,
    pending: Arc<PendingRpcTable>,
}

impl SessionRouter {
    pub fn new(registry: Arc<ClientRegistry>, pending: Arc<PendingRpcTable>) -> Arc<Self> {
        Arc::new(Self { registry, pending })
    }

    /// Resolves a waiter when the owning host's `rpc:response` frame
    /// arrives on its socket.
    pub fn resolve_response(&self, request_id: &str, outcome: hub_protocol::rpc::RpcOutcome) {
        self.pending.resolve(request_id, outcome);
    }

    /// Rejects every waiter still outstanding against `host_id`, called
    /// when that host's socket drops so its callers fail fast instead of
    /// waiting out the full RPC timeout on a connection that is gone.
    pub fn cancel_pending_for_host(&self, host_id: &str, reason: &str) {
        self.pending.cancel_for_host(host_id, reason);
    }

    /// Resolves the host that owns `session_id`, failing `SESSION_NOT_FOUND`
    /// when nobody advertises it and `AUTHORIZATION_FAILED` when it belongs
    /// to a different user.
    pub fn resolve_session_host(&self, session_id: &str, caller: &UserId) -> Result<HostEntry, HubError> {
        let entry = self
            .registry
            .find_host_by_session(session_id)
            .ok_or_else(|| HubError::session_not_found(session_id))?;
        if &entry.user_id != caller {
            return Err(HubError::authorization(format!("user {caller} does not own session {session_id}")));
        }
        Ok(entry)
    }

    /// Resolves a host-scoped call: the named host if one is given (and
    /// owned by the caller), or the caller's first connected host.
    pub async fn resolve_host(&self, host_id: Option<&HostId>, caller: &UserId) -> Result<HostEntry, HubError> {
        match host_id {
            Some(hid) => self
                .registry
                .lookup_host_for_user(hid, caller)
                .ok_or_else(|| HubError::authorization(format!("user {caller} does not own host {hid}"))),
            None => {
                let first = self
                    .registry
                    .first_host_for_user(caller)
                    .await
                    .ok_or_else(|| HubError::session_not_found("no connected host for this user"))?;
                self.registry
                    .lookup_by_host(&first)
                    .ok_or_else(|| HubError::internal("host vanished between lookup and dispatch"))
            }
        }
    }

    /// Sends an RPC to `target` and awaits the matching `rpc:response`,
    /// generating a fresh correlation id and arming the default timeout.
    pub async fn call(&self, target: &HostEntry, method: RpcMethod, params: Value) -> Result<Value, HubError> {
        let request_id: RequestId = short_id();
        let waiter = self.pending.register(request_id.clone(), target.host_id.clone());
        let request = RpcRequest { request_id, method, params };
        if target.tx.send(hub_protocol::frames::GatewayFrame::Rpc(request)).is_err() {
            return Err(HubError::internal("host socket closed before the request could be sent").retryable());
        }
        waiter.await
    }

    /// Routes a permission decision and returns as soon as it is
    /// forwarded; the true confirmation arrives later as a
    /// `permission_result` event.
    pub async fn forward_fire_and_forget(&self, target: &HostEntry, method: RpcMethod, params: Value) -> Result<(), HubError> {
        let request = RpcRequest {
            request_id: short_id(),
            method,
            params,
        };
        target
            .tx
            .send(hub_protocol::frames::GatewayFrame::Rpc(request))
            .map_err(|_| {
                warn!("failed to forward {method:?} to host {}: socket closed", target.host_id);
                HubError::internal("host socket closed before the request could be sent").retryable()
            })
    }
}
