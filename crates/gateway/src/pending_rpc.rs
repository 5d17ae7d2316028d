//! Pending RPC tracking: a waiter registered
//! under a fresh `requestId`, resolved when the matching `rpc:response`
//! frame arrives on the owning host's socket, or rejected on timeout.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hub_protocol::ids::{HostId, RequestId};
use hub_protocol::rpc::RpcOutcome;
use hub_protocol::HubError;
use tokio::sync::oneshot;
use tracing::warn;

/// Default per-RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

struct Waiter {
    host_id: HostId,
    responder: oneshot::Sender<RpcOutcome>,
}

/// Registry of outstanding router→host RPC calls, keyed by `requestId`.
#[derive(Default)]
pub struct PendingRpcTable {
    waiters: DashMap<RequestId, Waiter>,
}

impl PendingRpcTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a waiter for `request_id` targeting `host_id` and arms
    /// its timeout. Returns a future that resolves with the host's
    /// outcome, or a retryable `TIMEOUT` error if no response arrives
    /// first.
    pub fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        host_id: HostId,
    ) -> impl std::future::Future<Output = Result<serde_json::Value, HubError>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id.clone(), Waiter { host_id, responder: tx });

        let table = self.clone();
        let timeout_id = request_id.clone();
        async move {
            let outcome = tokio::time::timeout(DEFAULT_RPC_TIMEOUT, rx).await;
            table.waiters.remove(&timeout_id);
            match outcome {
                Ok(Ok(RpcOutcome::Result { result })) => Ok(result),
                Ok(Ok(RpcOutcome::Error { error })) => Err(error),
                Ok(Err(_)) => Err(HubError::internal("rpc waiter dropped before a response arrived")),
                Err(_) => Err(HubError::timeout(format!("rpc {timeout_id} timed out waiting for a host response"))),
            }
        }
    }

    /// Resolves a waiter when the host's `rpc:response` frame arrives.
    /// A response for an already-timed-out or unknown `requestId` is
    /// discarded, since the waiter was already removed on expiry.
    pub fn resolve(&self, request_id: &str, outcome: RpcOutcome) {
        if let Some((_, waiter)) = self.waiters.remove(request_id) {
            let _ = waiter.responder.send(outcome);
        } else {
            warn!("rpc:response for unknown or expired requestId {request_id}");
        }
    }

    /// Rejects every waiter registered against `host_id`, used when that
    /// host's socket drops so its callers don't wait out the full
    /// timeout on a dead link. Waiters against other hosts are untouched.
    pub fn cancel_for_host(&self, host_id: &str, reason: &str) {
        let pending: Vec<RequestId> = self
            .waiters
            .iter()
            .filter(|e| e.value().host_id == host_id)
            .map(|e| e.key().clone())
            .collect();
        for id in pending {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                let _ = waiter.responder.send(RpcOutcome::Error {
                    error: HubError::timeout(format!("host disconnected: {reason}")),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_result_to_waiter() {
        let table = PendingRpcTable::new();
        let fut = table.register("r1".into(), "h1".into());
        table.resolve("r1", RpcOutcome::Result { result: serde_json::json!({"ok": true}) });
        let result = fut.await.unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn resolve_for_unknown_request_id_is_a_noop() {
        let table = PendingRpcTable::new();
        table.resolve("ghost", RpcOutcome::Result { result: serde_json::Value::Null });
    }

    #[tokio::test]
    async fn cancel_for_host_rejects_only_that_hosts_waiters() {
        let table = PendingRpcTable::new();
        let fut1 = table.register("r1".into(), "h1".into());
        let fut2 = table.register("r2".into(), "h2".into());
        table.cancel_for_host("h1", "socket closed");
        assert!(fut1.await.is_err());

        table.resolve("r2", RpcOutcome::Result { result: serde_json::Value::Null });
        assert!(fut2.await.is_ok());
    }
}
