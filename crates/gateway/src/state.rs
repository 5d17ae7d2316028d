//! Shared application state: the registries and collaborators every
//! handler needs, wired up once in `main` and cloned cheaply into each
//! request.

use std::sync::Arc;

use crate::auth::IdentityProvider;
use crate::fanout::FanoutRegistry;
use crate::pending_rpc::PendingRpcTable;
use crate::registry::ClientRegistry;
use crate::router::SessionRouter;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub router: Arc<SessionRouter>,
    pub fanout: Arc<FanoutRegistry>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> (Self, tokio::sync::mpsc::UnboundedReceiver<crate::registry::RegistryChange>) {
        let (registry, changes_rx) = ClientRegistry::new();
        let pending = PendingRpcTable::new();
        let router = SessionRouter::new(registry.clone(), pending);
        let fanout = FanoutRegistry::new();
        (
            Self {
                registry,
                router,
                fanout,
                identity,
            },
            changes_rx,
        )
    }
}
