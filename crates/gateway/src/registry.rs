//! Client Registry: the gateway's in-memory index of currently connected
//! hosts, keyed primarily by socket identity with secondary indexes by
//! host id and by owning user.
//!
//! One `DashMap` per index rather than one struct behind a single lock,
//! so registering a host never blocks an unrelated lookup.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use hub_protocol::frames::SessionsChanged;
use hub_protocol::ids::{HostId, SessionId, UserId};
use hub_protocol::session::{Backend, DiscoveredSession, SessionSummary};
use tokio::sync::{mpsc, RwLock};

/// One connected host: its advertised metadata and the channel that
/// carries frames down to its socket's outbound task.
#[derive(Clone)]
pub struct HostEntry {
    pub host_id: HostId,
    pub hostname: String,
    pub user_id: UserId,
    pub backends: Vec<Backend>,
    pub default_backend: Option<String>,
    pub sessions: Vec<SessionSummary>,
    pub discovered: Vec<DiscoveredSession>,
    pub tx: mpsc::UnboundedSender<hub_protocol::frames::GatewayFrame>,
}

/// A `sessions:changed` delta re-emitted for gateway-internal listeners
/// (the Event Fan-out and any HTTP long-poll consumers), carrying the
/// owning user so a listener can filter without re-querying the registry.
#[derive(Debug, Clone)]
pub struct RegistryChange {
    pub host_id: HostId,
    pub user_id: UserId,
    pub added: Vec<SessionSummary>,
    pub updated: Vec<SessionSummary>,
    pub removed: Vec<SessionId>,
}

impl RegistryChange {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Gateway-side index of connected hosts.
///
/// Primary index is by socket id (here, the host's connection id, deleted
/// on disconnect); `by_host` replaces an older entry on duplicate
/// registration — a new registration for an already-known `hostId`
/// supersedes the previous record; `by_user` tracks which hosts belong to
/// which user so the router can default to the caller's first connected
/// host when none is named.
pub struct ClientRegistry {
    by_socket: DashMap<String, HostEntry>,
    by_host: DashMap<HostId, String>,
    by_user: RwLock<std::collections::HashMap<UserId, HashSet<HostId>>>,
    changes: mpsc::UnboundedSender<RegistryChange>,
}

impl ClientRegistry {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryChange>) {
        let (changes, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                by_socket: DashMap::new(),
                by_host: DashMap::new(),
                by_user: RwLock::new(std::collections::HashMap::new()),
                changes,
            }),
            rx,
        )
    }

    /// Registers a freshly-authenticated host connection. If `host_id`
    /// was already registered under a different socket, the old socket's
    /// entry is dropped (its sender is still live; closing it is the
    /// caller's job once it observes the displaced socket id).
    pub async fn register(
        &self,
        socket_id: String,
        host_id: HostId,
        hostname: String,
        user_id: UserId,
        backends: Vec<Backend>,
        default_backend: Option<String>,
        tx: mpsc::UnboundedSender<hub_protocol::frames::GatewayFrame>,
    ) -> Option<String> {
        let displaced_socket = self.by_host.insert(host_id.clone(), socket_id.clone());
        if let Some(ref old_socket) = displaced_socket {
            self.by_socket.remove(old_socket);
        }

        self.by_socket.insert(
            socket_id,
            HostEntry {
                host_id: host_id.clone(),
                hostname,
                user_id: user_id.clone(),
                backends,
                default_backend,
                sessions: Vec::new(),
                discovered: Vec::new(),
                tx,
            },
        );

        self.by_user.write().await.entry(user_id).or_default().insert(host_id);
        displaced_socket
    }

    /// Removes a host on disconnect and emits a synthetic `detached` for
    /// every session it owned.
    pub async fn unregister(&self, socket_id: &str) {
        let Some((_, entry)) = self.by_socket.remove(socket_id) else {
            return;
        };
        self.by_host.remove(&entry.host_id);
        if let Some(hosts) = self.by_user.write().await.get_mut(&entry.user_id) {
            hosts.remove(&entry.host_id);
        }

        let removed: Vec<SessionId> = entry.sessions.iter().map(|s| s.session_id.clone()).collect();
        self.emit(RegistryChange {
            host_id: entry.host_id,
            user_id: entry.user_id,
            added: Vec::new(),
            updated: Vec::new(),
            removed,
        });
    }

    /// Applies a full session-list snapshot from a host's periodic
    /// heartbeat , diffing against the cached list so only the
    /// actual delta is fanned out.
    pub fn apply_snapshot(&self, socket_id: &str, sessions: Vec<SessionSummary>) {
        let Some(mut entry) = self.by_socket.get_mut(socket_id) else {
            return;
        };
        let old_ids: HashSet<SessionId> = entry.sessions.iter().map(|s| s.session_id.clone()).collect();
        let new_ids: HashSet<SessionId> = sessions.iter().map(|s| s.session_id.clone()).collect();

        let added = sessions.iter().filter(|s| !old_ids.contains(&s.session_id)).cloned().collect();
        let updated = sessions.iter().filter(|s| old_ids.contains(&s.session_id)).cloned().collect();
        let removed = old_ids.difference(&new_ids).cloned().collect();

        let host_id = entry.host_id.clone();
        let user_id = entry.user_id.clone();
        entry.sessions = sessions;
        drop(entry);

        self.emit(RegistryChange {
            host_id,
            user_id,
            added,
            updated,
            removed,
        });
    }

    /// Applies an incremental `sessions:changed` delta sent between
    /// heartbeats, merging it into the cached snapshot so the cache never
    /// drifts from the host's view.
    pub fn apply_delta(&self, socket_id: &str, delta: SessionsChanged) {
        let Some(mut entry) = self.by_socket.get_mut(socket_id) else {
            return;
        };
        for s in &delta.removed {
            entry.sessions.retain(|existing| &existing.session_id != s);
        }
        for s in delta.updated.iter().chain(delta.added.iter()) {
            if let Some(slot) = entry.sessions.iter_mut().find(|existing| existing.session_id == s.session_id) {
                *slot = s.clone();
            } else {
                entry.sessions.push(s.clone());
            }
        }
        let host_id = entry.host_id.clone();
        let user_id = entry.user_id.clone();
        drop(entry);

        self.emit(RegistryChange {
            host_id,
            user_id,
            added: delta.added,
            updated: delta.updated,
            removed: delta.removed,
        });
    }

    /// Merges a `sessions:discovered` page into the host's discovered
    /// list. Only sessions not previously known are reported `added`; a
    /// metadata change (backend id or label) on an existing discovered
    /// session is `updated`, never `added`.
    pub fn add_discovered(&self, socket_id: &str, sessions: Vec<DiscoveredSession>) {
        let Some(mut entry) = self.by_socket.get_mut(socket_id) else {
            return;
        };
        let mut added = Vec::new();
        let mut updated = Vec::new();
        for s in sessions {
            match entry.discovered.iter_mut().find(|d| d.session_id == s.session_id) {
                Some(existing) => {
                    if existing.backend_id != s.backend_id || existing.backend_label != s.backend_label {
                        updated.push(summary_of_discovered(&s));
                    }
                    *existing = s;
                }
                None => {
                    added.push(summary_of_discovered(&s));
                    entry.discovered.push(s);
                }
            }
        }
        if added.is_empty() && updated.is_empty() {
            return;
        }
        let host_id = entry.host_id.clone();
        let user_id = entry.user_id.clone();
        drop(entry);

        self.emit(RegistryChange {
            host_id,
            user_id,
            added,
            updated,
            removed: Vec::new(),
        });
    }

    fn emit(&self, change: RegistryChange) {
        if change.is_empty() {
            return;
        }
        let _ = self.changes.send(change);
    }

    pub fn lookup_by_socket(&self, socket_id: &str) -> Option<HostEntry> {
        self.by_socket.get(socket_id).map(|e| e.clone())
    }

    pub fn lookup_by_host(&self, host_id: &str) -> Option<HostEntry> {
        let socket_id = self.by_host.get(host_id)?;
        self.by_socket.get(socket_id.value()).map(|e| e.clone())
    }

    /// Looks up a host by id, failing with ownership semantics baked in:
    /// `None` if unknown, `Some(Err(..))` is left to the caller — this
    /// returns `Some(entry)` only when `user_id` actually owns the host.
    pub fn lookup_host_for_user(&self, host_id: &str, user_id: &str) -> Option<HostEntry> {
        let entry = self.lookup_by_host(host_id)?;
        if entry.user_id == user_id {
            Some(entry)
        } else {
            None
        }
    }

    /// Finds the host that owns `session_id`, regardless of caller.
    pub fn find_host_by_session(&self, session_id: &str) -> Option<HostEntry> {
        self.by_socket
            .iter()
            .find(|e| e.sessions.iter().any(|s| s.session_id == session_id))
            .map(|e| e.clone())
    }

    pub async fn first_host_for_user(&self, user_id: &str) -> Option<HostId> {
        let hosts = self.by_user.read().await;
        hosts.get(user_id).and_then(|set| set.iter().next().cloned())
    }

    pub async fn list_sessions_for_user(&self, user_id: &str) -> Vec<SessionSummary> {
        let hosts = self.by_user.read().await;
        let Some(host_ids) = hosts.get(user_id) else {
            return Vec::new();
        };
        host_ids
            .iter()
            .filter_map(|hid| self.lookup_by_host(hid))
            .flat_map(|entry| entry.sessions)
            .collect()
    }
}

fn summary_of_discovered(d: &DiscoveredSession) -> SessionSummary {
    SessionSummary {
        session_id: d.session_id.clone(),
        host_id: String::new(),
        title: d.title.clone(),
        cwd: d.cwd.clone(),
        backend_id: d.backend_id.clone(),
        updated_at: d.updated_at,
        is_attached: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn summary(id: &str) -> SessionSummary {
        SessionSummary {
            session_id: id.into(),
            host_id: "h1".into(),
            title: "t".into(),
            cwd: "/tmp".into(),
            backend_id: "claude".into(),
            updated_at: Utc::now(),
            is_attached: true,
        }
    }

    async fn registered() -> (Arc<ClientRegistry>, mpsc::UnboundedReceiver<RegistryChange>) {
        let (registry, mut rx) = ClientRegistry::new();
        let (tx, _drop) = mpsc::unbounded_channel();
        registry
            .register("sock1".into(), "h1".into(), "laptop".into(), "u1".into(), vec![], None, tx)
            .await;
        // drain nothing; registration itself emits no change
        assert!(rx.try_recv().is_err());
        (registry, rx)
    }

    #[tokio::test]
    async fn duplicate_registration_supersedes_old_socket() {
        let (registry, _rx) = registered().await;
        let (tx2, _drop) = mpsc::unbounded_channel();
        let displaced = registry
            .register("sock2".into(), "h1".into(), "laptop".into(), "u1".into(), vec![], None, tx2)
            .await;
        assert_eq!(displaced.as_deref(), Some("sock1"));
        assert!(registry.lookup_by_socket("sock1").is_none());
        assert!(registry.lookup_by_socket("sock2").is_some());
    }

    #[tokio::test]
    async fn unregister_emits_detached_for_each_owned_session() {
        let (registry, mut rx) = registered().await;
        registry.apply_snapshot("sock1", vec![summary("s1"), summary("s2")]);
        let _ = rx.recv().await.unwrap();

        registry.unregister("sock1").await;
        let change = rx.recv().await.unwrap();
        assert_eq!(change.removed.len(), 2);
        assert!(registry.first_host_for_user("u1").await.is_none());
    }

    #[tokio::test]
    async fn add_discovered_merge_emits_added_once_then_updated() {
        let (registry, mut rx) = registered().await;
        let session = DiscoveredSession {
            session_id: "s1".into(),
            backend_id: "claude".into(),
            backend_label: "Claude".into(),
            title: "first".into(),
            cwd: "/tmp".into(),
            updated_at: Utc::now(),
            stale: false,
        };
        registry.add_discovered("sock1", vec![session.clone()]);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.added.len(), 1);
        assert!(change.updated.is_empty());

        let mut relabeled = session;
        relabeled.backend_label = "Claude Code".into();
        registry.add_discovered("sock1", vec![relabeled]);
        let change = rx.recv().await.unwrap();
        assert!(change.added.is_empty());
        assert_eq!(change.updated.len(), 1);
    }

    #[tokio::test]
    async fn apply_snapshot_diffs_added_updated_removed() {
        let (registry, mut rx) = registered().await;
        registry.apply_snapshot("sock1", vec![summary("s1")]);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.added.len(), 1);

        registry.apply_snapshot("sock1", vec![summary("s2")]);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.added.len(), 1);
        assert_eq!(change.removed, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn lookup_host_for_user_enforces_ownership() {
        let (registry, _rx) = registered().await;
        assert!(registry.lookup_host_for_user("h1", "u1").is_some());
        assert!(registry.lookup_host_for_user("h1", "u2").is_none());
    }
}
