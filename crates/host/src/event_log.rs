//! The per-session, per-revision event log.
//!
//! Backed by `sled`, a pure-Rust embedded store, so a host daemon never
//! needs an external database process. Keys are built so that
//! `(session_id, revision, seq)` sorts lexicographically, which makes
//! `query_events`/`get_unacked` cheap range scans rather than full-table
//! filters.
//!
//! Durability: every [`EventLog::append_event`] flushes to disk before
//! returning, so an append is durable before it is handed to the
//! supervisor for emission, without a separate fsync step at the call
//! site.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use hub_protocol::event::{Event, EventKind};
use hub_protocol::ids::{BackendId, SessionId};
use hub_protocol::session::DiscoveredSession;
use hub_protocol::{ErrorCode, ErrorScope, HubError};
use tokio::sync::Mutex;

const SESSION_META_PREFIX: &str = "meta/";
const EVENT_PREFIX: &str = "event/";
const ACKED_PREFIX: &str = "acked/";
const DISCOVERED_PREFIX: &str = "discovered/";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub host_id: String,
    pub user_id: String,
    pub backend_id: BackendId,
    pub cwd: String,
    pub title: String,
    pub revision: u64,
}

fn meta_key(session_id: &str) -> String {
    format!("{SESSION_META_PREFIX}{session_id}")
}

fn event_key(session_id: &str, revision: u64, seq: u64) -> String {
    format!("{EVENT_PREFIX}{session_id}/{revision:020}/{seq:020}")
}

fn event_scan_prefix(session_id: &str, revision: u64) -> String {
    format!("{EVENT_PREFIX}{session_id}/{revision:020}/")
}

fn acked_key(session_id: &str, revision: u64) -> String {
    format!("{ACKED_PREFIX}{session_id}/{revision:020}")
}

fn discovered_key(backend_id: &str, session_id: &str) -> String {
    format!("{DISCOVERED_PREFIX}{backend_id}/{session_id}")
}

/// A page of events returned by [`EventLog::query_events`].
pub struct EventPage {
    pub events: Vec<Event>,
    pub has_more: bool,
}

/// The durable, append-only event store for one host.
#[derive(Clone)]
pub struct EventLog {
    db: sled::Db,
    /// Serializes appends per `(session_id, revision)` so two concurrent
    /// callers can never be assigned the same `seq`, independent of the
    /// supervisor's own per-session serialization.
    append_locks: Arc<DashMap<(SessionId, u64), Arc<Mutex<()>>>>,
}

impl EventLog {
    pub fn open(path: &std::path::Path) -> Result<Self, HubError> {
        let db = sled::open(path)
            .map_err(|e| HubError::internal(format!("failed to open event log at {path:?}: {e}")))?;
        Ok(Self {
            db,
            append_locks: Arc::new(DashMap::new()),
        })
    }

    /// In-memory store for tests; behaves identically to a file-backed log.
    #[cfg(test)]
    pub fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = Self::open(&dir.path().join("events.db")).unwrap();
        (log, dir)
    }

    fn lock_for(&self, session_id: &SessionId, revision: u64) -> Arc<Mutex<()>> {
        self.append_locks
            .entry((session_id.clone(), revision))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates the session row if missing, returning the current revision
    /// either way.
    pub fn ensure_session(
        &self,
        session_id: &SessionId,
        host_id: &str,
        user_id: &str,
        backend_id: &BackendId,
        cwd: &str,
        title: &str,
    ) -> Result<u64, HubError> {
        let key = meta_key(session_id);
        if let Some(raw) = self.db.get(&key).map_err(db_err)? {
            let meta: SessionMeta = serde_json::from_slice(&raw).map_err(decode_err)?;
            if meta.user_id != user_id {
                return Err(HubError::authorization(format!(
                    "session {session_id} is owned by a different user"
                )));
            }
            return Ok(meta.revision);
        }
        let meta = SessionMeta {
            session_id: session_id.clone(),
            host_id: host_id.to_string(),
            user_id: user_id.to_string(),
            backend_id: backend_id.clone(),
            cwd: cwd.to_string(),
            title: title.to_string(),
            revision: 0,
        };
        self.db
            .insert(&key, serde_json::to_vec(&meta).map_err(encode_err)?)
            .map_err(db_err)?;
        self.db.flush().map_err(db_err)?;
        Ok(0)
    }

    /// Atomically advances the revision counter; subsequent appends use the
    /// new revision.
    pub fn increment_revision(&self, session_id: &SessionId) -> Result<u64, HubError> {
        let key = meta_key(session_id);
        let updated = self
            .db
            .update_and_fetch(&key, |old| {
                let mut meta: SessionMeta = old
                    .and_then(|bytes| serde_json::from_slice(bytes).ok())
                    .expect("increment_revision called on an unknown session");
                meta.revision += 1;
                Some(serde_json::to_vec(&meta).expect("SessionMeta always serializes"))
            })
            .map_err(db_err)?;
        self.db.flush().map_err(db_err)?;
        let meta: SessionMeta = serde_json::from_slice(&updated.ok_or_else(|| {
            HubError::session_not_found(session_id.clone())
        })?)
        .map_err(decode_err)?;
        Ok(meta.revision)
    }

    /// Appends an event, assigning the next `seq` within
    /// `(session_id, revision)`. Durable on return.
    pub async fn append_event(
        &self,
        session_id: &SessionId,
        host_id: &str,
        revision: u64,
        kind: EventKind,
    ) -> Result<Event, HubError> {
        let lock = self.lock_for(session_id, revision);
        let _guard = lock.lock().await;

        let next_seq = self.next_seq(session_id, revision)?;
        let event = Event {
            session_id: session_id.clone(),
            host_id: host_id.to_string(),
            revision,
            seq: next_seq,
            created_at: Utc::now(),
            kind,
        };
        let key = event_key(session_id, revision, next_seq);
        self.db
            .insert(&key, serde_json::to_vec(&event).map_err(encode_err)?)
            .map_err(db_err)?;
        self.db.flush_async().await.map_err(db_err)?;
        Ok(event)
    }

    fn next_seq(&self, session_id: &SessionId, revision: u64) -> Result<u64, HubError> {
        let prefix = event_scan_prefix(session_id, revision);
        let last = self
            .db
            .scan_prefix(&prefix)
            .last()
            .transpose()
            .map_err(db_err)?;
        match last {
            Some((_, raw)) => {
                let event: Event = serde_json::from_slice(&raw).map_err(decode_err)?;
                Ok(event.seq + 1)
            }
            None => Ok(1),
        }
    }

    /// Returns up to `limit` events with `seq > after_seq`, ordered by
    /// `seq` ascending, plus whether more are available.
    pub fn query_events(
        &self,
        session_id: &SessionId,
        revision: u64,
        after_seq: u64,
        limit: usize,
    ) -> Result<EventPage, HubError> {
        let prefix = event_scan_prefix(session_id, revision);
        let mut events = Vec::new();
        let mut has_more = false;
        for item in self.db.scan_prefix(&prefix) {
            let (_, raw) = item.map_err(db_err)?;
            let event: Event = serde_json::from_slice(&raw).map_err(decode_err)?;
            if event.seq <= after_seq {
                continue;
            }
            if events.len() == limit {
                has_more = true;
                break;
            }
            events.push(event);
        }
        Ok(EventPage { events, has_more })
    }

    /// Returns the suffix of events not yet acknowledged.
    pub fn get_unacked(&self, session_id: &SessionId, revision: u64) -> Result<Vec<Event>, HubError> {
        let acked = self.last_acked(session_id, revision)?;
        let page = self.query_events(session_id, revision, acked, usize::MAX)?;
        Ok(page.events)
    }

    fn last_acked(&self, session_id: &SessionId, revision: u64) -> Result<u64, HubError> {
        let key = acked_key(session_id, revision);
        match self.db.get(&key).map_err(db_err)? {
            Some(raw) => {
                let value = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                Ok(value)
            }
            None => Ok(0),
        }
    }

    /// Marks events with `seq <= up_to_seq` as acknowledged. Idempotent:
    /// acking the same or an older `seq` twice is a no-op.
    pub fn ack(&self, session_id: &SessionId, revision: u64, up_to_seq: u64) -> Result<(), HubError> {
        let key = acked_key(session_id, revision);
        let current = self.last_acked(session_id, revision)?;
        if up_to_seq <= current {
            return Ok(());
        }
        self.db
            .insert(&key, up_to_seq.to_string().into_bytes())
            .map_err(db_err)?;
        self.db.flush().map_err(db_err)?;
        Ok(())
    }

    /// Deletes every event for a session across all revisions. Disabled by
    /// default at the supervisor layer;
    /// the log itself just performs the deletion when asked.
    pub fn archive(&self, session_id: &SessionId) -> Result<(), HubError> {
        let prefix = format!("{EVENT_PREFIX}{session_id}/");
        let keys: Vec<_> = self
            .db
            .scan_prefix(&prefix)
            .keys()
            .filter_map(|k| k.ok())
            .collect();
        for key in keys {
            self.db.remove(&key).map_err(db_err)?;
        }
        self.db.flush().map_err(db_err)?;
        Ok(())
    }

    pub fn bulk_archive(&self, session_ids: &[SessionId]) -> Result<(), HubError> {
        for session_id in session_ids {
            self.archive(session_id)?;
        }
        Ok(())
    }

    /// Records a historical session the agent reports knowing about but
    /// which isn't loaded.
    pub fn save_discovered(&self, backend_id: &BackendId, discovered: &DiscoveredSession) -> Result<(), HubError> {
        let key = discovered_key(backend_id, &discovered.session_id);
        self.db
            .insert(&key, serde_json::to_vec(discovered).map_err(encode_err)?)
            .map_err(db_err)?;
        self.db.flush().map_err(db_err)?;
        Ok(())
    }

    /// Marks a previously-discovered session stale rather than deleting it,
    /// so a transient discovery gap doesn't thrash `sessions:changed`
    /// deltas.
    pub fn mark_discovered_stale(&self, backend_id: &BackendId, session_id: &SessionId) -> Result<(), HubError> {
        let key = discovered_key(backend_id, session_id);
        if let Some(raw) = self.db.get(&key).map_err(db_err)? {
            let mut discovered: DiscoveredSession = serde_json::from_slice(&raw).map_err(decode_err)?;
            discovered.stale = true;
            self.db
                .insert(&key, serde_json::to_vec(&discovered).map_err(encode_err)?)
                .map_err(db_err)?;
            self.db.flush().map_err(db_err)?;
        }
        Ok(())
    }

    pub fn get_discovered(&self, backend_id: Option<&BackendId>) -> Result<Vec<DiscoveredSession>, HubError> {
        let prefix = match backend_id {
            Some(id) => format!("{DISCOVERED_PREFIX}{id}/"),
            None => DISCOVERED_PREFIX.to_string(),
        };
        let mut out = Vec::new();
        for item in self.db.scan_prefix(&prefix) {
            let (_, raw) = item.map_err(db_err)?;
            out.push(serde_json::from_slice(&raw).map_err(decode_err)?);
        }
        Ok(out)
    }

    /// Rebuilds a coarse in-memory index of known sessions on startup: the
    /// in-memory session map is reconstructed from the log on demand
    /// rather than persisted separately.
    pub fn known_sessions(&self) -> Result<HashMap<SessionId, SessionMeta>, HubError> {
        let mut out = HashMap::new();
        for item in self.db.scan_prefix(SESSION_META_PREFIX) {
            let (_, raw) = item.map_err(db_err)?;
            let meta: SessionMeta = serde_json::from_slice(&raw).map_err(decode_err)?;
            out.insert(meta.session_id.clone(), meta);
        }
        Ok(out)
    }
}

fn db_err(e: sled::Error) -> HubError {
    HubError::new(ErrorCode::InternalError, ErrorScope::Service, format!("event log I/O error: {e}"))
}

fn decode_err(e: serde_json::Error) -> HubError {
    HubError::internal(format!("event log record corrupt: {e}"))
}

fn encode_err(e: serde_json::Error) -> HubError {
    HubError::internal(format!("failed to encode event log record: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind(n: u32) -> EventKind {
        EventKind::UserMessage { payload: json!({"n": n}) }
    }

    #[tokio::test]
    async fn appends_are_strictly_monotone_per_revision() {
        let (log, _dir) = EventLog::open_temp();
        let sid = "s1".to_string();
        log.ensure_session(&sid, "h1", "u1", &"claude".to_string(), "/tmp", "t").unwrap();

        let e1 = log.append_event(&sid, "h1", 0, kind(1)).await.unwrap();
        let e2 = log.append_event(&sid, "h1", 0, kind(2)).await.unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
    }

    #[tokio::test]
    async fn revision_increment_isolates_seq_counters() {
        let (log, _dir) = EventLog::open_temp();
        let sid = "s1".to_string();
        log.ensure_session(&sid, "h1", "u1", &"claude".to_string(), "/tmp", "t").unwrap();
        log.append_event(&sid, "h1", 0, kind(1)).await.unwrap();
        let rev = log.increment_revision(&sid).unwrap();
        assert_eq!(rev, 1);
        let e = log.append_event(&sid, "h1", rev, kind(2)).await.unwrap();
        assert_eq!(e.seq, 1, "seq restarts at 1 under the new revision");
    }

    #[tokio::test]
    async fn query_events_paginates_and_reports_has_more() {
        let (log, _dir) = EventLog::open_temp();
        let sid = "s1".to_string();
        log.ensure_session(&sid, "h1", "u1", &"claude".to_string(), "/tmp", "t").unwrap();
        for n in 0..5 {
            log.append_event(&sid, "h1", 0, kind(n)).await.unwrap();
        }
        let page = log.query_events(&sid, 0, 0, 3).unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(page.has_more);
        assert_eq!(page.events[0].seq, 1);

        let rest = log.query_events(&sid, 0, 3, 10).unwrap();
        assert_eq!(rest.events.len(), 2);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn ack_is_idempotent_and_filters_unacked() {
        let (log, _dir) = EventLog::open_temp();
        let sid = "s1".to_string();
        log.ensure_session(&sid, "h1", "u1", &"claude".to_string(), "/tmp", "t").unwrap();
        for n in 0..3 {
            log.append_event(&sid, "h1", 0, kind(n)).await.unwrap();
        }
        log.ack(&sid, 0, 2).unwrap();
        log.ack(&sid, 0, 2).unwrap(); // idempotent
        let unacked = log.get_unacked(&sid, 0).unwrap();
        assert_eq!(unacked.len(), 1);
        assert_eq!(unacked[0].seq, 3);

        // acking an older seq is a no-op
        log.ack(&sid, 0, 1).unwrap();
        let unacked = log.get_unacked(&sid, 0).unwrap();
        assert_eq!(unacked.len(), 1);
    }

    #[tokio::test]
    async fn ensure_session_rejects_cross_user_reuse() {
        let (log, _dir) = EventLog::open_temp();
        let sid = "s1".to_string();
        log.ensure_session(&sid, "h1", "alice", &"claude".to_string(), "/tmp", "t").unwrap();
        let err = log
            .ensure_session(&sid, "h1", "bob", &"claude".to_string(), "/tmp", "t")
            .unwrap_err();
        assert_eq!(err.code, hub_protocol::ErrorCode::AuthorizationFailed);
    }

    #[tokio::test]
    async fn archive_removes_all_events_for_a_session() {
        let (log, _dir) = EventLog::open_temp();
        let sid = "s1".to_string();
        log.ensure_session(&sid, "h1", "u1", &"claude".to_string(), "/tmp", "t").unwrap();
        log.append_event(&sid, "h1", 0, kind(1)).await.unwrap();
        log.archive(&sid).unwrap();
        let page = log.query_events(&sid, 0, 0, 10).unwrap();
        assert!(page.events.is_empty());
    }
}
