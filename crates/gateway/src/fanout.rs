//! Event Fan-out: for each host-originated event, forward it
//! to every socket in the owning user's "room", then echo an ack back to
//! the host. Separate from the [`crate::registry::ClientRegistry`], which
//! indexes hosts — this indexes browser client sockets.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use hub_protocol::event::Event;
use hub_protocol::frames::GatewayFrame;
use hub_protocol::ids::UserId;
use hub_protocol::permission::{PermissionRequestNotice, PermissionResultNotice};
use tokio::sync::mpsc;

use crate::ws::ClientFrame;

/// Frames fanned out to a browser client socket.
#[derive(Debug, Clone)]
pub enum RoomMessage {
    Event(Event),
    PermissionRequest(PermissionRequestNotice),
    PermissionResult(PermissionResultNotice),
    SessionAttached { session_id: String, host_id: String },
    SessionDetached { session_id: String, host_id: String, reason: Option<String> },
    SessionsChanged {
        host_id: String,
        added: Vec<hub_protocol::session::SessionSummary>,
        updated: Vec<hub_protocol::session::SessionSummary>,
        removed: Vec<String>,
    },
}

impl From<RoomMessage> for ClientFrame {
    fn from(msg: RoomMessage) -> Self {
        match msg {
            RoomMessage::Event(event) => ClientFrame::SessionEvent(event),
            RoomMessage::PermissionRequest(notice) => ClientFrame::PermissionRequest(notice),
            RoomMessage::PermissionResult(notice) => ClientFrame::PermissionResult(notice),
            RoomMessage::SessionAttached { session_id, host_id } => ClientFrame::SessionAttached { session_id, host_id },
            RoomMessage::SessionDetached { session_id, host_id, reason } => {
                ClientFrame::SessionDetached { session_id, host_id, reason }
            }
            RoomMessage::SessionsChanged { host_id, added, updated, removed } => {
                ClientFrame::SessionsChanged { host_id, added, updated, removed }
            }
        }
    }
}

/// Per-user fan-out rooms: each browser socket registers under its
/// owning user's id and receives everything broadcast to that room.
pub struct FanoutRegistry {
    rooms: DashMap<UserId, HashMap<String, mpsc::UnboundedSender<RoomMessage>>>,
}

impl FanoutRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { rooms: DashMap::new() })
    }

    pub fn join(&self, user_id: UserId, socket_id: String, tx: mpsc::UnboundedSender<RoomMessage>) {
        self.rooms.entry(user_id).or_default().insert(socket_id, tx);
    }

    pub fn leave(&self, user_id: &str, socket_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(user_id) {
            room.remove(socket_id);
        }
    }

    /// Broadcasts to every socket in `user_id`'s room. A send failure
    /// means that socket's outbound task already exited; the room is
    /// cleaned up on that socket's own disconnect path, not here.
    pub fn broadcast(&self, user_id: &str, message: RoomMessage) {
        let Some(room) = self.rooms.get(user_id) else {
            return;
        };
        for tx in room.values() {
            let _ = tx.send(message.clone());
        }
    }

    pub fn room_size(&self, user_id: &str) -> usize {
        self.rooms.get(user_id).map(|r| r.len()).unwrap_or(0)
    }
}

/// Applies a single host-originated event: broadcasts it to the owning
/// user's room, then echoes an ack back on the host's socket.
pub fn fan_out_event(fanout: &FanoutRegistry, user_id: &str, event: Event, host_tx: &mpsc::UnboundedSender<GatewayFrame>) {
    let ack = GatewayFrame::EventsAck {
        session_id: event.session_id.clone(),
        revision: event.revision,
        up_to_seq: event.seq,
    };
    fanout.broadcast(user_id, RoomMessage::Event(event));
    let _ = host_tx.send(ack);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hub_protocol::event::EventKind;

    fn sample_event() -> Event {
        Event {
            session_id: "s1".into(),
            host_id: "h1".into(),
            revision: 0,
            seq: 3,
            created_at: Utc::now(),
            kind: EventKind::TurnEnd { payload: serde_json::json!({}) },
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_socket_in_the_room() {
        let fanout = FanoutRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        fanout.join("u1".into(), "sock1".into(), tx1);
        fanout.join("u1".into(), "sock2".into(), tx2);

        fanout.broadcast("u1", RoomMessage::Event(sample_event()));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_never_reaches_a_different_users_room() {
        let fanout = FanoutRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        fanout.join("u2".into(), "sock1".into(), tx);

        fanout.broadcast("u1", RoomMessage::Event(sample_event()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_event_echoes_an_ack_to_the_host() {
        let fanout = FanoutRegistry::new();
        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        fan_out_event(&fanout, "u1", sample_event(), &host_tx);
        match host_rx.try_recv().unwrap() {
            GatewayFrame::EventsAck { up_to_seq, .. } => assert_eq!(up_to_seq, 3),
            _ => panic!("expected an events:ack frame"),
        }
    }

    #[test]
    fn leave_removes_only_the_named_socket() {
        let fanout = FanoutRegistry::new();
        let (tx1, _r1) = mpsc::unbounded_channel();
        let (tx2, _r2) = mpsc::unbounded_channel();
        fanout.join("u1".into(), "sock1".into(), tx1);
        fanout.join("u1".into(), "sock2".into(), tx2);
        fanout.leave("u1", "sock1");
        assert_eq!(fanout.room_size("u1"), 1);
    }
}
