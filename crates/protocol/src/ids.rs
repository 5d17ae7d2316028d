//! Identifier aliases.
//!
//! The hub deals with four independent identifier spaces (host, session,
//! user, request). They are all opaque strings at the wire level — hosts
//! mint their own session ids, the identity provider mints user ids, and
//! the router mints request ids — so plain `String` aliases document intent
//! without adding newtype ceremony the core doesn't need.

pub type HostId = String;
pub type SessionId = String;
pub type UserId = String;
pub type RequestId = String;
pub type BackendId = String;

/// Generates a short, human-legible id in `XXXX-XXXX` shape (8 uppercase
/// hex characters split by a hyphen). Used for host ids and short-lived
/// stream ids where a full UUID would be noisy in logs.
pub fn short_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", uuid[..4].to_uppercase(), uuid[4..8].to_uppercase())
}
