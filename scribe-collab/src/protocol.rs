//! Wire protocol for the document session.
//!
//! Every frame is a bincode-encoded enum carried in one WebSocket binary
//! message. Clients send [`ClientEvent`]s; the server answers with
//! [`ServerFrame`]s, the first of which is always the handshake that tells
//! the client its own [`ParticipantId`].
//!
//! ```text
//! client                               server
//!   │ ◄──────── Handshake(id) ────────── │
//!   │ ───────── get-document ──────────► │
//!   │ ◄──────── load-document ────────── │  (once per request)
//!   │ ───────── send-changes ──────────► │ ──► receive-changes (others)
//!   │ ───────── save-document ─────────► │
//!   │ ───────── update-cursor ─────────► │ ──► cursor-updated (others)
//! ```
//!
//! Deltas and document snapshots are opaque bytes here: only the editor
//! engine knows how to read them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one shared document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of one live connection. Not stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Engine-encoded incremental edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta(pub Vec<u8>);

impl Delta {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Engine-encoded full document snapshot. Empty bytes mean an empty document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContent(pub Vec<u8>);

impl DocumentContent {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Selection within one document: caret when `length == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub index: usize,
    pub length: usize,
}

impl CursorRange {
    pub fn new(index: usize, length: usize) -> Self {
        Self { index, length }
    }

    pub fn caret(index: usize) -> Self {
        Self { index, length: 0 }
    }
}

/// Identity announced for a participant when it joins a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: ParticipantId,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

impl UserInfo {
    pub fn new(id: ParticipantId, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: color.into(),
        }
    }

    /// Server-side default identity: short name and a colour stable for the id.
    pub fn generated(id: ParticipantId) -> Self {
        let short = id.as_uuid().simple().to_string();
        Self {
            id,
            name: format!("Guest-{}", &short[..8]),
            color: color_for(id),
        }
    }
}

/// Roster entry of the `update-cursors` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
}

impl PresenceEntry {
    pub fn from_user(info: &UserInfo) -> Self {
        Self {
            name: info.name.clone(),
            color: info.color.clone(),
            cursor: None,
        }
    }
}

/// Named events of the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventName {
    GetDocument,
    LoadDocument,
    SaveDocument,
    SendChanges,
    ReceiveChanges,
    UpdateCursor,
    UpdateCursors,
    UserConnected,
    CursorUpdated,
    UserDisconnected,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetDocument => "get-document",
            Self::LoadDocument => "load-document",
            Self::SaveDocument => "save-document",
            Self::SendChanges => "send-changes",
            Self::ReceiveChanges => "receive-changes",
            Self::UpdateCursor => "update-cursor",
            Self::UpdateCursors => "update-cursors",
            Self::UserConnected => "user-connected",
            Self::CursorUpdated => "cursor-updated",
            Self::UserDisconnected => "user-disconnected",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    GetDocument(DocumentId),
    SaveDocument(DocumentContent),
    SendChanges(Delta),
    UpdateCursor(Option<CursorRange>),
}

impl ClientEvent {
    pub fn name(&self) -> EventName {
        match self {
            Self::GetDocument(_) => EventName::GetDocument,
            Self::SaveDocument(_) => EventName::SaveDocument,
            Self::SendChanges(_) => EventName::SendChanges,
            Self::UpdateCursor(_) => EventName::UpdateCursor,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    LoadDocument(DocumentContent),
    ReceiveChanges(Delta),
    UpdateCursors(BTreeMap<ParticipantId, PresenceEntry>),
    UserConnected(UserInfo),
    CursorUpdated {
        id: ParticipantId,
        cursor: Option<CursorRange>,
    },
    UserDisconnected(ParticipantId),
}

impl ServerEvent {
    pub fn name(&self) -> EventName {
        match self {
            Self::LoadDocument(_) => EventName::LoadDocument,
            Self::ReceiveChanges(_) => EventName::ReceiveChanges,
            Self::UpdateCursors(_) => EventName::UpdateCursors,
            Self::UserConnected(_) => EventName::UserConnected,
            Self::CursorUpdated { .. } => EventName::CursorUpdated,
            Self::UserDisconnected(_) => EventName::UserDisconnected,
        }
    }
}

/// Everything the server writes to a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// First frame on every connection: the id the server assigned to it.
    Handshake(ParticipantId),
    Event(ServerEvent),
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        ServerFrame::Event(event)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Stable `#rrggbb` colour derived from a participant id.
pub fn color_for(id: ParticipantId) -> String {
    let hue = (id.as_uuid().as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_roundtrip() {
        let event = ClientEvent::SendChanges(Delta(br#"{"ops":[{"insert":"!"}]}"#.to_vec()));
        let decoded = ClientEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.name(), EventName::SendChanges);
    }

    #[test]
    fn test_null_cursor_survives_the_wire() {
        let event = ClientEvent::UpdateCursor(None);
        let decoded = ClientEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, ClientEvent::UpdateCursor(None));
    }

    #[test]
    fn test_presence_snapshot_roundtrip() {
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let mut users = BTreeMap::new();
        users.insert(
            a,
            PresenceEntry {
                name: "Alice".into(),
                color: "#ff0000".into(),
                cursor: Some(CursorRange::new(3, 2)),
            },
        );
        users.insert(
            b,
            PresenceEntry {
                name: "Bob".into(),
                color: "#00ff00".into(),
                cursor: None,
            },
        );

        let frame = ServerFrame::Event(ServerEvent::UpdateCursors(users.clone()));
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            ServerFrame::Event(ServerEvent::UpdateCursors(got)) => assert_eq!(got, users),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let id = ParticipantId::new();
        let decoded = ServerFrame::decode(&ServerFrame::Handshake(id).encode().unwrap()).unwrap();
        assert_eq!(decoded, ServerFrame::Handshake(id));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(ServerFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ClientEvent::decode(&[]).is_err());
    }

    #[test]
    fn test_event_wire_names() {
        assert_eq!(EventName::GetDocument.as_str(), "get-document");
        assert_eq!(EventName::LoadDocument.as_str(), "load-document");
        assert_eq!(EventName::SaveDocument.as_str(), "save-document");
        assert_eq!(EventName::SendChanges.as_str(), "send-changes");
        assert_eq!(EventName::ReceiveChanges.as_str(), "receive-changes");
        assert_eq!(EventName::UpdateCursor.as_str(), "update-cursor");
        assert_eq!(EventName::UpdateCursors.as_str(), "update-cursors");
        assert_eq!(EventName::UserConnected.as_str(), "user-connected");
        assert_eq!(EventName::CursorUpdated.as_str(), "cursor-updated");
        assert_eq!(EventName::UserDisconnected.as_str(), "user-disconnected");
    }

    #[test]
    fn test_generated_identity_is_stable() {
        let id = ParticipantId::from_uuid(
            Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
        );
        let a = UserInfo::generated(id);
        let b = UserInfo::generated(id);
        assert_eq!(a, b);
        assert_eq!(a.name, "Guest-550e8400");
        assert_eq!(a.color.len(), 7);
        assert!(a.color.starts_with('#'));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        let (r, g, b) = hsl_to_rgb(0.0, 0.0, 0.5);
        assert!((r - 0.5).abs() < 0.01);
        assert!((g - 0.5).abs() < 0.01);
        assert!((b - 0.5).abs() < 0.01);
    }
}
