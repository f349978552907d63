//! Presence Controller: who else is in the document and where their
//! cursors are.
//!
//! ## Architecture
//!
//! ```text
//! update-cursors / user-connected / cursor-updated / user-disconnected
//!       │
//!       ▼
//! PresenceController ──► participants map ──► CursorDecorations
//!
//! Local selection change
//!       │
//!       ▼
//! on_local_cursor_changed()
//!       │  (trailing-edge throttle, 200ms)
//!       ▼
//! poll_outbound() ──► update-cursor
//! ```
//!
//! Presence is best-effort. Events about unknown ids or about the local
//! participant are dropped without error; the next roster snapshot heals
//! whatever was missed.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::engine::CursorDecorations;
use crate::protocol::{ClientEvent, CursorRange, EventName, ParticipantId, PresenceEntry, UserInfo};
use crate::subscriptions::Subscriptions;
use crate::throttle::Throttle;
use crate::transport::Transport;

// ───────────────────────────────────────────────────────────────────
// Participant
// ───────────────────────────────────────────────────────────────────

/// A remote participant as seen by this view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
    pub cursor: Option<CursorRange>,
}

impl Participant {
    pub fn from_entry(id: ParticipantId, entry: &PresenceEntry) -> Self {
        Self {
            id,
            name: entry.name.clone(),
            color: entry.color.clone(),
            cursor: entry.cursor,
        }
    }

    pub fn from_user(info: &UserInfo) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            color: info.color.clone(),
            cursor: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Controller
// ───────────────────────────────────────────────────────────────────

/// Presence state of one document view.
///
/// Decoration side effects go through the `CursorDecorations` passed to
/// each handler, so the controller never holds a reference into the editor.
pub struct PresenceController {
    local_id: Option<ParticipantId>,
    participants: HashMap<ParticipantId, Participant>,
    outbound: Throttle<Option<CursorRange>>,
    subscriptions: Subscriptions,
    closed: bool,
}

impl PresenceController {
    pub fn new(cursor_throttle: Duration) -> Self {
        Self {
            local_id: None,
            participants: HashMap::new(),
            outbound: Throttle::new(cursor_throttle),
            subscriptions: Subscriptions::new(),
            closed: false,
        }
    }

    /// Register for the four presence events. Idempotent.
    pub fn subscribe(&mut self) {
        if self.closed {
            return;
        }
        self.subscriptions.subscribe(EventName::UpdateCursors);
        self.subscriptions.subscribe(EventName::UserConnected);
        self.subscriptions.subscribe(EventName::CursorUpdated);
        self.subscriptions.subscribe(EventName::UserDisconnected);
    }

    /// Record the id the server assigned to this connection.
    ///
    /// An entry already stored under that id is dropped: the map never holds
    /// the local participant.
    pub fn set_local_id<C: CursorDecorations>(&mut self, id: ParticipantId, cursors: &mut C) {
        self.local_id = Some(id);
        if self.participants.remove(&id).is_some() {
            cursors.remove_cursor(id);
        }
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id
    }

    fn is_local(&self, id: ParticipantId) -> bool {
        self.local_id == Some(id)
    }

    /// Apply a full roster.
    ///
    /// Known ids get their cursor updated, new ids are created and ids
    /// missing from the roster are removed. Delivering the same roster twice
    /// changes nothing.
    pub fn on_presence_snapshot<C: CursorDecorations>(
        &mut self,
        users: &BTreeMap<ParticipantId, PresenceEntry>,
        cursors: &mut C,
    ) {
        if self.closed {
            return;
        }

        let gone: Vec<ParticipantId> = self
            .participants
            .keys()
            .filter(|id| !users.contains_key(id))
            .copied()
            .collect();
        for id in gone {
            self.participants.remove(&id);
            cursors.remove_cursor(id);
        }

        for (&id, entry) in users {
            if self.is_local(id) {
                continue;
            }
            match self.participants.get_mut(&id) {
                Some(participant) => participant.cursor = entry.cursor,
                None => {
                    cursors.create_cursor(id, &entry.name, &entry.color);
                    self.participants.insert(id, Participant::from_entry(id, entry));
                }
            }
            cursors.move_cursor(id, entry.cursor);
        }

        log::debug!("Presence snapshot applied: {} participants", self.participants.len());
    }

    /// Returns `true` if a new participant was added.
    pub fn on_participant_joined<C: CursorDecorations>(
        &mut self,
        info: &UserInfo,
        cursors: &mut C,
    ) -> bool {
        if self.closed || self.is_local(info.id) || self.participants.contains_key(&info.id) {
            return false;
        }
        cursors.create_cursor(info.id, &info.name, &info.color);
        self.participants.insert(info.id, Participant::from_user(info));
        log::debug!("Participant {} ({}) joined", info.name, info.id);
        true
    }

    /// Returns `true` if a known participant's cursor was updated.
    pub fn on_cursor_updated<C: CursorDecorations>(
        &mut self,
        id: ParticipantId,
        cursor: Option<CursorRange>,
        cursors: &mut C,
    ) -> bool {
        if self.closed || self.is_local(id) {
            return false;
        }
        let Some(participant) = self.participants.get_mut(&id) else {
            log::trace!("Cursor update for unknown participant {id}");
            return false;
        };
        participant.cursor = cursor;
        cursors.move_cursor(id, cursor);
        true
    }

    /// Returns `true` if the participant was known.
    pub fn on_participant_left<C: CursorDecorations>(
        &mut self,
        id: ParticipantId,
        cursors: &mut C,
    ) -> bool {
        if self.closed {
            return false;
        }
        match self.participants.remove(&id) {
            Some(participant) => {
                cursors.remove_cursor(id);
                log::debug!("Participant {} ({id}) left", participant.name);
                true
            }
            None => false,
        }
    }

    /// Queue the local selection for the next throttled `update-cursor`.
    pub fn on_local_cursor_changed(&mut self, range: Option<CursorRange>, now: Instant) {
        if self.closed {
            return;
        }
        self.outbound.push(range, now);
    }

    /// Emit the pending local cursor if its window has closed.
    pub fn poll_outbound<T: Transport>(&mut self, now: Instant, transport: &mut T) -> bool {
        if self.closed {
            return false;
        }
        let Some(range) = self.outbound.poll(now) else {
            return false;
        };
        match transport.emit(ClientEvent::UpdateCursor(range)) {
            Ok(()) => {
                log::trace!("Local cursor sent: {range:?}");
                true
            }
            Err(e) => {
                log::warn!("Failed to emit {}: {e}", EventName::UpdateCursor);
                false
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outbound.deadline()
    }

    /// Forget every participant and its decoration. Used when the
    /// connection is re-established and the roster will be resent.
    pub fn reset<C: CursorDecorations>(&mut self, cursors: &mut C) {
        for id in self.participants.keys() {
            cursors.remove_cursor(*id);
        }
        self.participants.clear();
        self.outbound.cancel();
    }

    /// Drop all state and subscriptions. Idempotent.
    pub fn close<C: CursorDecorations>(&mut self, cursors: &mut C) {
        if self.closed {
            return;
        }
        self.reset(cursors);
        self.subscriptions.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn participants(&self) -> &HashMap<ParticipantId, Participant> {
        &self.participants
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }
}

// ───────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────
