//! Document Session Registry: one room per open document.
//!
//! A room holds the last content a client saved, the roster of connected
//! participants and a tokio broadcast channel for fan-out. Frames are
//! encoded once and tagged with the participant that caused them; each
//! connection skips its own frames, so nobody receives their own edit back.
//!
//! ```text
//! send-changes ──► broadcast_changes() ──┐
//! update-cursor ─► update_cursor() ──────┼──► broadcast::Sender<Arc<RoomFrame>>
//! join / leave ──► user-connected/-left ─┘        │        │        │
//!                                                 ▼        ▼        ▼
//!                                               peer A   peer B   peer C
//! ```
//!
//! Snapshot reads and writes run on the blocking pool with the rooms lock
//! released. Every content change gets a registry-wide revision and the
//! store only ever moves forward: a write that finishes late never replaces
//! a newer snapshot of the same document.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{
    CursorRange, Delta, DocumentContent, DocumentId, ParticipantId, PresenceEntry, ProtocolError,
    ServerEvent, ServerFrame, UserInfo,
};
use crate::storage::{DocumentStore, StoreError};

/// A pre-encoded server frame and the participant it came from.
#[derive(Debug)]
pub struct RoomFrame {
    pub sender: ParticipantId,
    pub bytes: Vec<u8>,
}

/// What a participant gets back when it joins a room.
pub struct Joined {
    pub receiver: broadcast::Receiver<Arc<RoomFrame>>,
    pub content: DocumentContent,
    /// Everyone else already in the room.
    pub roster: BTreeMap<ParticipantId, PresenceEntry>,
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Room {document_id} is full ({max} participants)")]
    RoomFull { document_id: DocumentId, max: usize },
    #[error("Room {0} does not exist")]
    NoSuchRoom(DocumentId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Registry counters.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub frames_sent: u64,
    pub saves: u64,
    pub persisted_snapshots: u64,
    pub persist_failures: u64,
}

#[derive(Default)]
struct AtomicRegistryStats {
    frames_sent: AtomicU64,
    saves: AtomicU64,
    persisted_snapshots: AtomicU64,
    persist_failures: AtomicU64,
}

struct Room {
    content: DocumentContent,
    /// Revision of `content`.
    revision: u64,
    roster: HashMap<ParticipantId, PresenceEntry>,
    sender: broadcast::Sender<Arc<RoomFrame>>,
}

impl Room {
    fn new(content: DocumentContent, revision: u64, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            content,
            revision,
            roster: HashMap::new(),
            sender,
        }
    }

    /// Encode once and fan out. Returns the number of live receivers.
    fn publish(&self, sender: ParticipantId, event: ServerEvent) -> Result<usize, ProtocolError> {
        let bytes = ServerFrame::Event(event).encode()?;
        Ok(self
            .sender
            .send(Arc::new(RoomFrame { sender, bytes }))
            .unwrap_or(0))
    }
}

/// Store writes, shared with the blocking tasks that perform them.
#[derive(Default)]
struct PersistLog {
    /// Highest revision written per document.
    written: Mutex<HashMap<DocumentId, u64>>,
    /// Bumped after every completed write.
    epoch: AtomicU64,
}

/// All open rooms, keyed by document.
pub struct DocumentRegistry {
    rooms: RwLock<HashMap<DocumentId, Room>>,
    store: Option<Arc<DocumentStore>>,
    persisted: Arc<PersistLog>,
    revisions: AtomicU64,
    broadcast_capacity: usize,
    max_peers_per_room: usize,
    stats: AtomicRegistryStats,
}

impl DocumentRegistry {
    pub fn new(
        store: Option<Arc<DocumentStore>>,
        broadcast_capacity: usize,
        max_peers_per_room: usize,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            persisted: Arc::new(PersistLog::default()),
            revisions: AtomicU64::new(0),
            broadcast_capacity: broadcast_capacity.max(1),
            max_peers_per_room,
            stats: AtomicRegistryStats::default(),
        }
    }

    /// In-memory registry with no persistence.
    pub fn in_memory() -> Self {
        Self::new(None, 256, 100)
    }

    /// Add a participant to a document's room, creating the room if needed.
    ///
    /// A new room starts from the stored snapshot, or empty. Everyone else in
    /// the room receives `user-connected`.
    pub async fn join(&self, document_id: &DocumentId, user: &UserInfo) -> Result<Joined, RegistryError> {
        loop {
            {
                let mut rooms = self.rooms.write().await;
                if let Some(room) = rooms.get_mut(document_id) {
                    return self.enter(room, document_id, user);
                }
            }

            let epoch = self.persisted.epoch.load(Ordering::SeqCst);
            let content = self.load(document_id).await?;

            let mut rooms = self.rooms.write().await;
            if !rooms.contains_key(document_id) {
                if self.persisted.epoch.load(Ordering::SeqCst) != epoch {
                    // A room closed while we were reading; its snapshot may be newer.
                    log::debug!("Store changed while loading {document_id}, loading again");
                    continue;
                }
                log::info!("Opening room {document_id} ({} bytes)", content.len());
                let room = Room::new(content, self.next_revision(), self.broadcast_capacity);
                rooms.insert(document_id.clone(), room);
            }
            let Some(room) = rooms.get_mut(document_id) else {
                return Err(RegistryError::NoSuchRoom(document_id.clone()));
            };
            return self.enter(room, document_id, user);
        }
    }

    fn enter(&self, room: &mut Room, document_id: &DocumentId, user: &UserInfo) -> Result<Joined, RegistryError> {
        if !room.roster.contains_key(&user.id) && room.roster.len() >= self.max_peers_per_room {
            return Err(RegistryError::RoomFull {
                document_id: document_id.clone(),
                max: self.max_peers_per_room,
            });
        }

        let roster = room
            .roster
            .iter()
            .filter(|(id, _)| **id != user.id)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        room.publish(user.id, ServerEvent::UserConnected(user.clone()))?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);

        // Subscribed after the announcement, so the joiner never sees it.
        let receiver = room.sender.subscribe();
        room.roster.insert(user.id, PresenceEntry::from_user(user));

        log::info!(
            "{} ({}) joined {document_id}, {} in room",
            user.name,
            user.id,
            room.roster.len()
        );

        Ok(Joined {
            receiver,
            content: room.content.clone(),
            roster,
        })
    }

    /// Remove a participant. The last one out persists the room and closes it.
    ///
    /// Returns whether the room was closed. A room somebody joined or saved
    /// while its final snapshot was being written stays open.
    pub async fn leave(&self, document_id: &DocumentId, id: ParticipantId) -> bool {
        let (revision, content) = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(document_id) else {
                return false;
            };
            if room.roster.remove(&id).is_none() {
                return false;
            }

            match room.publish(id, ServerEvent::UserDisconnected(id)) {
                Ok(_) => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::error!("Failed to announce departure of {id}: {e}"),
            }
            log::info!("{id} left {document_id}, {} in room", room.roster.len());

            if !room.roster.is_empty() {
                return false;
            }
            (room.revision, room.content.clone())
        };

        self.persist(document_id, revision, content).await;

        let mut rooms = self.rooms.write().await;
        let unchanged = rooms
            .get(document_id)
            .is_some_and(|room| room.roster.is_empty() && room.revision == revision);
        if !unchanged {
            return false;
        }
        rooms.remove(document_id);
        log::info!("Room {document_id} closed (empty)");
        true
    }

    /// Replace the authoritative content and persist it.
    pub async fn save(&self, document_id: &DocumentId, content: DocumentContent) -> Result<(), RegistryError> {
        let revision = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(document_id) else {
                return Err(RegistryError::NoSuchRoom(document_id.clone()));
            };
            room.content = content.clone();
            room.revision = self.next_revision();
            room.revision
        };
        self.stats.saves.fetch_add(1, Ordering::Relaxed);
        self.persist(document_id, revision, content).await;
        Ok(())
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn load(&self, document_id: &DocumentId) -> Result<DocumentContent, RegistryError> {
        let Some(store) = self.store.clone() else {
            return Ok(DocumentContent::empty());
        };
        let id = document_id.clone();
        let content = tokio::task::spawn_blocking(move || store.load_snapshot(&id)).await??;
        Ok(content.unwrap_or_default())
    }

    /// Write a snapshot unless a newer revision is already stored.
    async fn persist(&self, document_id: &DocumentId, revision: u64, content: DocumentContent) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let persisted = self.persisted.clone();
        let id = document_id.clone();

        let written = tokio::task::spawn_blocking(move || {
            let mut written = persisted.written.lock().unwrap_or_else(PoisonError::into_inner);
            if written.get(&id).is_some_and(|&stored| stored >= revision) {
                return Ok(false);
            }
            store.save_snapshot(&id, &content)?;
            written.insert(id, revision);
            persisted.epoch.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(true)
        })
        .await;

        match written {
            Ok(Ok(true)) => {
                self.stats.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(false)) => {
                log::debug!("Snapshot {revision} of {document_id} superseded, not written");
            }
            Ok(Err(e)) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist {document_id}: {e}");
            }
            Err(e) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Persist task for {document_id} failed: {e}");
            }
        }
    }

    /// Fan out an edit to everyone else in the room as `receive-changes`.
    pub async fn broadcast_changes(
        &self,
        document_id: &DocumentId,
        from: ParticipantId,
        delta: Delta,
    ) -> Result<usize, RegistryError> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(document_id) else {
            return Err(RegistryError::NoSuchRoom(document_id.clone()));
        };
        let receivers = room.publish(from, ServerEvent::ReceiveChanges(delta))?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    /// Record a participant's cursor and fan out `cursor-updated`.
    pub async fn update_cursor(
        &self,
        document_id: &DocumentId,
        from: ParticipantId,
        cursor: Option<CursorRange>,
    ) -> Result<usize, RegistryError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(document_id) else {
            return Err(RegistryError::NoSuchRoom(document_id.clone()));
        };
        let Some(entry) = room.roster.get_mut(&from) else {
            log::debug!("Cursor from {from} who is not in {document_id}");
            return Ok(0);
        };
        entry.cursor = cursor;
        let receivers = room.publish(from, ServerEvent::CursorUpdated { id: from, cursor })?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    /// Current content of an open room.
    pub async fn content(&self, document_id: &DocumentId) -> Option<DocumentContent> {
        self.rooms
            .read()
            .await
            .get(document_id)
            .map(|room| room.content.clone())
    }

    /// Roster of a room without `exclude`.
    pub async fn roster(
        &self,
        document_id: &DocumentId,
        exclude: ParticipantId,
    ) -> BTreeMap<ParticipantId, PresenceEntry> {
        self.rooms
            .read()
            .await
            .get(document_id)
            .map(|room| {
                room.roster
                    .iter()
                    .filter(|(id, _)| **id != exclude)
                    .map(|(id, entry)| (*id, entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn participant_count(&self, document_id: &DocumentId) -> usize {
        self.rooms
            .read()
            .await
            .get(document_id)
            .map_or(0, |room| room.roster.len())
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            saves: self.stats.saves.load(Ordering::Relaxed),
            persisted_snapshots: self.stats.persisted_snapshots.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }
}
