//! Document Sync Controller.
//!
//! Brings one document view to the current document state and keeps it in
//! step with the room:
//!
//! ```text
//!            open()                 snapshot
//!   ─────► INITIALIZING ─────────────────────► LOADED
//!            │ get-document             │ editor enabled
//!            │ (re-sent on timeout)     │ save-document every interval
//!            ▼                          ▼
//!        remote deltas are applied as they arrive, in arrival order
//! ```
//!
//! Only user-originated edits are forwarded. Anything the controller writes
//! into the editor itself (snapshots, remote deltas) comes back as an `Api`
//! change and is dropped, which is what stops edits echoing between peers.
//!
//! The controller owns no timers: the view calls [`DocumentSync::on_timer`]
//! at [`DocumentSync::next_deadline`].

use std::time::{Duration, Instant};

use crate::engine::{ChangeSource, EditorBinding, EditorEngine, EngineError};
use crate::protocol::{ClientEvent, Delta, DocumentContent, DocumentId, EventName};
use crate::session::SessionConfig;
use crate::subscriptions::Subscriptions;
use crate::transport::Transport;

/// Load state of one document view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Loaded,
}

/// Sync controller errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Controller is closed")]
    Closed,
    #[error("View already opened document {open}, cannot open {requested}")]
    DocumentMismatch {
        open: DocumentId,
        requested: DocumentId,
    },
    #[error("Editor rejected the update: {0}")]
    Engine(#[from] EngineError),
}

pub struct DocumentSync {
    state: SessionState,
    document_id: Option<DocumentId>,
    closed: bool,
    subscriptions: Subscriptions,

    persist_interval: Duration,
    next_persist: Option<Instant>,

    load_timeout: Duration,
    max_load_attempts: u32,
    load_attempts: u32,
    load_deadline: Option<Instant>,

    forwarded: u64,
    saves: u64,
}

impl DocumentSync {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: SessionState::Initializing,
            document_id: None,
            closed: false,
            subscriptions: Subscriptions::new(),
            persist_interval: config.persist_interval,
            next_persist: None,
            load_timeout: config.load_timeout,
            max_load_attempts: config.max_load_attempts.max(1),
            load_attempts: 0,
            load_deadline: None,
            forwarded: 0,
            saves: 0,
        }
    }

    /// Request the document. At most one request is outstanding per view;
    /// repeating the call for the same document does nothing.
    pub fn open<T: Transport>(
        &mut self,
        document_id: DocumentId,
        now: Instant,
        transport: &mut T,
    ) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::Closed);
        }

        if let Some(open) = &self.document_id {
            if *open != document_id {
                return Err(SyncError::DocumentMismatch {
                    open: open.clone(),
                    requested: document_id,
                });
            }
            log::debug!("Document {document_id} already requested");
            return Ok(());
        }

        self.state = SessionState::Initializing;
        self.subscriptions.subscribe(EventName::LoadDocument);
        self.subscriptions.subscribe(EventName::ReceiveChanges);
        self.document_id = Some(document_id);
        self.request(now, transport);
        Ok(())
    }

    fn request<T: Transport>(&mut self, now: Instant, transport: &mut T) {
        let Some(document_id) = self.document_id.clone() else {
            return;
        };
        self.load_attempts += 1;
        self.load_deadline = Some(now + self.load_timeout);
        log::info!("Requesting document {document_id} (attempt {})", self.load_attempts);
        if let Err(e) = transport.emit(ClientEvent::GetDocument(document_id)) {
            log::warn!("Failed to emit {}: {e}", EventName::GetDocument);
        }
    }

    /// Apply the first snapshot and enable editing.
    ///
    /// Returns `Ok(false)` for every later delivery: a view consumes one
    /// snapshot for its whole lifetime.
    pub fn on_snapshot_received<E: EditorEngine>(
        &mut self,
        content: &DocumentContent,
        now: Instant,
        editor: &mut EditorBinding<E>,
    ) -> Result<bool, SyncError> {
        if self.closed || self.document_id.is_none() || self.state == SessionState::Loaded {
            log::debug!("Ignoring late or unrequested snapshot ({} bytes)", content.len());
            return Ok(false);
        }

        editor.load(content)?;
        editor.enable();

        self.state = SessionState::Loaded;
        self.subscriptions.unsubscribe(EventName::LoadDocument);
        self.load_deadline = None;
        self.next_persist = Some(now + self.persist_interval);

        if let Some(document_id) = &self.document_id {
            log::info!("Document {document_id} loaded ({} bytes)", content.len());
        }
        Ok(true)
    }

    /// Forward an editor change if the user made it.
    ///
    /// Returns whether the edit was handed to the transport.
    pub fn on_local_edit<T: Transport>(
        &mut self,
        delta: &Delta,
        origin: ChangeSource,
        transport: &mut T,
    ) -> bool {
        if self.closed || self.state != SessionState::Loaded {
            if origin == ChangeSource::User {
                log::debug!("Dropping user edit while not loaded");
            }
            return false;
        }
        if origin != ChangeSource::User {
            return false;
        }

        match transport.emit(ClientEvent::SendChanges(delta.clone())) {
            Ok(()) => {
                self.forwarded += 1;
                true
            }
            Err(e) => {
                log::warn!("Failed to emit {}: {e}", EventName::SendChanges);
                false
            }
        }
    }

    /// Apply a delta from another participant immediately, in arrival order.
    pub fn on_remote_delta<E: EditorEngine>(
        &mut self,
        delta: &Delta,
        editor: &mut EditorBinding<E>,
    ) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        editor.apply_remote(delta)?;
        Ok(())
    }

    /// Send the full current content to be persisted. Fire-and-forget.
    pub fn persistence_tick<E: EditorEngine, T: Transport>(
        &mut self,
        editor: &EditorBinding<E>,
        transport: &mut T,
    ) -> bool {
        if self.closed || self.state != SessionState::Loaded {
            return false;
        }

        let content = match editor.snapshot() {
            Ok(content) => content,
            Err(e) => {
                log::error!("Failed to read document snapshot: {e}");
                return false;
            }
        };

        match transport.emit(ClientEvent::SaveDocument(content)) {
            Ok(()) => {
                self.saves += 1;
                true
            }
            Err(e) => {
                log::warn!("Failed to emit {}: {e}", EventName::SaveDocument);
                false
            }
        }
    }

    /// Run whatever is due at `now`: the persistence tick and the load retry.
    pub fn on_timer<E: EditorEngine, T: Transport>(
        &mut self,
        now: Instant,
        editor: &EditorBinding<E>,
        transport: &mut T,
    ) {
        if self.closed {
            return;
        }

        if let Some(due) = self.next_persist {
            if now >= due {
                self.persistence_tick(editor, transport);
                // Fixed cadence; missed ticks are skipped, not replayed.
                let mut next = due + self.persist_interval;
                while next <= now {
                    next += self.persist_interval;
                }
                self.next_persist = Some(next);
            }
        }

        if let Some(deadline) = self.load_deadline {
            if now >= deadline && self.state == SessionState::Initializing {
                if self.load_attempts < self.max_load_attempts {
                    log::warn!(
                        "No snapshot after {:?}, re-requesting document",
                        self.load_timeout
                    );
                    self.request(now, transport);
                } else {
                    log::error!(
                        "Document did not load after {} attempts; waiting for reconnect",
                        self.load_attempts
                    );
                    self.load_deadline = None;
                }
            }
        }
    }

    /// Earliest instant at which [`DocumentSync::on_timer`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_persist, self.load_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Stop the schedule and drop every subscription. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.next_persist = None;
        self.load_deadline = None;
        self.subscriptions.clear();
        if let Some(document_id) = &self.document_id {
            log::debug!("Sync controller for {document_id} closed");
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        self.document_id.as_ref()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn load_attempts(&self) -> u32 {
        self.load_attempts
    }

    /// User edits handed to the transport so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Save requests handed to the transport so far.
    pub fn saves(&self) -> u64 {
        self.saves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rich_text::{RichTextEngine, TextDelta};
    use crate::transport::MemoryTransport;

    fn setup() -> (DocumentSync, EditorBinding<RichTextEngine>, MemoryTransport) {
        let config = SessionConfig::default();
        let editor = EditorBinding::new(RichTextEngine::new(), &config.placeholder);
        (DocumentSync::new(&config), editor, MemoryTransport::new())
    }

    fn content(text: &str) -> DocumentContent {
        TextDelta::new().insert(text).to_content().unwrap()
    }

    fn loaded() -> (DocumentSync, EditorBinding<RichTextEngine>, MemoryTransport, Instant) {
        let (mut sync, mut editor, mut transport) = setup();
        let t0 = Instant::now();
        sync.open(DocumentId::new("abc"), t0, &mut transport).unwrap();
        sync.on_snapshot_received(&content("hi"), t0, &mut editor).unwrap();
        editor.take_changes();
        transport.take_sent();
        (sync, editor, transport, t0)
    }

    #[test]
    fn test_open_requests_document_once() {
        let (mut sync, _editor, mut transport) = setup();
        let now = Instant::now();
        sync.open(DocumentId::new("abc"), now, &mut transport).unwrap();
        sync.open(DocumentId::new("abc"), now, &mut transport).unwrap();

        assert_eq!(
            transport.sent(),
            &[ClientEvent::GetDocument(DocumentId::new("abc"))]
        );
        assert_eq!(sync.state(), SessionState::Initializing);
        assert!(sync.subscriptions().is_subscribed(EventName::LoadDocument));
        assert!(sync.subscriptions().is_subscribed(EventName::ReceiveChanges));
    }

    #[test]
    fn test_open_other_document_rejected() {
        let (mut sync, _editor, mut transport) = setup();
        let now = Instant::now();
        sync.open(DocumentId::new("abc"), now, &mut transport).unwrap();
        let err = sync.open(DocumentId::new("xyz"), now, &mut transport).unwrap_err();
        assert!(matches!(err, SyncError::DocumentMismatch { .. }));
        assert_eq!(transport.count(EventName::GetDocument), 1);
    }

    #[test]
    fn test_snapshot_enables_editing() {
        let (mut sync, mut editor, mut transport) = setup();
        let now = Instant::now();
        sync.open(DocumentId::new("abc"), now, &mut transport).unwrap();
        assert!(!editor.is_enabled());

        assert!(sync.on_snapshot_received(&content("hi"), now, &mut editor).unwrap());
        assert_eq!(sync.state(), SessionState::Loaded);
        assert!(editor.is_enabled());
        assert_eq!(editor.engine().text(), "hi");
        assert!(!sync.subscriptions().is_subscribed(EventName::LoadDocument));
    }

    #[test]
    fn test_second_snapshot_ignored() {
        let (mut sync, mut editor, _transport, t0) = loaded();
        assert!(!sync.on_snapshot_received(&content("other"), t0, &mut editor).unwrap());
        assert_eq!(editor.engine().text(), "hi");
    }

    #[test]
    fn test_snapshot_before_open_ignored() {
        let (mut sync, mut editor, _transport) = setup();
        assert!(!sync
            .on_snapshot_received(&content("hi"), Instant::now(), &mut editor)
            .unwrap());
        assert_eq!(sync.state(), SessionState::Initializing);
        assert!(!editor.is_enabled());
    }

    #[test]
    fn test_malformed_snapshot_not_consumed() {
        let (mut sync, mut editor, mut transport) = setup();
        let now = Instant::now();
        sync.open(DocumentId::new("abc"), now, &mut transport).unwrap();

        let garbage = DocumentContent(b"\x00garbage".to_vec());
        assert!(sync.on_snapshot_received(&garbage, now, &mut editor).is_err());
        assert_eq!(sync.state(), SessionState::Initializing);
        assert!(!editor.is_enabled());

        assert!(sync.on_snapshot_received(&content("ok"), now, &mut editor).unwrap());
        assert_eq!(editor.engine().text(), "ok");
    }

    #[test]
    fn test_local_edits_forwarded_in_order() {
        let (mut sync, _editor, mut transport, _) = loaded();
        let edits: Vec<Delta> = (0..5)
            .map(|i| TextDelta::new().retain(2 + i).insert("x").to_wire().unwrap())
            .collect();
        for edit in &edits {
            assert!(sync.on_local_edit(edit, ChangeSource::User, &mut transport));
        }

        let sent: Vec<ClientEvent> = edits.into_iter().map(ClientEvent::SendChanges).collect();
        assert_eq!(transport.sent(), sent.as_slice());
        assert_eq!(sync.forwarded(), 5);
    }

    #[test]
    fn test_no_forwarding_while_initializing() {
        let (mut sync, _editor, mut transport) = setup();
        sync.open(DocumentId::new("abc"), Instant::now(), &mut transport).unwrap();
        transport.take_sent();

        let edit = TextDelta::new().insert("x").to_wire().unwrap();
        assert!(!sync.on_local_edit(&edit, ChangeSource::User, &mut transport));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_api_edits_not_forwarded() {
        let (mut sync, _editor, mut transport, _) = loaded();
        let edit = TextDelta::new().insert("x").to_wire().unwrap();
        assert!(!sync.on_local_edit(&edit, ChangeSource::Api, &mut transport));
        assert_eq!(transport.count(EventName::SendChanges), 0);
    }

    #[test]
    fn test_remote_deltas_do_not_echo() {
        let (mut sync, mut editor, mut transport, _) = loaded();
        for i in 0..10 {
            let delta = TextDelta::new().retain(2 + i).insert("?").to_wire().unwrap();
            sync.on_remote_delta(&delta, &mut editor).unwrap();
        }
        for change in editor.take_changes() {
            if let crate::engine::EditorChange::Text { delta, source } = change {
                sync.on_local_edit(&delta, source, &mut transport);
            }
        }
        assert_eq!(editor.engine().text(), "hi??????????");
        assert_eq!(transport.count(EventName::SendChanges), 0);
    }

    #[test]
    fn test_persistence_cadence() {
        let (mut sync, editor, mut transport, t0) = loaded();
        let ms = Duration::from_millis;

        assert_eq!(sync.next_deadline(), Some(t0 + ms(2000)));
        sync.on_timer(t0 + ms(1999), &editor, &mut transport);
        assert_eq!(transport.count(EventName::SaveDocument), 0);

        sync.on_timer(t0 + ms(2000), &editor, &mut transport);
        assert_eq!(transport.count(EventName::SaveDocument), 1);
        assert_eq!(sync.next_deadline(), Some(t0 + ms(4000)));

        sync.on_timer(t0 + ms(4000), &editor, &mut transport);
        assert_eq!(transport.count(EventName::SaveDocument), 2);
        assert_eq!(
            transport.sent()[0],
            ClientEvent::SaveDocument(content("hi"))
        );
    }

    #[test]
    fn test_persistence_skips_missed_ticks() {
        let (mut sync, editor, mut transport, t0) = loaded();
        let ms = Duration::from_millis;

        sync.on_timer(t0 + ms(7100), &editor, &mut transport);
        assert_eq!(transport.count(EventName::SaveDocument), 1);
        assert_eq!(sync.next_deadline(), Some(t0 + ms(8000)));
    }

    #[test]
    fn test_no_persistence_before_load() {
        let (mut sync, editor, mut transport) = setup();
        assert!(!sync.persistence_tick(&editor, &mut transport));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_load_retry_then_give_up() {
        let (mut sync, editor, mut transport) = setup();
        let t0 = Instant::now();
        let timeout = SessionConfig::default().load_timeout;
        sync.open(DocumentId::new("abc"), t0, &mut transport).unwrap();

        sync.on_timer(t0 + timeout, &editor, &mut transport);
        sync.on_timer(t0 + timeout * 2, &editor, &mut transport);
        sync.on_timer(t0 + timeout * 3, &editor, &mut transport);
        sync.on_timer(t0 + timeout * 4, &editor, &mut transport);

        assert_eq!(transport.count(EventName::GetDocument), 3);
        assert_eq!(sync.load_attempts(), 3);
        assert_eq!(sync.next_deadline(), None);
        assert_eq!(sync.state(), SessionState::Initializing);
    }

    #[test]
    fn test_close_is_final_and_idempotent() {
        let (mut sync, mut editor, mut transport, t0) = loaded();
        sync.close();
        sync.close();

        assert!(sync.is_closed());
        assert!(sync.subscriptions().is_empty());
        assert_eq!(sync.next_deadline(), None);

        let edit = TextDelta::new().retain(2).insert("!").to_wire().unwrap();
        assert!(!sync.on_local_edit(&edit, ChangeSource::User, &mut transport));
        sync.on_timer(t0 + Duration::from_secs(60), &editor, &mut transport);
        assert!(!sync.persistence_tick(&editor, &mut transport));
        sync.on_remote_delta(&edit, &mut editor).unwrap();
        assert!(matches!(
            sync.open(DocumentId::new("abc"), t0, &mut transport),
            Err(SyncError::Closed)
        ));

        assert!(transport.sent().is_empty());
        assert_eq!(editor.engine().text(), "hi");
    }
}
