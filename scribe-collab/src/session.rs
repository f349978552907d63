//! Connection lifecycle of one document view.
//!
//! A [`DocumentView`] owns everything one open document needs: the editor
//! binding, the transport session and both controllers. Nothing is shared
//! between views.
//!
//! ```text
//!  TransportEvent ─┐
//!  LocalInput ─────┼──► run() ──► DocumentView ──► DocumentSync
//!  next deadline ──┘     (one task per view)   └─► PresenceController
//! ```
//!
//! Inbound events are dispatched by name to whichever controller is
//! subscribed to it. Editor change notifications are drained after every
//! step and routed back to the controllers. Text changes go through the
//! `User`/`Api` source check that keeps remote edits from echoing; every
//! selection change is forwarded, whatever moved it.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::engine::{EditorBinding, EditorChange, EditorEngine, EngineError};
use crate::presence::PresenceController;
use crate::protocol::{CursorRange, Delta, DocumentId, ParticipantId, ServerEvent};
use crate::sync::{DocumentSync, SessionState};
use crate::transport::{ConnectionState, Transport, TransportError, TransportEvent, WsTransport};

/// Client-side session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket address of the sync server.
    pub server_url: String,
    /// Period of `save-document` while loaded.
    pub persist_interval: Duration,
    /// Window of the outbound `update-cursor` throttle.
    pub cursor_throttle: Duration,
    /// How long to wait for `load-document` before asking again.
    pub load_timeout: Duration,
    /// Total `get-document` attempts per connection.
    pub max_load_attempts: u32,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Text shown while the document loads.
    pub placeholder: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            persist_interval: Duration::from_millis(2000),
            cursor_throttle: Duration::from_millis(200),
            load_timeout: Duration::from_secs(10),
            max_load_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            placeholder: "Loading...".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn with_cursor_throttle(mut self, window: Duration) -> Self {
        self.cursor_throttle = window;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration, max_attempts: u32) -> Self {
        self.load_timeout = timeout;
        self.max_load_attempts = max_attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }
}

/// Input from the local editor surface.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalInput {
    /// The user typed, pasted or deleted.
    Edit(Delta),
    /// The user moved the selection (`None` = no selection).
    Select(Option<CursorRange>),
    /// The view is being unmounted.
    Close,
}

/// One mounted document view.
pub struct DocumentView<E: EditorEngine, T: Transport> {
    document_id: DocumentId,
    config: SessionConfig,
    editor: EditorBinding<E>,
    transport: T,
    sync: DocumentSync,
    presence: PresenceController,
    connection: ConnectionState,
    connected_once: bool,
    /// Tell the new connection where the local cursor is once reloaded.
    resend_cursor: bool,
    mounted: bool,
}

impl<E: EditorEngine> DocumentView<E, WsTransport> {
    /// Mount a view on a new WebSocket session to `config.server_url`.
    ///
    /// Must be called inside a tokio runtime. Returns the view and the
    /// transport's event stream for [`run`].
    pub fn connect(
        document_id: DocumentId,
        engine: E,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let mut transport = WsTransport::connect(config.server_url.clone(), config.reconnect_delay);
        let events = transport.take_event_rx().ok_or(TransportError::Closed)?;
        Ok((Self::new(document_id, engine, transport, config), events))
    }
}

impl<E: EditorEngine, T: Transport> DocumentView<E, T> {
    pub fn new(document_id: DocumentId, engine: E, transport: T, config: SessionConfig) -> Self {
        let mut editor = EditorBinding::new(engine, &config.placeholder);
        // The placeholder is our own write.
        editor.take_changes();

        Self {
            document_id,
            sync: DocumentSync::new(&config),
            presence: PresenceController::new(config.cursor_throttle),
            config,
            editor,
            transport,
            connection: ConnectionState::Connecting,
            connected_once: false,
            resend_cursor: false,
            mounted: true,
        }
    }

    /// Feed one transport event into the view.
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if !self.mounted {
            return;
        }

        match event {
            TransportEvent::Connected(local_id) => self.on_connected(local_id, now),
            TransportEvent::Disconnected => {
                log::info!("Document {} disconnected, waiting for transport", self.document_id);
                self.connection = ConnectionState::Reconnecting;
            }
            TransportEvent::Event(event) => self.dispatch(event, now),
        }

        self.route_editor_changes(now);
    }

    fn on_connected(&mut self, local_id: ParticipantId, now: Instant) {
        if self.connected_once {
            // Server-side state for the old connection is gone: start over.
            log::info!("Reconnected to {}, reopening document", self.document_id);
            self.sync.close();
            self.sync = DocumentSync::new(&self.config);
            self.editor.disable();
            self.presence.reset(self.editor.cursors());
            self.resend_cursor = true;
        }
        self.connected_once = true;
        self.connection = ConnectionState::Connected;

        self.presence.set_local_id(local_id, self.editor.cursors());
        self.presence.subscribe();
        if let Err(e) = self
            .sync
            .open(self.document_id.clone(), now, &mut self.transport)
        {
            log::error!("Failed to open document {}: {e}", self.document_id);
        }
    }

    fn dispatch(&mut self, event: ServerEvent, now: Instant) {
        let name = event.name();
        let to_sync = self.sync.subscriptions().is_subscribed(name);
        let to_presence = self.presence.subscriptions().is_subscribed(name);
        if !to_sync && !to_presence {
            log::debug!("No subscriber for {name}, dropping");
            return;
        }

        match event {
            ServerEvent::LoadDocument(content) => {
                if let Err(e) = self.sync.on_snapshot_received(&content, now, &mut self.editor) {
                    log::warn!("Failed to load snapshot of {}: {e}", self.document_id);
                }
                if self.resend_cursor && self.sync.state() == SessionState::Loaded {
                    self.resend_cursor = false;
                    if let Some(range) = self.editor.selection() {
                        self.presence.on_local_cursor_changed(Some(range), now);
                    }
                }
            }
            ServerEvent::ReceiveChanges(delta) => {
                if let Err(e) = self.sync.on_remote_delta(&delta, &mut self.editor) {
                    log::warn!("Dropping remote delta: {e}");
                }
            }
            ServerEvent::UpdateCursors(users) => {
                self.presence.on_presence_snapshot(&users, self.editor.cursors());
            }
            ServerEvent::UserConnected(info) => {
                self.presence.on_participant_joined(&info, self.editor.cursors());
            }
            ServerEvent::CursorUpdated { id, cursor } => {
                self.presence.on_cursor_updated(id, cursor, self.editor.cursors());
            }
            ServerEvent::UserDisconnected(id) => {
                self.presence.on_participant_left(id, self.editor.cursors());
            }
        }
    }

    /// Drain editor notifications into the controllers.
    fn route_editor_changes(&mut self, now: Instant) {
        for change in self.editor.take_changes() {
            match change {
                EditorChange::Text { delta, source } => {
                    self.sync.on_local_edit(&delta, source, &mut self.transport);
                }
                // Remote edits move the caret too; peers must see that.
                EditorChange::Selection { range, source } => {
                    log::trace!("Local selection {range:?} ({source:?})");
                    self.presence.on_local_cursor_changed(range, now);
                }
            }
        }
    }

    /// Apply an edit typed by the local user. Refused until the document
    /// has loaded.
    pub fn local_edit(&mut self, delta: &Delta, now: Instant) -> Result<(), EngineError> {
        if !self.mounted {
            return Err(EngineError::Disabled);
        }
        self.editor.apply_local(delta)?;
        self.route_editor_changes(now);
        Ok(())
    }

    pub fn local_selection(&mut self, range: Option<CursorRange>, now: Instant) {
        if !self.mounted {
            return;
        }
        self.editor.select(range);
        self.route_editor_changes(now);
    }

    /// Run the timers that are due at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        if !self.mounted {
            return;
        }
        self.sync.on_timer(now, &self.editor, &mut self.transport);
        self.presence.poll_outbound(now, &mut self.transport);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.sync.next_deadline(), self.presence.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Tear the view down: close the sync controller, drop presence, close
    /// the transport. Idempotent.
    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.sync.close();
        self.presence.close(self.editor.cursors());
        self.transport.close();
        self.mounted = false;
        self.connection = ConnectionState::Disconnected;
        log::info!("Document view {} unmounted", self.document_id);
    }

    /// Subscriptions still registered by either controller.
    pub fn live_subscriptions(&self) -> usize {
        self.sync.subscriptions().len() + self.presence.subscriptions().len()
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn state(&self) -> SessionState {
        self.sync.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn editor(&self) -> &EditorBinding<E> {
        &self.editor
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sync(&self) -> &DocumentSync {
        &self.sync
    }

    pub fn presence(&self) -> &PresenceController {
        &self.presence
    }
}

/// Drive a view until its input stream closes or asks to close.
///
/// Transport events, local input and timers are handled one at a time on
/// this task, transport events first. The view is unmounted before it is returned.
pub async fn run<E: EditorEngine, T: Transport>(
    mut view: DocumentView<E, T>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut inputs: mpsc::Receiver<LocalInput>,
) -> DocumentView<E, T> {
    loop {
        let deadline = view.next_deadline();

        tokio::select! {
            biased;

            event = events.recv() => match event {
                Some(event) => view.handle_transport_event(event, Instant::now()),
                None => {
                    log::info!("Transport for {} ended", view.document_id());
                    break;
                }
            },

            input = inputs.recv() => match input {
                Some(LocalInput::Edit(delta)) => {
                    if let Err(e) = view.local_edit(&delta, Instant::now()) {
                        log::debug!("Local edit refused: {e}");
                    }
                }
                Some(LocalInput::Select(range)) => view.local_selection(range, Instant::now()),
                Some(LocalInput::Close) | None => break,
            },

            _ = sleep_until(deadline) => view.on_timer(Instant::now()),
        }
    }

    view.unmount();
    view
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CursorDecorations;
    use crate::protocol::{ClientEvent, EventName, ParticipantId, PresenceEntry, UserInfo};
    use crate::rich_text::{RichTextEngine, TextDelta};
    use crate::transport::MemoryTransport;
    use std::collections::BTreeMap;

    type View = DocumentView<RichTextEngine, MemoryTransport>;

    fn view() -> View {
        DocumentView::new(
            DocumentId::new("abc"),
            RichTextEngine::new(),
            MemoryTransport::new(),
            SessionConfig::default(),
        )
    }

    fn snapshot(text: &str) -> TransportEvent {
        TransportEvent::Event(ServerEvent::LoadDocument(
            TextDelta::new().insert(text).to_content().unwrap(),
        ))
    }

    fn loaded(now: Instant) -> View {
        let mut view = view();
        view.handle_transport_event(TransportEvent::Connected(ParticipantId::new()), now);
        view.handle_transport_event(snapshot("hi"), now);
        view.transport_mut().take_sent();
        view
    }

    #[test]
    fn test_mount_shows_placeholder() {
        let view = view();
        assert_eq!(view.editor().engine().text(), "Loading...");
        assert!(!view.editor().is_enabled());
        assert_eq!(view.connection_state(), ConnectionState::Connecting);
        assert!(view.transport().sent().is_empty());
    }

    #[test]
    fn test_connect_opens_document() {
        let mut view = view();
        view.handle_transport_event(TransportEvent::Connected(ParticipantId::new()), Instant::now());

        assert_eq!(
            view.transport().sent(),
            &[ClientEvent::GetDocument(DocumentId::new("abc"))]
        );
        assert_eq!(view.live_subscriptions(), 6);
    }

    #[test]
    fn test_snapshot_before_connect_dropped() {
        let mut view = view();
        view.handle_transport_event(snapshot("hi"), Instant::now());
        assert_eq!(view.state(), SessionState::Initializing);
        assert_eq!(view.editor().engine().text(), "Loading...");
    }

    #[test]
    fn test_scenario_load_type_receive() {
        let now = Instant::now();
        let mut view = view();
        view.handle_transport_event(TransportEvent::Connected(ParticipantId::new()), now);
        view.handle_transport_event(snapshot("hi"), now);

        assert_eq!(view.editor().engine().text(), "hi");
        assert!(view.editor().is_enabled());
        assert_eq!(view.state(), SessionState::Loaded);
        view.transport_mut().take_sent();

        let typed = TextDelta::new().retain(2).insert("!").to_wire().unwrap();
        view.local_edit(&typed, now).unwrap();
        assert_eq!(view.transport().sent(), &[ClientEvent::SendChanges(typed)]);
        view.transport_mut().take_sent();

        let remote = TextDelta::new().retain(3).insert("?").to_wire().unwrap();
        view.handle_transport_event(TransportEvent::Event(ServerEvent::ReceiveChanges(remote)), now);
        assert_eq!(view.editor().engine().text(), "hi!?");
        assert!(view.transport().sent().is_empty());
    }

    #[test]
    fn test_second_snapshot_ignored() {
        let now = Instant::now();
        let mut view = loaded(now);
        view.handle_transport_event(snapshot("other"), now);
        assert_eq!(view.editor().engine().text(), "hi");
    }

    #[test]
    fn test_edit_refused_while_initializing() {
        let now = Instant::now();
        let mut view = view();
        view.handle_transport_event(TransportEvent::Connected(ParticipantId::new()), now);
        view.transport_mut().take_sent();

        let typed = TextDelta::new().insert("x").to_wire().unwrap();
        assert!(view.local_edit(&typed, now).is_err());
        assert!(view.transport().sent().is_empty());
    }

    #[test]
    fn test_persistence_every_interval_without_edits() {
        let t0 = Instant::now();
        let mut view = loaded(t0);

        view.on_timer(t0 + Duration::from_millis(2000));
        view.on_timer(t0 + Duration::from_millis(4000));

        let content = TextDelta::new().insert("hi").to_content().unwrap();
        assert_eq!(
            view.transport().sent(),
            &[
                ClientEvent::SaveDocument(content.clone()),
                ClientEvent::SaveDocument(content)
            ]
        );
    }

    #[test]
    fn test_local_selection_throttled_out() {
        let t0 = Instant::now();
        let mut view = loaded(t0);

        view.local_selection(Some(CursorRange::caret(1)), t0);
        view.local_selection(Some(CursorRange::new(0, 2)), t0 + Duration::from_millis(20));
        assert_eq!(view.next_deadline(), Some(t0 + Duration::from_millis(200)));

        view.on_timer(t0 + Duration::from_millis(200));
        assert_eq!(
            view.transport().sent(),
            &[ClientEvent::UpdateCursor(Some(CursorRange::new(0, 2)))]
        );
    }

    #[test]
    fn test_presence_events_routed() {
        let now = Instant::now();
        let local = ParticipantId::new();
        let mut view = view();
        view.handle_transport_event(TransportEvent::Connected(local), now);

        let bob = UserInfo::generated(ParticipantId::new());
        let mut users = BTreeMap::new();
        users.insert(local, PresenceEntry::from_user(&UserInfo::generated(local)));
        users.insert(bob.id, PresenceEntry::from_user(&bob));
        view.handle_transport_event(TransportEvent::Event(ServerEvent::UpdateCursors(users)), now);
        view.handle_transport_event(
            TransportEvent::Event(ServerEvent::CursorUpdated {
                id: bob.id,
                cursor: Some(CursorRange::caret(1)),
            }),
            now,
        );

        assert_eq!(view.presence().len(), 1);
        assert_eq!(
            view.editor().engine().overlay().get(&bob.id).map(|d| d.range),
            Some(Some(CursorRange::caret(1)))
        );

        view.handle_transport_event(TransportEvent::Event(ServerEvent::UserDisconnected(bob.id)), now);
        assert!(view.presence().is_empty());
        assert_eq!(view.editor().engine().overlay().cursor_count(), 0);
    }

    #[test]
    fn test_reconnect_reopens_document() {
        let now = Instant::now();
        let mut view = loaded(now);
        let bob = UserInfo::generated(ParticipantId::new());
        view.handle_transport_event(TransportEvent::Event(ServerEvent::UserConnected(bob)), now);

        view.handle_transport_event(TransportEvent::Disconnected, now);
        assert_eq!(view.connection_state(), ConnectionState::Reconnecting);

        view.handle_transport_event(TransportEvent::Connected(ParticipantId::new()), now);
        assert_eq!(view.connection_state(), ConnectionState::Connected);
        assert_eq!(view.state(), SessionState::Initializing);
        assert!(!view.editor().is_enabled());
        assert!(view.presence().is_empty());
        assert_eq!(view.transport().count(EventName::GetDocument), 1);

        view.handle_transport_event(snapshot("fresh"), now);
        assert_eq!(view.editor().engine().text(), "fresh");
        assert!(view.editor().is_enabled());
    }

    #[test]
    fn test_caret_shifted_by_remote_edit_is_sent() {
        let t0 = Instant::now();
        let mut view = loaded(t0);
        view.local_selection(Some(CursorRange::caret(1)), t0);
        view.on_timer(t0 + Duration::from_millis(200));
        view.transport_mut().take_sent();

        let remote = TextDelta::new().insert(">> ").to_wire().unwrap();
        view.handle_transport_event(
            TransportEvent::Event(ServerEvent::ReceiveChanges(remote)),
            t0 + Duration::from_millis(500),
        );
        assert_eq!(view.editor().selection(), Some(CursorRange::caret(4)));

        view.on_timer(t0 + Duration::from_millis(1000));
        assert_eq!(
            view.transport().sent(),
            &[ClientEvent::UpdateCursor(Some(CursorRange::caret(4)))]
        );
    }

    #[test]
    fn test_reconnect_resends_local_cursor_after_reload() {
        let t0 = Instant::now();
        let mut view = loaded(t0);
        view.local_selection(Some(CursorRange::caret(1)), t0);
        view.on_timer(t0 + Duration::from_millis(200));
        view.transport_mut().take_sent();

        let t1 = t0 + Duration::from_millis(500);
        view.handle_transport_event(TransportEvent::Disconnected, t1);
        view.handle_transport_event(TransportEvent::Connected(ParticipantId::new()), t1);
        view.on_timer(t1 + Duration::from_millis(300));
        // Nothing to say until the document is back.
        assert_eq!(view.transport().count(EventName::UpdateCursor), 0);

        view.handle_transport_event(snapshot("hi again"), t1 + Duration::from_millis(400));
        view.on_timer(t1 + Duration::from_millis(600));
        assert_eq!(
            view.transport().sent(),
            &[
                ClientEvent::GetDocument(DocumentId::new("abc")),
                ClientEvent::UpdateCursor(Some(CursorRange::caret(1)))
            ]
        );

        // Only once per reconnect.
        view.handle_transport_event(snapshot("ignored"), t1 + Duration::from_millis(700));
        view.on_timer(t1 + Duration::from_millis(1200));
        assert_eq!(view.transport().count(EventName::UpdateCursor), 1);
    }

    #[test]
    fn test_unmount_leaves_no_subscriptions() {
        let t0 = Instant::now();
        let mut view = loaded(t0);
        view.local_selection(Some(CursorRange::caret(0)), t0);

        view.unmount();
        view.unmount();

        assert!(!view.is_mounted());
        assert_eq!(view.live_subscriptions(), 0);
        assert_eq!(view.next_deadline(), None);
        assert!(view.transport().is_closed());

        view.on_timer(t0 + Duration::from_secs(10));
        view.handle_transport_event(snapshot("late"), t0);
        assert!(view.transport().sent().is_empty());
        assert_eq!(view.editor().engine().text(), "hi");
    }

    #[tokio::test]
    async fn test_run_until_close() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(16);
        let handle = tokio::spawn(run(view(), event_rx, input_rx));

        event_tx
            .send(TransportEvent::Connected(ParticipantId::new()))
            .await
            .unwrap();
        event_tx.send(snapshot("hi")).await.unwrap();
        input_tx
            .send(LocalInput::Edit(TextDelta::new().retain(2).insert("!").to_wire().unwrap()))
            .await
            .unwrap();
        input_tx.send(LocalInput::Close).await.unwrap();

        let view = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("driver did not stop")
            .expect("driver panicked");

        assert!(!view.is_mounted());
        assert_eq!(view.live_subscriptions(), 0);
        assert_eq!(view.transport().count(EventName::GetDocument), 1);
    }
}
