//! Integration tests for presence over a real server.
//!
//! Two or three views share a document; each test checks that joins,
//! throttled cursor moves and departures show up in the other views'
//! participant maps and cursor overlays.

use std::time::Instant;

use scribe_collab::engine::CursorDecorations;
use scribe_collab::protocol::{CursorRange, DocumentId, ParticipantId};
use scribe_collab::rich_text::{RichTextEngine, TextDelta};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_collab::session::{DocumentView, SessionConfig};
use scribe_collab::sync::SessionState;
use scribe_collab::transport::{TransportEvent, WsTransport};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

type View = DocumentView<RichTextEngine, WsTransport>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        storage_path: None,
    };
    let server = SyncServer::new(config).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn mount(url: &str, doc: &str) -> (View, mpsc::Receiver<TransportEvent>) {
    let config = SessionConfig::default()
        .with_server_url(url)
        .with_cursor_throttle(Duration::from_millis(50));
    let (mut view, mut events) =
        DocumentView::connect(DocumentId::new(doc), RichTextEngine::new(), config).unwrap();
    pump_until(&mut view, &mut events, |v| v.state() == SessionState::Loaded).await;
    (view, events)
}

async fn pump_until<F>(view: &mut View, events: &mut mpsc::Receiver<TransportEvent>, mut done: F)
where
    F: FnMut(&View) -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !done(view) {
            let event = events.recv().await.expect("Transport event stream ended");
            view.handle_transport_event(event, Instant::now());
        }
    })
    .await
    .expect("Condition not reached in time");
}

fn local_id(view: &View) -> ParticipantId {
    view.presence().local_id().expect("View has no local id")
}

/// Move the local cursor and wait out the throttle so it is sent.
async fn move_cursor(view: &mut View, range: CursorRange) {
    view.local_selection(Some(range), Instant::now());
    if let Some(deadline) = view.presence().next_deadline() {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
    view.on_timer(Instant::now());
}

#[tokio::test]
async fn test_late_joiner_receives_roster() {
    let url = start_test_server().await;
    let (alice, _alice_events) = mount(&url, "roster").await;
    let (mut bob, mut bob_events) = mount(&url, "roster").await;

    let alice_id = local_id(&alice);
    pump_until(&mut bob, &mut bob_events, |v| v.presence().participant(&alice_id).is_some()).await;

    assert_eq!(bob.presence().len(), 1);
    assert_eq!(bob.editor().engine().overlay().cursor_count(), 1);
    assert!(bob.presence().participant(&local_id(&bob)).is_none());
}

#[tokio::test]
async fn test_user_connected_adds_cursor() {
    let url = start_test_server().await;
    let (mut alice, mut alice_events) = mount(&url, "join").await;
    let (bob, _bob_events) = mount(&url, "join").await;

    let bob_id = local_id(&bob);
    pump_until(&mut alice, &mut alice_events, |v| v.presence().participant(&bob_id).is_some()).await;

    let participant = alice.presence().participant(&bob_id).unwrap();
    assert!(participant.name.starts_with("Guest-"));
    assert!(participant.color.starts_with('#'));
    assert_eq!(participant.cursor, None);
}

#[tokio::test]
async fn test_cursor_move_reaches_peer() {
    let url = start_test_server().await;
    let (mut alice, mut alice_events) = mount(&url, "cursor").await;
    let (mut bob, mut bob_events) = mount(&url, "cursor").await;
    let alice_id = local_id(&alice);

    // Give alice something to point at.
    let delta = TextDelta::new().insert("hello world").to_wire().unwrap();
    alice.local_edit(&delta, Instant::now()).unwrap();
    pump_until(&mut bob, &mut bob_events, |v| v.editor().engine().text() == "hello world").await;

    move_cursor(&mut alice, CursorRange::new(6, 5)).await;

    pump_until(&mut bob, &mut bob_events, |v| {
        v.presence()
            .participant(&alice_id)
            .and_then(|p| p.cursor)
            == Some(CursorRange::new(6, 5))
    })
    .await;

    let decoration = bob.editor().engine().overlay().get(&alice_id).unwrap();
    assert_eq!(decoration.range, Some(CursorRange::new(6, 5)));

    // Alice never draws her own cursor.
    pump_until(&mut alice, &mut alice_events, |v| v.presence().len() == 1).await;
    assert!(alice.editor().engine().overlay().get(&alice_id).is_none());
}

#[tokio::test]
async fn test_cursor_burst_is_coalesced() {
    let url = start_test_server().await;
    let (mut alice, _alice_events) = mount(&url, "burst").await;
    let (mut bob, mut bob_events) = mount(&url, "burst").await;
    let alice_id = local_id(&alice);

    let now = Instant::now();
    for i in 0..20 {
        alice.local_selection(Some(CursorRange::caret(i)), now);
    }
    move_cursor(&mut alice, CursorRange::caret(42)).await;

    pump_until(&mut bob, &mut bob_events, |v| {
        v.presence()
            .participant(&alice_id)
            .and_then(|p| p.cursor)
            == Some(CursorRange::caret(42))
    })
    .await;
    assert_eq!(alice.presence().next_deadline(), None);
}

#[tokio::test]
async fn test_user_disconnected_removes_cursor() {
    let url = start_test_server().await;
    let (mut alice, mut alice_events) = mount(&url, "leave").await;
    let (mut bob, _bob_events) = mount(&url, "leave").await;
    let bob_id = local_id(&bob);

    pump_until(&mut alice, &mut alice_events, |v| v.presence().participant(&bob_id).is_some()).await;
    assert_eq!(alice.editor().engine().overlay().cursor_count(), 1);

    bob.unmount();
    pump_until(&mut alice, &mut alice_events, |v| v.presence().is_empty()).await;
    assert_eq!(alice.editor().engine().overlay().cursor_count(), 0);
}

#[tokio::test]
async fn test_three_views_see_each_other() {
    let url = start_test_server().await;
    let (mut a, mut a_events) = mount(&url, "trio").await;
    let (mut b, mut b_events) = mount(&url, "trio").await;
    let (mut c, mut c_events) = mount(&url, "trio").await;

    pump_until(&mut a, &mut a_events, |v| v.presence().len() == 2).await;
    pump_until(&mut b, &mut b_events, |v| v.presence().len() == 2).await;
    pump_until(&mut c, &mut c_events, |v| v.presence().len() == 2).await;

    for view in [&a, &b, &c] {
        let me = local_id(view);
        assert!(view.presence().participant(&me).is_none());
        assert_eq!(view.editor().engine().overlay().cursor_count(), 2);
    }
}
