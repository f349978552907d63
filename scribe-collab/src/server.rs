//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (document id) ── DocumentRegistry ── broadcast
//! Client B ──┘          │
//!                       └── DocumentStore (RocksDB, optional)
//! ```
//!
//! Every connection is assigned a [`ParticipantId`] and told about it in a
//! handshake frame before anything else. From then on:
//!
//! - `get-document` joins the room and answers `load-document` followed by
//!   `update-cursors`; the others get `user-connected`
//! - `send-changes` goes to the others as `receive-changes`
//! - `save-document` replaces the room's content and persists it
//! - `update-cursor` goes to the others as `cursor-updated`
//! - a closed socket leaves the room (`user-disconnected`)
//! - a participant whose room receiver lags is disconnected; its client
//!   reconnects and loads a fresh snapshot

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{
    ClientEvent, DocumentId, ParticipantId, ProtocolError, ServerEvent, ServerFrame, UserInfo,
};
use crate::registry::{DocumentRegistry, RegistryError, RoomFrame};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server. Opens the document store if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };

        let registry = Arc::new(DocumentRegistry::new(
            store,
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));

        Ok(Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self::from_registry(ServerConfig::default(), Arc::new(DocumentRegistry::in_memory()))
    }

    /// Server over an existing registry.
    pub fn from_registry(config: ServerConfig, registry: Arc<DocumentRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats.persisted_snapshots = self.registry.stats().persisted_snapshots;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }
}

/// Room membership of one connection.
struct Membership {
    document_id: DocumentId,
    receiver: broadcast::Receiver<Arc<RoomFrame>>,
}

async fn send_frame(sink: &mut WsSink, frame: ServerFrame) -> Result<(), ServerError> {
    let bytes = frame.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<DocumentRegistry>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let user = UserInfo::generated(ParticipantId::new());
    log::info!("WebSocket connection from {addr} as {} ({})", user.name, user.id);

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut membership: Option<Membership> = None;
    let result = serve_participant(
        &mut ws_sender,
        &mut ws_receiver,
        &user,
        &mut membership,
        &registry,
        &stats,
    )
    .await;

    if let Some(membership) = membership {
        registry.leave(&membership.document_id, user.id).await;
    }
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    log::info!("Connection closed from {addr} ({})", user.id);

    result
}

async fn serve_participant(
    ws_sender: &mut WsSink,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    user: &UserInfo,
    membership: &mut Option<Membership>,
    registry: &DocumentRegistry,
    stats: &RwLock<ServerStats>,
) -> Result<(), ServerError> {
    send_frame(ws_sender, ServerFrame::Handshake(user.id)).await?;

    loop {
        tokio::select! {
            // Room first: a connection drains its own echoes before reading
            // its next frame, so only other participants can make it lag.
            biased;

            frame = async {
                match membership.as_mut() {
                    Some(m) => m.receiver.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match frame {
                    Ok(frame) => {
                        if frame.sender == user.id {
                            continue;
                        }
                        ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed deltas cannot be replayed. Dropping the
                        // connection makes the client reconnect and reload.
                        log::warn!("Participant {} lagged by {n} frames, disconnecting", user.id);
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        *membership = None;
                    }
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match ClientEvent::decode(&data) {
                            Ok(event) => {
                                handle_event(event, ws_sender, user, membership, registry).await?;
                            }
                            Err(e) => log::warn!("Failed to decode frame from {}: {e}", user.id),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {}: {e}", user.id);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn handle_event(
    event: ClientEvent,
    ws_sender: &mut WsSink,
    user: &UserInfo,
    membership: &mut Option<Membership>,
    registry: &DocumentRegistry,
) -> Result<(), ServerError> {
    let document_id = match event {
        ClientEvent::GetDocument(document_id) => document_id,
        other => {
            handle_room_event(other, user, membership.as_ref(), registry).await;
            return Ok(());
        }
    };

    // A repeated request for the same document is a retry: answer it again.
    if let Some(current) = membership.as_ref() {
        if current.document_id == document_id {
            let content = registry.content(&document_id).await.unwrap_or_default();
            let roster = registry.roster(&document_id, user.id).await;
            send_frame(ws_sender, ServerEvent::LoadDocument(content).into()).await?;
            send_frame(ws_sender, ServerEvent::UpdateCursors(roster).into()).await?;
            return Ok(());
        }
    }

    if let Some(previous) = membership.take() {
        registry.leave(&previous.document_id, user.id).await;
    }

    match registry.join(&document_id, user).await {
        Ok(joined) => {
            *membership = Some(Membership {
                document_id,
                receiver: joined.receiver,
            });
            send_frame(ws_sender, ServerEvent::LoadDocument(joined.content).into()).await?;
            send_frame(ws_sender, ServerEvent::UpdateCursors(joined.roster).into()).await?;
        }
        Err(RegistryError::RoomFull { document_id, max }) => {
            log::warn!("{} refused: {document_id} already has {max} participants", user.id);
        }
        Err(e) => log::error!("{} could not join {document_id}: {e}", user.id),
    }
    Ok(())
}

/// Events that only make sense inside a room.
async fn handle_room_event(
    event: ClientEvent,
    user: &UserInfo,
    membership: Option<&Membership>,
    registry: &DocumentRegistry,
) {
    let name = event.name();
    let Some(current) = membership else {
        log::debug!("{name} from {} before get-document, ignoring", user.id);
        return;
    };

    let result = match event {
        ClientEvent::SendChanges(delta) => registry
            .broadcast_changes(&current.document_id, user.id, delta)
            .await
            .map(|_| ()),
        ClientEvent::SaveDocument(content) => registry.save(&current.document_id, content).await,
        ClientEvent::UpdateCursor(cursor) => registry
            .update_cursor(&current.document_id, user.id, cursor)
            .await
            .map(|_| ()),
        ClientEvent::GetDocument(_) => Ok(()),
    };
    if let Err(e) = result {
        log::warn!("Failed to handle {name} from {}: {e}", user.id);
    }
}
