//! # scribe-collab: Collaborative document sessions
//!
//! Lets several participants edit one rich-text document at the same time:
//! each sees the others' edits and cursors, and the document is saved on a
//! fixed cadence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ DocumentView     │ ◄────────────────► │ SyncServer       │
//! │ (per document)   │   bincode frames   │ (central)        │
//! └───┬──────────┬───┘                    └────────┬─────────┘
//!     │          │                                 │
//!     ▼          ▼                                 ▼
//! ┌────────┐ ┌──────────┐                 ┌──────────────────┐
//! │ Sync   │ │ Presence │                 │ DocumentRegistry │
//! │ ctrl   │ │ ctrl     │                 │ (rooms, fan-out) │
//! └───┬────┘ └────┬─────┘                 └────────┬─────────┘
//!     │           │                                │
//!     ▼           ▼                                ▼
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ EditorBinding    │                    │ DocumentStore    │
//! │ (rich-text)      │                    │ (RocksDB + LZ4)  │
//! └──────────────────┘                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire events and their bincode codec
//! - [`rich_text`]: Headless rich-text engine over JSON deltas
//! - [`engine`]: Editor engine contract and the per-view binding
//! - [`transport`]: Transport session contract, WebSocket and in-memory
//! - [`throttle`]: Trailing-edge rate limiter
//! - [`subscriptions`]: Idempotent per-controller event subscriptions
//! - [`sync`]: Document Sync Controller
//! - [`presence`]: Presence Controller
//! - [`session`]: Document view lifecycle and its async driver
//! - [`registry`]: Server-side rooms with fan-out
//! - [`server`]: WebSocket sync server
//! - [`storage`]: Snapshot store

pub mod protocol;
pub mod rich_text;
pub mod engine;
pub mod transport;
pub mod throttle;
pub mod subscriptions;
pub mod sync;
pub mod presence;
pub mod session;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, CursorRange, Delta, DocumentContent, DocumentId, EventName, ParticipantId,
    PresenceEntry, ProtocolError, ServerEvent, ServerFrame, UserInfo,
};
pub use rich_text::{CursorOverlay, DeltaError, RichTextEngine, TextDelta};
pub use engine::{ChangeSource, CursorDecorations, EditorBinding, EditorChange, EditorEngine, EngineError};
pub use transport::{ConnectionState, MemoryTransport, Transport, TransportError, TransportEvent, WsTransport};
pub use throttle::Throttle;
pub use subscriptions::Subscriptions;
pub use sync::{DocumentSync, SessionState, SyncError};
pub use presence::{Participant, PresenceController};
pub use session::{run, DocumentView, LocalInput, SessionConfig};
pub use registry::{DocumentRegistry, RegistryError, RegistryStats};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
