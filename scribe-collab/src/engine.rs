//! Editor Engine Binding.
//!
//! The rich-text surface lives outside this crate. [`EditorEngine`] is the
//! contract the session needs from it, and [`EditorBinding`] owns exactly
//! one engine per document view.
//!
//! Every mutation of the engine, whoever caused it, comes back out of
//! [`EditorEngine::take_changes`] tagged with its [`ChangeSource`]. The
//! sync controller forwards only `User` changes; that tag is what keeps a
//! remote delta from being re-broadcast.

use crate::protocol::{CursorRange, Delta, DocumentContent, ParticipantId};
use crate::rich_text::DeltaError;

/// Who caused an editor mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Typed, pasted or selected by the local user.
    User,
    /// Programmatic: snapshot loads, remote deltas, placeholders.
    Api,
}

/// Change notification raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorChange {
    Text {
        delta: Delta,
        source: ChangeSource,
    },
    Selection {
        range: Option<CursorRange>,
        source: ChangeSource,
    },
}

/// Remote cursor overlay of the editor surface.
pub trait CursorDecorations {
    /// Create a decoration. Calling it for an existing id must not duplicate it.
    fn create_cursor(&mut self, id: ParticipantId, name: &str, color: &str);
    fn move_cursor(&mut self, id: ParticipantId, range: Option<CursorRange>);
    fn remove_cursor(&mut self, id: ParticipantId);
    fn cursor_count(&self) -> usize;
}

/// What the session needs from a rich-text editor.
pub trait EditorEngine {
    type Cursors: CursorDecorations;

    /// Replace the whole document.
    fn set_contents(
        &mut self,
        content: &DocumentContent,
        source: ChangeSource,
    ) -> Result<(), EngineError>;

    /// Apply an incremental edit on top of the current document.
    fn update_contents(&mut self, delta: &Delta, source: ChangeSource) -> Result<(), EngineError>;

    /// Full snapshot of the current document.
    fn contents(&self) -> Result<DocumentContent, EngineError>;

    /// Replace the document with unformatted text.
    fn set_text(&mut self, text: &str, source: ChangeSource) -> Result<(), EngineError>;

    fn set_selection(&mut self, range: Option<CursorRange>, source: ChangeSource);

    /// Current local selection (`None` = no selection).
    fn selection(&self) -> Option<CursorRange>;

    fn enable(&mut self);

    fn disable(&mut self);

    fn is_enabled(&self) -> bool;

    /// Drain pending change notifications in the order they happened.
    fn take_changes(&mut self) -> Vec<EditorChange>;

    fn cursors(&mut self) -> &mut Self::Cursors;
}

/// Editor engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Editor is disabled")]
    Disabled,
    #[error(transparent)]
    Delta(#[from] DeltaError),
}

/// Owns the single engine instance of one document view.
///
/// The engine starts disabled and shows placeholder text until the first
/// snapshot is loaded.
pub struct EditorBinding<E: EditorEngine> {
    engine: E,
}

impl<E: EditorEngine> EditorBinding<E> {
    pub fn new(mut engine: E, placeholder: &str) -> Self {
        engine.disable();
        if let Err(e) = engine.set_text(placeholder, ChangeSource::Api) {
            log::warn!("Failed to show placeholder: {e}");
        }
        Self { engine }
    }

    /// Replace the document with a snapshot (programmatic change).
    pub fn load(&mut self, content: &DocumentContent) -> Result<(), EngineError> {
        self.engine.set_contents(content, ChangeSource::Api)
    }

    /// Apply a delta received from another participant (programmatic change).
    pub fn apply_remote(&mut self, delta: &Delta) -> Result<(), EngineError> {
        self.engine.update_contents(delta, ChangeSource::Api)
    }

    /// Apply an edit typed by the local user. Refused while disabled.
    pub fn apply_local(&mut self, delta: &Delta) -> Result<(), EngineError> {
        self.engine.update_contents(delta, ChangeSource::User)
    }

    /// Move the local selection.
    pub fn select(&mut self, range: Option<CursorRange>) {
        self.engine.set_selection(range, ChangeSource::User);
    }

    pub fn selection(&self) -> Option<CursorRange> {
        self.engine.selection()
    }

    pub fn snapshot(&self) -> Result<DocumentContent, EngineError> {
        self.engine.contents()
    }

    pub fn enable(&mut self) {
        self.engine.enable();
    }

    pub fn disable(&mut self) {
        self.engine.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_enabled()
    }

    pub fn take_changes(&mut self) -> Vec<EditorChange> {
        self.engine.take_changes()
    }

    pub fn cursors(&mut self) -> &mut E::Cursors {
        self.engine.cursors()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}
