//! Reference rich-text engine.
//!
//! Documents and edits share one representation, a [`TextDelta`]: a list of
//! `insert` / `retain` / `delete` operations with optional formatting
//! attributes, encoded as JSON on the wire:
//!
//! ```text
//! {"ops":[{"insert":"hi"}]}                       document "hi"
//! {"ops":[{"retain":2},{"insert":"!"}]}           append "!" after 2 chars
//! {"ops":[{"retain":1,"attributes":{"bold":true}}]}
//! ```
//!
//! A document is a delta made only of inserts. Applying an edit is
//! composition followed by a check that the result is still a document.
//! Lengths count Unicode scalar values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::{ChangeSource, CursorDecorations, EditorChange, EditorEngine, EngineError};
use crate::protocol::{CursorRange, Delta, DocumentContent, ParticipantId};

/// Formatting attributes. A `null` value removes the attribute.
pub type Attributes = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert(String),
    Retain(usize),
    Delete(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    #[serde(flatten)]
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Attributes,
}

impl Op {
    pub fn insert(text: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Insert(text.into()),
            attributes: Attributes::new(),
        }
    }

    pub fn retain(len: usize) -> Self {
        Self {
            kind: OpKind::Retain(len),
            attributes: Attributes::new(),
        }
    }

    pub fn delete(len: usize) -> Self {
        Self {
            kind: OpKind::Delete(len),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn len(&self) -> usize {
        match &self.kind {
            OpKind::Insert(text) => text.chars().count(),
            OpKind::Retain(len) | OpKind::Delete(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert(_))
    }

    fn is_delete(&self) -> bool {
        matches!(self.kind, OpKind::Delete(_))
    }
}

/// Ordered list of edit operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextDelta {
    #[serde(default)]
    pub ops: Vec<Op>,
}

impl TextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(Op::insert(text));
        self
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        self.push(Op::insert(text).with_attributes(attributes));
        self
    }

    pub fn retain(mut self, len: usize) -> Self {
        self.push(Op::retain(len));
        self
    }

    pub fn retain_with(mut self, len: usize, attributes: Attributes) -> Self {
        self.push(Op::retain(len).with_attributes(attributes));
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(Op::delete(len));
        self
    }

    /// Append an op, merging it into its neighbour where possible.
    ///
    /// Inserts are kept ahead of an adjacent delete so equal edits have one
    /// canonical form.
    pub fn push(&mut self, op: Op) {
        if op.is_empty() {
            return;
        }

        let mut index = self.ops.len();
        if let Some(last) = self.ops.last_mut() {
            if let (OpKind::Delete(total), OpKind::Delete(more)) = (&mut last.kind, &op.kind) {
                *total += more;
                return;
            }
            if last.is_delete() && op.is_insert() {
                index -= 1;
            }
        }

        if index > 0 {
            let prev = &mut self.ops[index - 1];
            if prev.attributes == op.attributes {
                match (&mut prev.kind, &op.kind) {
                    (OpKind::Insert(text), OpKind::Insert(more)) => {
                        text.push_str(more);
                        return;
                    }
                    (OpKind::Retain(total), OpKind::Retain(more)) => {
                        *total += more;
                        return;
                    }
                    _ => {}
                }
            }
        }

        self.ops.insert(index, op);
    }

    /// Drop a trailing unformatted retain, which changes nothing.
    pub fn chop(mut self) -> Self {
        if let Some(last) = self.ops.last() {
            if matches!(last.kind, OpKind::Retain(_)) && last.attributes.is_empty() {
                self.ops.pop();
            }
        }
        self
    }

    /// Total length covered by the ops.
    pub fn length(&self) -> usize {
        self.ops.iter().map(Op::len).sum()
    }

    /// Whether this delta only inserts, i.e. describes a whole document.
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(Op::is_insert)
    }

    /// Concatenated text of all inserts.
    pub fn plain_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match &op.kind {
                OpKind::Insert(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Sequential composition: the result has the effect of `self` then `other`.
    pub fn compose(&self, other: &TextDelta) -> TextDelta {
        let mut this = OpCursor::new(&self.ops);
        let mut that = OpCursor::new(&other.ops);
        let mut out = TextDelta::new();

        while this.has_next() || that.has_next() {
            if that.peek_is_insert() {
                out.push(that.next(usize::MAX));
            } else if this.peek_is_delete() {
                out.push(this.next(usize::MAX));
            } else {
                let len = this.peek_len().min(that.peek_len());
                let a = this.next(len);
                let b = that.next(len);
                match b.kind {
                    OpKind::Retain(_) => {
                        let keep_null = matches!(a.kind, OpKind::Retain(_));
                        let attributes = compose_attributes(&a.attributes, &b.attributes, keep_null);
                        out.push(Op {
                            kind: a.kind,
                            attributes,
                        });
                    }
                    OpKind::Delete(_) => {
                        // Deleting freshly inserted text cancels both.
                        if matches!(a.kind, OpKind::Retain(_)) {
                            out.push(Op::delete(len));
                        }
                    }
                    OpKind::Insert(_) => {}
                }
            }
        }

        out.chop()
    }

    /// Apply an edit to this document.
    pub fn apply(&self, edit: &TextDelta) -> Result<TextDelta, DeltaError> {
        let result = self.compose(edit);
        if !result.is_document() {
            return Err(DeltaError::OutOfBounds {
                length: self.length(),
            });
        }
        Ok(result)
    }

    /// Where `index` ends up after this edit. Inserts at `index` push it right.
    pub fn transform_position(&self, index: usize) -> usize {
        let mut index = index;
        let mut offset = 0;
        for op in &self.ops {
            if offset > index {
                break;
            }
            let len = op.len();
            match op.kind {
                OpKind::Delete(_) => {
                    index -= len.min(index - offset);
                    continue;
                }
                OpKind::Insert(_) => index += len,
                OpKind::Retain(_) => {}
            }
            offset += len;
        }
        index
    }

    pub fn to_wire(&self) -> Result<Delta, DeltaError> {
        Ok(Delta(serde_json::to_vec(self)?))
    }

    pub fn from_wire(delta: &Delta) -> Result<Self, DeltaError> {
        Ok(serde_json::from_slice(delta.as_bytes())?)
    }

    pub fn to_content(&self) -> Result<DocumentContent, DeltaError> {
        Ok(DocumentContent(serde_json::to_vec(self)?))
    }

    /// Decode a snapshot. Empty content is the empty document.
    pub fn from_content(content: &DocumentContent) -> Result<Self, DeltaError> {
        if content.is_empty() {
            return Ok(Self::new());
        }
        let doc: TextDelta = serde_json::from_slice(content.as_bytes())?;
        if !doc.is_document() {
            return Err(DeltaError::NotADocument);
        }
        Ok(doc)
    }
}

fn compose_attributes(a: &Attributes, b: &Attributes, keep_null: bool) -> Attributes {
    let mut merged = a.clone();
    for (key, value) in b {
        merged.insert(key.clone(), value.clone());
    }
    if keep_null {
        merged
    } else {
        merged.into_iter().filter(|(_, v)| !v.is_null()).collect()
    }
}

/// Walks a list of ops, handing out pieces of a requested length.
/// Past the end it behaves like an endless plain retain.
struct OpCursor<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    fn peek_is_insert(&self) -> bool {
        self.ops.get(self.index).is_some_and(Op::is_insert)
    }

    fn peek_is_delete(&self) -> bool {
        self.ops.get(self.index).is_some_and(Op::is_delete)
    }

    fn next(&mut self, max: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::retain(max);
        };

        let offset = self.offset;
        let remaining = op.len() - offset;
        let take = max.min(remaining);
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }

        match &op.kind {
            OpKind::Insert(text) => Op {
                kind: OpKind::Insert(text.chars().skip(offset).take(take).collect()),
                attributes: op.attributes.clone(),
            },
            OpKind::Retain(_) => Op {
                kind: OpKind::Retain(take),
                attributes: op.attributes.clone(),
            },
            OpKind::Delete(_) => Op::delete(take),
        }
    }
}

/// Delta decoding and application errors.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("Malformed delta: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Snapshot contains retain or delete operations")]
    NotADocument,
    #[error("Edit reaches past the end of a {length}-character document")]
    OutOfBounds { length: usize },
}

/// A remote participant's cursor as drawn on the editor surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoration {
    pub name: String,
    pub color: String,
    pub range: Option<CursorRange>,
}

/// In-memory cursor overlay.
#[derive(Debug, Default)]
pub struct CursorOverlay {
    decorations: HashMap<ParticipantId, Decoration>,
}

impl CursorOverlay {
    pub fn get(&self, id: &ParticipantId) -> Option<&Decoration> {
        self.decorations.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.decorations.keys()
    }
}

impl CursorDecorations for CursorOverlay {
    fn create_cursor(&mut self, id: ParticipantId, name: &str, color: &str) {
        self.decorations.entry(id).or_insert_with(|| Decoration {
            name: name.to_string(),
            color: color.to_string(),
            range: None,
        });
    }

    fn move_cursor(&mut self, id: ParticipantId, range: Option<CursorRange>) {
        if let Some(decoration) = self.decorations.get_mut(&id) {
            decoration.range = range;
        }
    }

    fn remove_cursor(&mut self, id: ParticipantId) {
        self.decorations.remove(&id);
    }

    fn cursor_count(&self) -> usize {
        self.decorations.len()
    }
}

/// Headless rich-text editor over a [`TextDelta`] document.
#[derive(Debug, Default)]
pub struct RichTextEngine {
    document: TextDelta,
    enabled: bool,
    selection: Option<CursorRange>,
    changes: Vec<EditorChange>,
    cursors: CursorOverlay,
}

impl RichTextEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> &TextDelta {
        &self.document
    }

    pub fn text(&self) -> String {
        self.document.plain_text()
    }

    pub fn overlay(&self) -> &CursorOverlay {
        &self.cursors
    }

    fn replace_document(&mut self, document: TextDelta, source: ChangeSource) -> Result<(), EngineError> {
        let change = TextDelta::new()
            .delete(self.document.length())
            .compose(&document);
        self.document = document;
        self.changes.push(EditorChange::Text {
            delta: change.to_wire()?,
            source,
        });
        self.clamp_selection(source);
        Ok(())
    }

    fn clamp_selection(&mut self, source: ChangeSource) {
        let Some(range) = self.selection else {
            return;
        };
        let len = self.document.length();
        let index = range.index.min(len);
        let clamped = CursorRange::new(index, range.length.min(len - index));
        if clamped != range {
            self.set_selection(Some(clamped), source);
        }
    }

    fn shift_selection(&mut self, edit: &TextDelta, source: ChangeSource) {
        let Some(range) = self.selection else {
            return;
        };
        let start = edit.transform_position(range.index);
        let end = edit.transform_position(range.index + range.length);
        let shifted = CursorRange::new(start, end.saturating_sub(start));
        if shifted != range {
            self.set_selection(Some(shifted), source);
        }
    }
}

impl EditorEngine for RichTextEngine {
    type Cursors = CursorOverlay;

    fn set_contents(&mut self, content: &DocumentContent, source: ChangeSource) -> Result<(), EngineError> {
        if source == ChangeSource::User && !self.enabled {
            return Err(EngineError::Disabled);
        }
        let document = TextDelta::from_content(content)?;
        self.replace_document(document, source)
    }

    fn update_contents(&mut self, delta: &Delta, source: ChangeSource) -> Result<(), EngineError> {
        if source == ChangeSource::User && !self.enabled {
            return Err(EngineError::Disabled);
        }
        let edit = TextDelta::from_wire(delta)?;
        self.document = self.document.apply(&edit)?;
        self.changes.push(EditorChange::Text {
            delta: delta.clone(),
            source,
        });
        if source == ChangeSource::Api {
            self.shift_selection(&edit, source);
        }
        Ok(())
    }

    fn contents(&self) -> Result<DocumentContent, EngineError> {
        Ok(self.document.to_content()?)
    }

    fn set_text(&mut self, text: &str, source: ChangeSource) -> Result<(), EngineError> {
        self.replace_document(TextDelta::new().insert(text), source)
    }

    fn set_selection(&mut self, range: Option<CursorRange>, source: ChangeSource) {
        self.selection = range;
        self.changes.push(EditorChange::Selection { range, source });
    }

    fn selection(&self) -> Option<CursorRange> {
        self.selection
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn take_changes(&mut self) -> Vec<EditorChange> {
        std::mem::take(&mut self.changes)
    }

    fn cursors(&mut self) -> &mut CursorOverlay {
        &mut self.cursors
    }
}
