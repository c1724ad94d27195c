//! The unit of change exchanged between participants.
//!
//! An [`Operation`] is an immutable value. Transforming it produces a new
//! value; the original is never edited in place.
//!
//! Three kinds exist:
//!
//! | Kind          | Removes                     | Inserts   |
//! |---------------|-----------------------------|-----------|
//! | `Insert`      | `length` chars at `position`| `payload` |
//! | `Delete`      | `length` chars at `position`| nothing   |
//! | `FormatRange` | nothing                     | nothing (adds mark `payload`) |
//!
//! An `Insert` with a non-zero `length` is a replacement. Positions and
//! lengths count `char`s, not bytes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Identity of a participant, verified before it reaches the core.
pub type ParticipantId = Uuid;

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Delete,
    FormatRange,
}

/// A single edit against a specific document version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Sequence number, increasing per document
    pub id: u64,
    /// Submitting participant
    pub author: ParticipantId,
    /// Document version the author saw when creating the operation
    pub base_version: u64,
    pub kind: OpKind,
    pub position: usize,
    pub length: usize,
    /// Inserted text, or the mark name for `FormatRange`
    pub payload: String,
    /// Marks carried by inserted characters
    pub attributes: BTreeSet<String>,
}

impl Operation {
    fn new(
        id: u64,
        author: ParticipantId,
        base_version: u64,
        kind: OpKind,
        position: usize,
        length: usize,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id,
            author,
            base_version,
            kind,
            position,
            length,
            payload: payload.into(),
            attributes: BTreeSet::new(),
        }
    }

    /// Insert `text` at `position`.
    pub fn insert(
        id: u64,
        author: ParticipantId,
        base_version: u64,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(id, author, base_version, OpKind::Insert, position, 0, text)
    }

    /// Replace `length` chars at `position` with `text`.
    pub fn replace(
        id: u64,
        author: ParticipantId,
        base_version: u64,
        position: usize,
        length: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(id, author, base_version, OpKind::Insert, position, length, text)
    }

    /// Delete `length` chars at `position`.
    pub fn delete(
        id: u64,
        author: ParticipantId,
        base_version: u64,
        position: usize,
        length: usize,
    ) -> Self {
        Self::new(id, author, base_version, OpKind::Delete, position, length, "")
    }

    /// Add `mark` to every char in `position..position + length`.
    pub fn format(
        id: u64,
        author: ParticipantId,
        base_version: u64,
        position: usize,
        length: usize,
        mark: impl Into<String>,
    ) -> Self {
        Self::new(id, author, base_version, OpKind::FormatRange, position, length, mark)
    }

    /// Attach marks to the inserted text.
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Tie-break priority. Higher wins a conflict.
    pub fn priority(&self) -> (u64, ParticipantId) {
        (self.id, self.author)
    }

    /// Whether the operation changes the text (insert or delete).
    pub fn is_splice(&self) -> bool {
        matches!(self.kind, OpKind::Insert | OpKind::Delete)
    }

    /// Number of chars this operation removes.
    pub fn removed_len(&self) -> usize {
        match self.kind {
            OpKind::Insert | OpKind::Delete => self.length,
            OpKind::FormatRange => 0,
        }
    }

    /// Number of chars this operation inserts.
    pub fn inserted_len(&self) -> usize {
        match self.kind {
            OpKind::Insert => self.payload.chars().count(),
            OpKind::Delete | OpKind::FormatRange => 0,
        }
    }

    /// Exclusive end of the affected range, `None` on overflow.
    pub fn end(&self) -> Option<usize> {
        self.position.checked_add(self.length)
    }

    /// Whether applying the operation leaves the document unchanged.
    pub fn is_noop(&self) -> bool {
        match self.kind {
            OpKind::Insert => self.length == 0 && self.payload.is_empty(),
            OpKind::Delete | OpKind::FormatRange => self.length == 0,
        }
    }

    /// Change in document length once applied.
    pub fn len_delta(&self) -> isize {
        self.inserted_len() as isize - self.removed_len() as isize
    }

    /// Check the operation against a document of `document_len` chars.
    pub fn validate(&self, document_len: usize) -> Result<(), ValidationError> {
        let end = self.end().ok_or(ValidationError::Overflow {
            position: self.position,
            length: self.length,
        })?;
        if end > document_len {
            return Err(ValidationError::OutOfBounds {
                position: self.position,
                end,
                len: document_len,
            });
        }
        match self.kind {
            OpKind::Delete if !self.payload.is_empty() => Err(ValidationError::DeleteWithPayload),
            OpKind::FormatRange if self.payload.is_empty() => Err(ValidationError::MissingMark),
            _ => Ok(()),
        }
    }
}
