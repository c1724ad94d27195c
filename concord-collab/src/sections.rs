//! Exclusive section locks within one document.
//!
//! A participant may lock a named section covering a range of chars.
//! While it is held, operations from anyone else that touch the range are
//! refused. Ranges move with every committed operation, the same way a
//! format range does, so a lock keeps covering the text it was taken on.
//!
//! The map is owned by the session and only touched while the session
//! holds its replica lock, so ranges always refer to the current version.

use std::collections::HashMap;

use concord_core::{transform_pair, Operation, ParticipantId};
use serde::{Deserialize, Serialize};

use crate::error::CollabError;

/// One held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionLock {
    pub section_id: String,
    pub holder: ParticipantId,
    pub start: usize,
    pub end: usize,
}

impl SectionLock {
    /// Whether `op` edits or formats text inside the locked range.
    /// Touching either edge from outside is allowed.
    pub fn covers(&self, op: &Operation) -> bool {
        if op.is_noop() {
            return false;
        }
        let Some(end) = op.end() else {
            return true;
        };
        if op.position == end {
            return self.start < op.position && op.position < self.end;
        }
        op.position < self.end && self.start < end
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        if start == end || self.start == self.end {
            return false;
        }
        start < self.end && self.start < end
    }

    /// The range as a format operation, so it can be carried across
    /// committed edits.
    fn as_range(&self) -> Operation {
        Operation::format(0, self.holder, 0, self.start, self.end - self.start, self.section_id.clone())
    }
}

/// Locks of one document, keyed by section id.
#[derive(Debug, Default)]
pub struct SectionLocks {
    locks: HashMap<String, SectionLock>,
}

impl SectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn get(&self, section_id: &str) -> Option<&SectionLock> {
        self.locks.get(section_id)
    }

    /// Every held lock, ordered by section id.
    pub fn all(&self) -> Vec<SectionLock> {
        let mut locks: Vec<_> = self.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.section_id.cmp(&b.section_id));
        locks
    }

    /// Take `section_id` over `start..end` of a document of `document_len`
    /// chars.
    ///
    /// Refused if the section is already held, even by the caller, or if
    /// the range overlaps a section someone else holds.
    pub fn acquire(
        &mut self,
        section_id: String,
        holder: ParticipantId,
        start: usize,
        end: usize,
        document_len: usize,
    ) -> Result<SectionLock, CollabError> {
        if end < start {
            return Err(CollabError::InvalidSelection { start, end });
        }
        let lock = SectionLock {
            section_id,
            holder,
            start,
            end,
        };
        lock.as_range().validate(document_len)?;

        if let Some(held) = self.locks.get(&lock.section_id) {
            return Err(CollabError::SectionLocked {
                section_id: held.section_id.clone(),
                holder: held.holder,
            });
        }
        if let Some(held) = self
            .locks
            .values()
            .find(|held| held.holder != holder && held.overlaps(start, end))
        {
            return Err(CollabError::SectionLocked {
                section_id: held.section_id.clone(),
                holder: held.holder,
            });
        }
        self.locks.insert(lock.section_id.clone(), lock.clone());
        Ok(lock)
    }

    /// Release `section_id`. Only its holder may do so.
    pub fn release(&mut self, section_id: &str, holder: ParticipantId) -> Result<SectionLock, CollabError> {
        let not_holder = || CollabError::NotLockHolder {
            section_id: section_id.to_string(),
            participant_id: holder,
        };
        if self.locks.get(section_id).map(|held| held.holder) != Some(holder) {
            return Err(not_holder());
        }
        self.locks.remove(section_id).ok_or_else(not_holder)
    }

    /// Drop every lock `holder` owns.
    pub fn release_held_by(&mut self, holder: &ParticipantId) -> Vec<SectionLock> {
        let ids: Vec<String> = self
            .locks
            .values()
            .filter(|lock| &lock.holder == holder)
            .map(|lock| lock.section_id.clone())
            .collect();
        let mut released: Vec<_> = ids.iter().filter_map(|id| self.locks.remove(id)).collect();
        released.sort_by(|a, b| a.section_id.cmp(&b.section_id));
        released
    }

    /// Drop every lock.
    pub fn clear(&mut self) -> Vec<SectionLock> {
        let mut released: Vec<_> = self.locks.drain().map(|(_, lock)| lock).collect();
        released.sort_by(|a, b| a.section_id.cmp(&b.section_id));
        released
    }

    /// The lock held by someone other than `op.author` that refuses `op`.
    pub fn blocking(&self, op: &Operation) -> Option<&SectionLock> {
        self.locks
            .values()
            .find(|lock| lock.holder != op.author && lock.covers(op))
    }

    /// Move every range across a committed operation.
    pub fn follow(&mut self, committed: &Operation) {
        for lock in self.locks.values_mut() {
            match transform_pair(&lock.as_range(), committed) {
                Ok(moved) => {
                    lock.start = moved.position;
                    lock.end = moved.position + moved.length;
                }
                Err(e) => log::warn!("Section {} kept its range: {e}", lock.section_id),
            }
        }
    }
}
