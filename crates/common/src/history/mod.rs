// Change history: a start revision plus the ordered change-sets committed after it.

pub mod checksum;
pub mod coalesce;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChangeMetadata, ChangeRecord, ChangeSet, DocumentRevision, RevisionEntry, RevisionOverflow};

pub use coalesce::coalesce;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeHistoryError {
    #[error("revision {actual} does not follow head {head}")]
    OutOfSequence { head: DocumentRevision, actual: DocumentRevision },

    #[error(transparent)]
    Overflow(#[from] RevisionOverflow),

    #[error("range ({start}, {end}] is outside history ({history_start}, {history_head}]")]
    OutOfRange {
        start: DocumentRevision,
        end: DocumentRevision,
        history_start: DocumentRevision,
        history_head: DocumentRevision,
    },
}

/// History of a project between `start` (exclusive) and `head()` (inclusive).
///
/// Entries are contiguous: `entries[i].revision == start + i + 1`. The
/// only way to grow a history is [`ChangeHistory::push_entry`], which
/// rejects anything that would break this.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawChangeHistory")]
pub struct ChangeHistory {
    start: DocumentRevision,
    entries: Vec<RevisionEntry>,
}

#[derive(Deserialize)]
struct RawChangeHistory {
    start: DocumentRevision,
    entries: Vec<RevisionEntry>,
}

impl TryFrom<RawChangeHistory> for ChangeHistory {
    type Error = ChangeHistoryError;

    fn try_from(raw: RawChangeHistory) -> Result<Self, Self::Error> {
        let mut history = Self::starting_at(raw.start);
        for entry in raw.entries {
            history.push_entry(entry)?;
        }
        Ok(history)
    }
}

impl ChangeHistory {
    pub fn empty() -> Self {
        Self::starting_at(DocumentRevision::START)
    }

    pub fn starting_at(start: DocumentRevision) -> Self {
        Self { start, entries: Vec::new() }
    }

    pub fn start(&self) -> DocumentRevision {
        self.start
    }

    pub fn head(&self) -> DocumentRevision {
        self.entries.last().map_or(self.start, |entry| entry.revision)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[RevisionEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<RevisionEntry> {
        self.entries
    }

    /// Append the change-set that produced `revision`, which must be `head().next()`.
    pub fn add_revision_bundle(
        &mut self,
        revision: DocumentRevision,
        metadata: ChangeMetadata,
        changes: ChangeSet,
    ) -> Result<(), ChangeHistoryError> {
        self.push_entry(RevisionEntry { revision, metadata, changes })
    }

    pub fn push_entry(&mut self, entry: RevisionEntry) -> Result<(), ChangeHistoryError> {
        let head = self.head();
        if entry.revision != head.next()? {
            return Err(ChangeHistoryError::OutOfSequence { head, actual: entry.revision });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entry(&self, revision: DocumentRevision) -> Option<&RevisionEntry> {
        if revision <= self.start {
            return None;
        }
        let index = revision.distance_from(self.start) - 1;
        self.entries.get(index as usize)
    }

    pub fn metadata_for(&self, revision: DocumentRevision) -> Option<&ChangeMetadata> {
        self.entry(revision).map(|entry| &entry.metadata)
    }

    /// Entries with revision in `(start_exclusive, end_inclusive]`.
    pub fn slice(
        &self,
        start_exclusive: DocumentRevision,
        end_inclusive: DocumentRevision,
    ) -> Result<ChangeHistory, ChangeHistoryError> {
        if start_exclusive < self.start
            || end_inclusive > self.head()
            || start_exclusive > end_inclusive
        {
            return Err(ChangeHistoryError::OutOfRange {
                start: start_exclusive,
                end: end_inclusive,
                history_start: self.start,
                history_head: self.head(),
            });
        }

        let from = start_exclusive.distance_from(self.start) as usize;
        let to = end_inclusive.distance_from(self.start) as usize;
        Ok(Self { start: start_exclusive, entries: self.entries[from..to].to_vec() })
    }

    /// Extend this history with `later`, which must start at this history's head.
    pub fn concat(mut self, later: ChangeHistory) -> Result<ChangeHistory, ChangeHistoryError> {
        for entry in later.entries {
            self.push_entry(entry)?;
        }
        Ok(self)
    }

    /// Every record in commit order.
    pub fn changes_flattened(&self) -> Vec<ChangeRecord> {
        self.entries.iter().flat_map(|entry| entry.changes.iter().cloned()).collect()
    }

    /// Net effect of the whole history, ready to replay onto the base document.
    pub fn normalized_changes(&self) -> Vec<ChangeRecord> {
        coalesce(&self.changes_flattened())
    }
}

impl fmt::Display for ChangeHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} --> {}: ", self.start, self.head())?;
        for entry in &self.entries {
            write!(f, "[{} change(s) by {}]", entry.changes.len(), entry.metadata.author)?;
        }
        f.write_str("}")
    }
}
