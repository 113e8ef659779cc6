// Snapshot and state checksums.
//
// snapshot checksum: digest of the baseline installed by the last squash.
// state checksum:    hash chain seeded with the snapshot checksum and
//                    extended by every committed revision entry.

use sha2::{Digest, Sha256};

use super::ChangeHistory;
use crate::types::{Checksum, RevisionEntry, Snapshot};

const SNAPSHOT_DOMAIN: &[u8] = b"chronicle.snapshot.v1";
const STATE_DOMAIN: &[u8] = b"chronicle.state.v1";

pub fn snapshot_checksum(snapshot: &Snapshot) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(SNAPSHOT_DOMAIN);
    hasher.update(snapshot.revision.get().to_le_bytes());
    hasher.update(canonical_json(&snapshot.document));
    Checksum::from_hex(hex_encode(&hasher.finalize()))
}

/// State checksum after appending `entry` to a history whose state was `previous`.
pub fn advance_state_checksum(previous: &Checksum, entry: &RevisionEntry) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(STATE_DOMAIN);
    hasher.update(previous.as_str().as_bytes());
    hasher.update(entry.revision.get().to_le_bytes());
    hasher.update(canonical_json(entry));
    Checksum::from_hex(hex_encode(&hasher.finalize()))
}

/// State checksum at the head of `history`, given the checksum at its start.
///
/// For a full history the seed is the snapshot checksum; clients use this
/// to recompute a commit baseline after re-fetching changes.
pub fn state_checksum(seed: &Checksum, history: &ChangeHistory) -> Checksum {
    history
        .entries()
        .iter()
        .fold(seed.clone(), |state, entry| advance_state_checksum(&state, entry))
}

fn canonical_json<T: serde::Serialize>(value: &T) -> Vec<u8> {
    // Struct fields serialize in declaration order and JSON objects are
    // sorted maps, so the encoding is stable for equal values.
    serde_json::to_vec(value).unwrap_or_default()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::types::{
        ChangeKind, ChangeMetadata, ChangeOp, ChangeRecord, DocumentRevision, UserId,
    };

    fn entry(revision: u64, key: &str) -> RevisionEntry {
        RevisionEntry {
            revision: DocumentRevision::new(revision),
            metadata: ChangeMetadata {
                author: UserId::new("alice").expect("valid user"),
                comment: "edit".into(),
                timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("valid time"),
            },
            changes: vec![ChangeRecord::new(ChangeKind::Content, ChangeOp::Add, key)],
        }
    }

    #[test]
    fn snapshot_checksum_is_deterministic_hex() {
        let snapshot = Snapshot { revision: DocumentRevision::new(4), document: json!({"b": 1, "a": 2}) };
        let first = snapshot_checksum(&snapshot);
        let second = snapshot_checksum(&snapshot.clone());
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn snapshot_checksum_covers_revision_and_document() {
        let base = Snapshot::empty();
        let moved = Snapshot { revision: DocumentRevision::new(1), ..Snapshot::empty() };
        let edited = Snapshot { document: json!({"x": 1}), ..Snapshot::empty() };
        assert_ne!(snapshot_checksum(&base), snapshot_checksum(&moved));
        assert_ne!(snapshot_checksum(&base), snapshot_checksum(&edited));
    }

    #[test]
    fn state_checksum_changes_with_every_entry() {
        let seed = snapshot_checksum(&Snapshot::empty());
        let one = advance_state_checksum(&seed, &entry(1, "x"));
        let two = advance_state_checksum(&one, &entry(2, "x"));
        assert_ne!(seed, one);
        assert_ne!(one, two);
    }

    #[test]
    fn identical_changes_at_different_revisions_hash_differently() {
        let seed = snapshot_checksum(&Snapshot::empty());
        assert_ne!(
            advance_state_checksum(&seed, &entry(1, "x")),
            advance_state_checksum(&seed, &entry(2, "x"))
        );
    }

    #[test]
    fn state_checksum_folds_history() {
        let seed = snapshot_checksum(&Snapshot::empty());
        let mut history = ChangeHistory::empty();
        history.push_entry(entry(1, "a")).expect("append");
        history.push_entry(entry(2, "b")).expect("append");

        let expected =
            advance_state_checksum(&advance_state_checksum(&seed, &entry(1, "a")), &entry(2, "b"));
        assert_eq!(state_checksum(&seed, &history), expected);
        assert_eq!(state_checksum(&seed, &ChangeHistory::empty()), seed);
    }
}
