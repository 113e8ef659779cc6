// Last-writer-wins reduction of a change sequence.

use std::collections::HashMap;

use crate::types::{ChangeKind, ChangeRecord};

/// Reduce `records` to the net effect per identity key.
///
/// Records are partitioned by [`ChangeKind`] and emitted in
/// [`ChangeKind::ORDERED`] order, so identity changes replay before the
/// content that depends on them. Within a category only the last record
/// for each key survives, verbatim: an add followed by a remove of the same
/// key leaves the remove, never an empty slot. Identity changes share one
/// slot. Records without a key are kept as-is.
///
/// Survivors keep their relative commit order, which makes the function
/// idempotent.
pub fn coalesce(records: &[ChangeRecord]) -> Vec<ChangeRecord> {
    let mut last_for_slot: HashMap<(ChangeKind, Option<&str>), usize> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        if let Some(slot) = slot_of(record) {
            last_for_slot.insert(slot, index);
        }
    }

    let mut output = Vec::with_capacity(last_for_slot.len());
    for kind in ChangeKind::ORDERED {
        for (index, record) in records.iter().enumerate() {
            if record.kind != kind {
                continue;
            }
            let survives = match slot_of(record) {
                Some(slot) => last_for_slot.get(&slot) == Some(&index),
                None => true,
            };
            if survives {
                output.push(record.clone());
            }
        }
    }
    output
}

fn slot_of(record: &ChangeRecord) -> Option<(ChangeKind, Option<&str>)> {
    match record.kind {
        ChangeKind::Identity => Some((ChangeKind::Identity, None)),
        kind => record.key.as_deref().map(|key| (kind, Some(key))),
    }
}
