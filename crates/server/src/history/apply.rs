use chronicle_common::types::{ChangeKind, ChangeOp, ChangeRecord};
use serde_json::{Map, Value};

use super::{ApplyError, DocumentApplier};

/// Applier for documents stored as a flat JSON object.
///
/// Each record owns the member `<Kind>:<key>`; identity changes own `@id`.
/// `Add` and `Set` write the payload, `Remove` deletes the member. A null
/// base is the empty document.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedApplier;

impl KeyedApplier {
    fn member(record: &ChangeRecord) -> String {
        match record.kind {
            ChangeKind::Identity => "@id".to_string(),
            kind => format!("{kind:?}:{}", record.key.as_deref().unwrap_or_default()),
        }
    }
}

impl DocumentApplier for KeyedApplier {
    fn apply(&self, base: &Value, changes: &[ChangeRecord]) -> Result<Value, ApplyError> {
        let mut doc = match base {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => return Err(ApplyError(format!("base is not an object: {other}"))),
        };
        for record in changes {
            let member = Self::member(record);
            match record.op {
                ChangeOp::Add | ChangeOp::Set => {
                    doc.insert(member, record.payload.clone());
                }
                ChangeOp::Remove => {
                    doc.remove(&member);
                }
            }
        }
        Ok(Value::Object(doc))
    }
}
