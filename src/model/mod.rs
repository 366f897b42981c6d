pub mod document_key;
pub mod timestamp;

pub use document_key::DocumentKey;
pub use timestamp::{SnapshotVersion, Timestamp};

use serde_json::{Map, Value as JsonValue};

/// Server-assigned identity of one listen target.
pub type TargetId = i32;

/// Locally-assigned identity of one mutation batch.
pub type BatchId = i32;

/// Document snapshot as carried on the watch and lookup surfaces.
///
/// The remote layer treats field contents as opaque JSON; interpreting them is
/// the query engine's business.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub key: DocumentKey,
    pub fields: Map<String, JsonValue>,
    pub update_time: Option<Timestamp>,
}

impl Document {
    pub fn new(key: DocumentKey, fields: Map<String, JsonValue>) -> Self {
        Self {
            key,
            fields,
            update_time: None,
        }
    }

    pub fn with_update_time(mut self, update_time: Timestamp) -> Self {
        self.update_time = Some(update_time);
        self
    }
}
