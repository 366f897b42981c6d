use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// Consistent snapshot of everything the watch stream reported up to one
/// snapshot version.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets the server says are out of sync with the client's view; the
    /// remote store re-listens to these without a resume token.
    pub target_mismatches: BTreeSet<TargetId>,
    /// `None` marks a deletion.
    pub document_updates: BTreeMap<DocumentKey, Option<Document>>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
    }
}

/// Per-target delta accumulated since the previous snapshot.
#[derive(Debug, Clone, Default)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    /// True once the server vouches the client has seen every document
    /// matching the target.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}
