use crate::error::SyncError;
use crate::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// One frame received on the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    ExistenceFilter(ExistenceFilter),
}

impl WatchChange {
    /// Consistency point stamped on the frame, or `NONE` when the server did
    /// not attach one. Only target changes carry read times.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change) => {
                change.read_time.unwrap_or(SnapshotVersion::NONE)
            }
            _ => SnapshotVersion::NONE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Affected targets; empty means "all active targets".
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    /// Server-reported reason for a `Removed` transition; `None` is OK.
    pub cause: Option<SyncError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// Document entering, changing within, or leaving targets.
///
/// A missing `document` means the document was deleted; the key still rides on
/// the change.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: Option<Document>,
}

/// Compact server-side summary of a target's membership.
#[derive(Debug, Clone)]
pub struct ExistenceFilter {
    pub target_id: TargetId,
    pub count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    #[test]
    fn snapshot_version_only_on_target_changes() {
        let version = SnapshotVersion::new(Timestamp::new(7, 0));
        let change = WatchChange::TargetChange(WatchTargetChange {
            state: TargetChangeState::NoChange,
            target_ids: vec![2],
            resume_token: Vec::new(),
            read_time: Some(version),
            cause: None,
        });
        assert_eq!(change.snapshot_version(), version);

        let filter = WatchChange::ExistenceFilter(ExistenceFilter {
            target_id: 2,
            count: 1,
        });
        assert!(filter.snapshot_version().is_none());
    }
}
