use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::model::{SnapshotVersion, TargetId};
use crate::remote::query_data::{QueryData, QueryPurpose};

/// Source of truth for which targets the client currently wants.
///
/// Shared between the remote store and the watch-change aggregator's metadata
/// provider; all access happens on the worker, so a plain mutex suffices.
pub struct ListenTargetRegistry {
    targets: Mutex<BTreeMap<TargetId, QueryData>>,
}

impl ListenTargetRegistry {
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, target: QueryData) {
        let mut targets = self.targets.lock().unwrap();
        let target_id = target.target_id();
        assert!(
            !targets.contains_key(&target_id),
            "listen called twice for target {target_id}"
        );
        targets.insert(target_id, target);
    }

    pub fn remove(&self, target_id: TargetId) -> QueryData {
        let mut targets = self.targets.lock().unwrap();
        targets
            .remove(&target_id)
            .unwrap_or_else(|| panic!("unlisten called for unknown target {target_id}"))
    }

    pub fn contains(&self, target_id: TargetId) -> bool {
        self.targets.lock().unwrap().contains_key(&target_id)
    }

    pub fn get(&self, target_id: TargetId) -> Option<QueryData> {
        self.targets.lock().unwrap().get(&target_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.lock().unwrap().len()
    }

    /// Entries in ascending target-id order; the order listens are re-sent in
    /// on stream re-open.
    pub fn snapshot(&self) -> Vec<QueryData> {
        self.targets.lock().unwrap().values().cloned().collect()
    }

    /// Folds a server-issued resume token into the entry, if it still exists.
    /// Empty tokens never overwrite an existing bookmark.
    pub fn update_from_remote_event(
        &self,
        target_id: TargetId,
        version: SnapshotVersion,
        resume_token: &[u8],
    ) {
        if resume_token.is_empty() {
            return;
        }
        let mut targets = self.targets.lock().unwrap();
        if let Some(entry) = targets.get_mut(&target_id) {
            *entry = entry.with_resume_token(resume_token.to_vec(), version);
        }
    }

    /// Drops the entry's resume token after an existence-filter mismatch. The
    /// stored purpose stays `Listen`; only the transient re-watch request is
    /// marked otherwise. Returns the updated entry, or `None` when the target
    /// was unlistened in the meantime.
    pub fn clear_resume_token(&self, target_id: TargetId) -> Option<QueryData> {
        let mut targets = self.targets.lock().unwrap();
        let entry = targets.get_mut(&target_id)?;
        debug_assert!(entry.purpose() == QueryPurpose::Listen);
        *entry = entry.with_resume_token(Vec::new(), entry.snapshot_version());
        Some(entry.clone())
    }
}

impl Default for ListenTargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
