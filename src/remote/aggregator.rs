use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::remote::query_data::QueryData;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentChange, ExistenceFilter, TargetChangeState, WatchTargetChange,
};

/// Lookup-only handle back into the coordinator, used to reason about targets
/// and their known document membership.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the sync engine currently believes are in the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Registry entry for the target, if the client still wants it.
    fn query_data_for_target(&self, target_id: TargetId) -> Option<QueryData>;
}

/// Folds watch-stream frames into a consistent [`RemoteEvent`] per snapshot.
///
/// A fresh aggregator is allocated every time the watch stream starts; frames
/// from a previous stream incarnation can therefore never leak into the next.
pub struct WatchChangeAggregator {
    metadata: Arc<dyn TargetMetadataProvider>,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Option<Document>>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    pub fn new(metadata: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            metadata,
            target_states: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_target_resets: BTreeSet::new(),
        }
    }

    /// Marks an in-flight listen or unlisten so stale target signals arriving
    /// before the server's ack are ignored.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).outstanding_responses += 1;
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        debug_assert!(
            change.cause.is_none(),
            "target errors must be routed around the aggregator"
        );

        for target_id in self.affected_targets(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    // Ack of our listen request; anything accumulated before
                    // it belongs to a previous incarnation of the target.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_accumulated_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    // Ack of our unlisten request; error-bearing removals are
                    // intercepted by the remote store before aggregation.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    pub fn handle_document_change(&mut self, change: &DocumentChange) {
        if change.document.is_some() {
            for &target_id in &change.updated_target_ids {
                if self.is_active_target(target_id) {
                    self.add_document_to_target(target_id, change.key.clone());
                }
            }
        }
        for &target_id in &change.removed_target_ids {
            if self.is_active_target(target_id) {
                self.remove_document_from_target(target_id, &change.key);
            }
        }
        self.pending_document_updates
            .insert(change.key.clone(), change.document.clone());
    }

    /// Compares the server's membership count against the client's view; on
    /// mismatch the target is reset and queued for re-listen.
    pub fn handle_existence_filter(&mut self, filter: &ExistenceFilter) {
        let target_id = filter.target_id;
        if self.query_data_for_active_target(target_id).is_none() {
            return;
        }

        let current = self.current_document_count(target_id);
        if current != filter.count as usize {
            log::debug!(
                "existence filter mismatch for target {target_id}: server reports {}, client has {current}",
                filter.count
            );
            self.reset_target(target_id);
            self.pending_target_resets.insert(target_id);
        }
    }

    /// Emits the event for the snapshot at `snapshot_version` and clears all
    /// accumulated per-snapshot state.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            if !self.is_active_target(target_id) {
                continue;
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes() {
                    target_changes.insert(target_id, state.take_target_change());
                }
            }
        }

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
        }
    }

    /// Drops aggregator state for a target the coordinator removed.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn affected_targets(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            // A change without ids applies to every target known so far.
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        self.query_data_for_active_target(target_id).is_some()
    }

    /// A target is active when the client still wants it and no listen or
    /// unlisten request for it is in flight.
    fn query_data_for_active_target(&self, target_id: TargetId) -> Option<QueryData> {
        if let Some(state) = self.target_states.get(&target_id) {
            if state.is_pending() {
                return None;
            }
        }
        self.metadata.query_data_for_target(target_id)
    }

    fn add_document_to_target(&mut self, target_id: TargetId, key: DocumentKey) {
        self.ensure_seeded_documents(target_id);
        let Some(state) = self.target_states.get_mut(&target_id) else {
            return;
        };
        let Some(documents) = state.documents.as_mut() else {
            return;
        };

        let existed = documents.contains(&key);
        documents.insert(key.clone());
        state.removed.remove(&key);
        if existed {
            state.modified.insert(key);
        } else {
            state.added.insert(key);
        }
        state.dirty = true;
    }

    fn remove_document_from_target(&mut self, target_id: TargetId, key: &DocumentKey) {
        self.ensure_seeded_documents(target_id);
        let Some(state) = self.target_states.get_mut(&target_id) else {
            return;
        };
        let Some(documents) = state.documents.as_mut() else {
            return;
        };

        if documents.remove(key) {
            state.added.remove(key);
            state.modified.remove(key);
            state.removed.insert(key.clone());
            state.dirty = true;
        }
    }

    fn current_document_count(&mut self, target_id: TargetId) -> usize {
        self.ensure_seeded_documents(target_id);
        self.target_states
            .get(&target_id)
            .and_then(|state| state.documents.as_ref())
            .map_or(0, BTreeSet::len)
    }

    /// Seeds a target's membership view from the sync engine the first time a
    /// document-level decision is needed.
    fn ensure_seeded_documents(&mut self, target_id: TargetId) {
        let needs_seed = self
            .target_states
            .get(&target_id)
            .map_or(true, |state| state.documents.is_none());
        if needs_seed {
            let keys = self.metadata.remote_keys_for_target(target_id);
            let state = self.ensure_target_state(target_id);
            if state.documents.is_none() {
                state.documents = Some(keys);
            }
        }
    }

    /// Replaces the target's state and synthesizes a removal for every
    /// document the client previously believed was in it.
    fn reset_target(&mut self, target_id: TargetId) {
        let keys = self.metadata.remote_keys_for_target(target_id);
        let mut state = TargetState::new();
        state.documents = Some(BTreeSet::new());
        state.removed = keys;
        state.dirty = true;
        self.target_states.insert(target_id, state);
    }
}

struct TargetState {
    outstanding_responses: i32,
    current: bool,
    resume_token: Vec<u8>,
    /// Keys believed to be in the target; `None` until seeded from the sync
    /// engine.
    documents: Option<BTreeSet<DocumentKey>>,
    added: BTreeSet<DocumentKey>,
    modified: BTreeSet<DocumentKey>,
    removed: BTreeSet<DocumentKey>,
    dirty: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            outstanding_responses: 0,
            current: false,
            resume_token: Vec::new(),
            documents: None,
            added: BTreeSet::new(),
            modified: BTreeSet::new(),
            removed: BTreeSet::new(),
            dirty: false,
        }
    }

    fn is_pending(&self) -> bool {
        self.outstanding_responses > 0
    }

    fn record_target_response(&mut self) {
        self.outstanding_responses = (self.outstanding_responses - 1).max(0);
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.resume_token = token.to_vec();
            self.dirty = true;
        }
    }

    fn mark_current(&mut self) {
        self.current = true;
        self.dirty = true;
    }

    fn clear_accumulated_changes(&mut self) {
        self.added.clear();
        self.modified.clear();
        self.removed.clear();
        self.dirty = false;
    }

    fn has_pending_changes(&self) -> bool {
        self.dirty
            || !self.added.is_empty()
            || !self.modified.is_empty()
            || !self.removed.is_empty()
    }

    fn take_target_change(&mut self) -> TargetChange {
        let change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents: std::mem::take(&mut self.added),
            modified_documents: std::mem::take(&mut self.modified),
            removed_documents: std::mem::take(&mut self.removed),
        };
        self.dirty = false;
        change
    }
}
