use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use crate::error::{internal_error, SyncResult};
use crate::model::{BatchId, DocumentKey, SnapshotVersion, Timestamp};

/// Server-checked condition a mutation is applied under.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(Timestamp),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }
}

/// Single write operation against one document.
///
/// `Verify` carries no payload; transactions use it to assert that a document
/// read during the transaction was not modified concurrently.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: Map<String, JsonValue>,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        value: Map<String, JsonValue>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: Map<String, JsonValue>) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    pub fn patch(key: DocumentKey, value: Map<String, JsonValue>) -> Self {
        Mutation::Patch {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn with_precondition(mut self, new: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new,
        }
        self
    }
}

/// Ordered set of mutations queued as one unit by the local store.
#[derive(Clone, Debug)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn document_keys(&self) -> Vec<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }
}

/// Outcome of one mutation as reported by the backend.
#[derive(Clone, Debug, Default)]
pub struct MutationResult {
    pub update_time: Option<Timestamp>,
}

/// Acknowledgement of a committed mutation batch.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Post-commit version per mutated document, for latency compensation.
    pub doc_versions: BTreeMap<DocumentKey, Option<Timestamp>>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> SyncResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "mutation batch {} expected {} results but received {}",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let mut doc_versions = BTreeMap::new();
        for (mutation, result) in batch.mutations.iter().zip(mutation_results.iter()) {
            let version = result
                .update_time
                .or_else(|| (!commit_version.is_none()).then(|| commit_version.timestamp()));
            doc_versions.insert(mutation.key().clone(), version);
        }

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch.batch_id
    }
}
