use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::error::{invalid_argument, not_found, SyncResult};
use crate::model::{DocumentKey, SnapshotVersion};
use crate::remote::datastore::Datastore;
use crate::remote::mutation::{Mutation, Precondition};
use crate::remote::serializer::DocumentLookup;

/// One-shot read-then-write unit against the backend.
///
/// Reads record the version each document was seen at; writes carry a
/// precondition on that version so the commit fails if anything moved
/// underneath the transaction. `commit` consumes the transaction, making it
/// single-use by construction.
pub struct Transaction {
    datastore: Arc<Datastore>,
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    written: BTreeSet<DocumentKey>,
    mutations: Vec<Mutation>,
}

impl Transaction {
    pub(crate) fn new(datastore: Arc<Datastore>) -> Self {
        Self {
            datastore,
            read_versions: BTreeMap::new(),
            written: BTreeSet::new(),
            mutations: Vec::new(),
        }
    }

    /// Reads documents inside the transaction. All reads must precede all
    /// writes.
    pub async fn lookup(&mut self, keys: &[DocumentKey]) -> SyncResult<Vec<DocumentLookup>> {
        if !self.mutations.is_empty() {
            return Err(invalid_argument(
                "transactions require all reads before all writes",
            ));
        }
        let lookups = self.datastore.lookup_documents(keys).await?;
        for lookup in &lookups {
            self.record_version(lookup)?;
        }
        Ok(lookups)
    }

    pub fn set(&mut self, key: DocumentKey, value: Map<String, JsonValue>) {
        let precondition = self.precondition_for(&key);
        self.write(Mutation::set(key, value).with_precondition(precondition));
    }

    /// Patches an existing document; fails at commit (or here, if the read
    /// already proved the document missing).
    pub fn update(
        &mut self,
        key: DocumentKey,
        value: Map<String, JsonValue>,
    ) -> SyncResult<()> {
        let precondition = self.update_precondition_for(&key)?;
        self.write(Mutation::patch(key, value).with_precondition(precondition));
        Ok(())
    }

    pub fn delete(&mut self, key: DocumentKey) {
        let precondition = self.precondition_for(&key);
        self.write(Mutation::delete(key).with_precondition(precondition));
    }

    /// Commits all buffered writes in one unary call. Documents that were
    /// read but not written are verified unchanged as part of the commit.
    pub async fn commit(mut self) -> SyncResult<SnapshotVersion> {
        let mut unwritten: Vec<(DocumentKey, SnapshotVersion)> = self
            .read_versions
            .iter()
            .filter(|(key, _)| !self.written.contains(*key))
            .map(|(key, version)| (key.clone(), *version))
            .collect();
        for (key, version) in unwritten.drain(..) {
            let precondition = version_precondition(version);
            self.mutations.push(Mutation::verify(key, precondition));
        }

        let (commit_version, _results) =
            self.datastore.commit_mutations(&self.mutations).await?;
        Ok(commit_version)
    }

    fn write(&mut self, mutation: Mutation) {
        self.written.insert(mutation.key().clone());
        self.mutations.push(mutation);
    }

    fn record_version(&mut self, lookup: &DocumentLookup) -> SyncResult<()> {
        if let Some(previous) = self.read_versions.get(&lookup.key) {
            if *previous != lookup.read_version {
                return Err(invalid_argument(format!(
                    "document {} changed between reads in the same transaction",
                    lookup.key
                )));
            }
            return Ok(());
        }
        self.read_versions
            .insert(lookup.key.clone(), lookup.read_version);
        Ok(())
    }

    /// Precondition for a blind or read-backed write: pin the read version,
    /// or require absence when the read proved the document missing.
    fn precondition_for(&self, key: &DocumentKey) -> Precondition {
        match self.read_versions.get(key) {
            Some(version) if version.is_none() => Precondition::Exists(false),
            Some(version) => Precondition::UpdateTime(version.timestamp()),
            None => Precondition::None,
        }
    }

    fn update_precondition_for(&self, key: &DocumentKey) -> SyncResult<Precondition> {
        match self.read_versions.get(key) {
            Some(version) if version.is_none() => Err(not_found(format!(
                "cannot update document {key}; it does not exist"
            ))),
            Some(version) => Ok(Precondition::UpdateTime(version.timestamp())),
            None => Ok(Precondition::Exists(true)),
        }
    }
}

fn version_precondition(version: SnapshotVersion) -> Precondition {
    if version.is_none() {
        Precondition::Exists(false)
    } else {
        Precondition::UpdateTime(version.timestamp())
    }
}
