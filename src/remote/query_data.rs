use crate::model::{SnapshotVersion, TargetId};

/// Why the client is listening to a target.
///
/// The purpose only shapes the wire request (it is sent as a request label so
/// the backend can distinguish recovery traffic); the registry stores
/// `Listen` entries regardless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPurpose {
    Listen,
    ExistenceFilterMismatch,
    LimboResolution,
}

impl QueryPurpose {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            QueryPurpose::Listen => None,
            QueryPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            QueryPurpose::LimboResolution => Some("limbo-document"),
        }
    }
}

/// Minimal query shape the wire protocol needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    parent: String,
    collection_id: String,
    all_descendants: bool,
}

impl Query {
    /// Query over a single collection, e.g. `rooms/a/messages`.
    pub fn collection(path: &str) -> Self {
        let (parent, collection_id) = match path.rfind('/') {
            Some(index) => (path[..index].to_string(), path[index + 1..].to_string()),
            None => (String::new(), path.to_string()),
        };
        Self {
            parent,
            collection_id,
            all_descendants: false,
        }
    }

    /// Query over every collection with the given id, anywhere in the tree.
    pub fn collection_group(collection_id: &str) -> Self {
        Self {
            parent: String::new(),
            collection_id: collection_id.to_string(),
            all_descendants: true,
        }
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn all_descendants(&self) -> bool {
        self.all_descendants
    }
}

/// Everything the client knows about one listen target.
#[derive(Clone, Debug)]
pub struct QueryData {
    query: Query,
    target_id: TargetId,
    sequence_number: i64,
    purpose: QueryPurpose,
    snapshot_version: SnapshotVersion,
    resume_token: Vec<u8>,
}

impl QueryData {
    pub fn new(
        query: Query,
        target_id: TargetId,
        sequence_number: i64,
        purpose: QueryPurpose,
    ) -> Self {
        Self {
            query,
            target_id,
            sequence_number,
            purpose,
            snapshot_version: SnapshotVersion::NONE,
            resume_token: Vec::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn purpose(&self) -> QueryPurpose {
        self.purpose
    }

    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    pub fn resume_token(&self) -> &[u8] {
        &self.resume_token
    }

    /// Copy carrying a server-issued bookmark; sequence number and purpose are
    /// preserved.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, version: SnapshotVersion) -> Self {
        Self {
            query: self.query.clone(),
            target_id: self.target_id,
            sequence_number: self.sequence_number,
            purpose: self.purpose,
            snapshot_version: version,
            resume_token,
        }
    }

    /// Fresh request payload for the same target under a different purpose.
    /// Carries no resume token, so the backend re-materialises the target.
    pub fn for_purpose(&self, purpose: QueryPurpose) -> Self {
        Self::new(
            self.query.clone(),
            self.target_id,
            self.sequence_number,
            purpose,
        )
    }
}
