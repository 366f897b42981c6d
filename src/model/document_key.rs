use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::error::{invalid_argument, SyncResult};

/// Slash-separated path identifying a single document.
///
/// Segments alternate collection id / document id, so a valid key always has
/// an even, non-zero number of segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    segments: Vec<String>,
}

impl DocumentKey {
    pub fn from_segments(segments: Vec<String>) -> SyncResult<Self> {
        if segments.is_empty() || segments.len() % 2 != 0 {
            return Err(invalid_argument(
                "Document keys must point to a document (even number of segments)",
            ));
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument("Document keys cannot have empty segments"));
        }
        Ok(Self { segments })
    }

    pub fn parse(path: &str) -> SyncResult<Self> {
        Self::from_segments(path.split('/').map(str::to_string).collect())
    }

    pub fn path(&self) -> String {
        self.segments.join("/")
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn collection_id(&self) -> &str {
        &self.segments[self.segments.len() - 2]
    }

    pub fn id(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path())
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
