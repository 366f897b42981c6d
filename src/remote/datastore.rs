use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{SyncError, SyncErrorCode, SyncResult};
use crate::model::{DocumentKey, SnapshotVersion};
use crate::remote::connection::{Connection, UnaryMethod};
use crate::remote::mutation::{Mutation, MutationResult};
use crate::remote::serializer::{DocumentLookup, WireSerializer};
use crate::remote::stream::{WatchStream, WatchStreamEvents, WriteStream, WriteStreamEvents};

/// Facade over the transport: constructs the two streams, serves the unary
/// calls transactions need, and classifies stream failures.
pub struct Datastore {
    connection: Arc<dyn Connection>,
    serializer: Arc<WireSerializer>,
    shut_down: AtomicBool,
}

impl Datastore {
    pub fn new(connection: Arc<dyn Connection>, serializer: WireSerializer) -> Self {
        Self {
            connection,
            serializer: Arc::new(serializer),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn serializer(&self) -> &WireSerializer {
        &self.serializer
    }

    pub fn start(&self) {
        log::debug!(
            "datastore started for {}",
            self.serializer.database_name()
        );
    }

    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            log::debug!("datastore shutting down");
            self.connection.shutdown();
        }
    }

    pub fn create_watch_stream(&self, events: Arc<dyn WatchStreamEvents>) -> WatchStream {
        WatchStream::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.serializer),
            events,
        )
    }

    pub fn create_write_stream(&self, events: Arc<dyn WriteStreamEvents>) -> WriteStream {
        WriteStream::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.serializer),
            events,
        )
    }

    /// Unary read used by transactions.
    pub async fn lookup_documents(
        &self,
        keys: &[DocumentKey],
    ) -> SyncResult<Vec<DocumentLookup>> {
        let request = self.serializer.encode_lookup_request(keys)?;
        let response = self.connection.invoke(UnaryMethod::Lookup, request).await?;
        self.serializer.decode_lookup_response(&response)
    }

    /// Unary commit used by transactions.
    pub async fn commit_mutations(
        &self,
        mutations: &[Mutation],
    ) -> SyncResult<(SnapshotVersion, Vec<MutationResult>)> {
        let request = self.serializer.encode_commit_request(mutations)?;
        let response = self.connection.invoke(UnaryMethod::Commit, request).await?;
        self.serializer.decode_commit_response(&response)
    }

    /// Whether retrying can ever cure the failure. Auth failures are
    /// deliberately non-permanent: the handshake retries them with refreshed
    /// credentials.
    pub fn is_permanent_error(error: &SyncError) -> bool {
        use SyncErrorCode::*;
        match error.code {
            Cancelled | Unknown | DeadlineExceeded | ResourceExhausted | Internal
            | Unavailable | Unauthenticated => false,
            InvalidArgument | NotFound | AlreadyExists | PermissionDenied
            | FailedPrecondition | Aborted | OutOfRange | Unimplemented | DataLoss => true,
        }
    }

    /// Like [`Self::is_permanent_error`], for failures observed in response
    /// to a mutation. Aborted writes are retried.
    pub fn is_permanent_write_error(error: &SyncError) -> bool {
        Self::is_permanent_error(error) && error.code != SyncErrorCode::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{aborted, internal_error, permission_denied, unauthenticated, unavailable};
    use crate::remote::connection::loopback::loopback_pair;
    use serde_json::json;

    #[test]
    fn transient_codes_are_not_permanent() {
        assert!(!Datastore::is_permanent_error(&unavailable("down")));
        assert!(!Datastore::is_permanent_error(&internal_error("bug")));
        assert!(!Datastore::is_permanent_error(&unauthenticated("expired")));
        assert!(Datastore::is_permanent_error(&permission_denied("nope")));
    }

    #[test]
    fn aborted_writes_are_retried() {
        assert!(Datastore::is_permanent_error(&aborted("contention")));
        assert!(!Datastore::is_permanent_write_error(&aborted("contention")));
        assert!(Datastore::is_permanent_write_error(&permission_denied(
            "nope"
        )));
    }

    #[tokio::test]
    async fn lookup_round_trips_found_and_missing() {
        let (connection, server) = loopback_pair();
        let datastore = Datastore::new(
            connection,
            WireSerializer::new("projects/test/databases/(default)"),
        );

        let response = json!({
            "documents": [
                {
                    "found": {
                        "name": "projects/test/databases/(default)/documents/rooms/a",
                        "fields": {},
                        "updateTime": { "seconds": 3, "nanos": 0 },
                    }
                },
                { "missing": "projects/test/databases/(default)/documents/rooms/b" },
            ]
        });
        server.push_unary_response(Ok(serde_json::to_vec(&response).unwrap()));

        let keys = vec![
            DocumentKey::parse("rooms/a").unwrap(),
            DocumentKey::parse("rooms/b").unwrap(),
        ];
        let lookups = datastore.lookup_documents(&keys).await.unwrap();

        assert_eq!(lookups.len(), 2);
        assert!(lookups[0].document.is_some());
        assert!(!lookups[0].read_version.is_none());
        assert!(lookups[1].document.is_none());
        assert!(lookups[1].read_version.is_none());
    }
}
