use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex as StdMutex;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::error::{invalid_argument, SyncResult};
use crate::local::LocalStore;
use crate::model::{BatchId, SnapshotVersion, Timestamp};
use crate::remote::mutation::{Mutation, MutationBatch};

/// In-memory [`LocalStore`] for tests and embedders without durable storage.
///
/// Batches stay queued until explicitly acknowledged, so a network disable
/// followed by re-enable re-fetches exactly the unacked tail.
pub struct MemoryLocalStore {
    batches: Mutex<VecDeque<MutationBatch>>,
    stream_token: StdMutex<Vec<u8>>,
    remote_snapshot_version: StdMutex<SnapshotVersion>,
    next_batch_id: AtomicI32,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            stream_token: StdMutex::new(Vec::new()),
            remote_snapshot_version: StdMutex::new(SnapshotVersion::NONE),
            next_batch_id: AtomicI32::new(1),
        }
    }

    /// Queues a mutation batch for delivery and returns its assigned id.
    pub async fn enqueue_batch(&self, mutations: Vec<Mutation>) -> SyncResult<BatchId> {
        if mutations.is_empty() {
            return Err(invalid_argument(
                "mutation batch must contain at least one write",
            ));
        }
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        let batch = MutationBatch::new(batch_id, Timestamp::now(), mutations);
        self.batches.lock().await.push_back(batch);
        Ok(batch_id)
    }

    /// Removes every batch up to and including `batch_id`; called once the
    /// backend acknowledged or permanently rejected them.
    pub async fn acknowledge_batches_through(&self, batch_id: BatchId) {
        self.batches
            .lock()
            .await
            .retain(|batch| batch.batch_id > batch_id);
    }

    pub async fn queued_batch_ids(&self) -> Vec<BatchId> {
        self.batches
            .lock()
            .await
            .iter()
            .map(|batch| batch.batch_id)
            .collect()
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl LocalStore for MemoryLocalStore {
    async fn next_mutation_batch_after(
        &self,
        batch_id: Option<BatchId>,
    ) -> SyncResult<Option<MutationBatch>> {
        let batches = self.batches.lock().await;
        let next = match batch_id {
            Some(after) => batches.iter().find(|batch| batch.batch_id > after),
            None => batches.front(),
        };
        Ok(next.cloned())
    }

    fn last_stream_token(&self) -> Vec<u8> {
        self.stream_token.lock().unwrap().clone()
    }

    fn set_last_stream_token(&self, token: Vec<u8>) {
        *self.stream_token.lock().unwrap() = token;
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        *self.remote_snapshot_version.lock().unwrap()
    }

    fn set_last_remote_snapshot_version(&self, version: SnapshotVersion) {
        *self.remote_snapshot_version.lock().unwrap() = version;
    }
}
