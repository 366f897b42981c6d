pub mod memory;

pub use memory::MemoryLocalStore;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::model::{BatchId, SnapshotVersion};
use crate::remote::mutation::MutationBatch;

/// Durable state the remote store depends on: the queued mutation log, the
/// write-stream session token, and the high-water snapshot version.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait LocalStore: Send + Sync + 'static {
    /// Next queued batch with an id strictly greater than `batch_id`;
    /// `None` starts from the front of the queue.
    async fn next_mutation_batch_after(
        &self,
        batch_id: Option<BatchId>,
    ) -> SyncResult<Option<MutationBatch>>;

    /// Stream token negotiated by the last write handshake; empty when no
    /// session has been established yet.
    fn last_stream_token(&self) -> Vec<u8>;

    fn set_last_stream_token(&self, token: Vec<u8>);

    /// Highest snapshot version a remote event has been applied at.
    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn set_last_remote_snapshot_version(&self, version: SnapshotVersion);
}
