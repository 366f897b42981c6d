use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::model::{BatchId, DocumentKey, TargetId};
use crate::remote::mutation::MutationBatchResult;
use crate::remote::online_state::OnlineState;
use crate::remote::remote_event::RemoteEvent;

/// Bridge between the remote store and the local synchronization engine.
///
/// The remote store surfaces everything it learns from the backend through
/// these callbacks; per-entity failures arrive here instead of propagating out
/// of the store.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot produced by the watch stream.
    async fn apply_remote_event(&self, event: RemoteEvent) -> SyncResult<()>;

    /// Signals that a listen target was terminated by the backend.
    async fn reject_listen(&self, target_id: TargetId, error: SyncError) -> SyncResult<()>;

    /// Applies the acknowledgement for a committed mutation batch.
    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()>;

    /// Rejects a mutation batch the backend permanently refused.
    async fn reject_failed_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()>;

    /// Observes connectivity transitions derived from watch-stream health.
    async fn handle_online_state_change(&self, state: OnlineState);

    /// Keys the sync engine currently believes are in the target; consulted
    /// when reconciling existence filters.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Invoked mid credential rotation, before the streams reconnect, so the
    /// engine can switch to the new user's mutation queue.
    async fn handle_credential_change(&self) -> SyncResult<()> {
        Ok(())
    }
}
