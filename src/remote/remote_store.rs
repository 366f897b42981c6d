use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::model::{DocumentKey, SnapshotVersion, TargetId};
use crate::remote::aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::remote::datastore::Datastore;
use crate::remote::listen_registry::ListenTargetRegistry;
use crate::remote::mutation::{MutationBatch, MutationBatchResult, MutationResult};
use crate::remote::online_state::{OnlineState, OnlineStateTracker};
use crate::remote::query_data::{QueryData, QueryPurpose};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::stream::{
    StreamStatus, WatchStream, WatchStreamEvents, WriteStream, WriteStreamEvents,
};
use crate::remote::transaction::Transaction;
use crate::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::remote::write_pipeline::WritePipeline;

/// Coordinates the watch and write streams against the backend on behalf of
/// the sync engine.
///
/// All entry points, stream callbacks, and timer expirations must run
/// serially on one logical worker; invoking any method in parallel is a
/// contract violation.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        datastore: Arc<Datastore>,
        local_store: Arc<dyn LocalStore>,
        syncer: Arc<dyn RemoteSyncer>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_events: Arc<dyn WatchStreamEvents> = Arc::new(WatchEventsProxy {
                inner: weak.clone(),
            });
            let write_events: Arc<dyn WriteStreamEvents> = Arc::new(WriteEventsProxy {
                inner: weak.clone(),
            });
            RemoteStoreInner {
                watch_stream: datastore.create_watch_stream(watch_events),
                write_stream: datastore.create_write_stream(write_events),
                online_tracker: OnlineStateTracker::new(Arc::clone(&syncer)),
                registry: Arc::new(ListenTargetRegistry::new()),
                write_pipeline: WritePipeline::new(),
                aggregator: Mutex::new(None),
                network_enabled: AtomicBool::new(false),
                datastore,
                local_store,
                syncer,
            }
        });
        Self { inner }
    }

    /// Starts the datastore and brings the network up.
    pub async fn start(&self) -> SyncResult<()> {
        self.inner.datastore.start();
        self.inner.enable_network().await
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        self.inner.enable_network().await
    }

    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner.disable_network().await
    }

    /// Stops both streams and tears the datastore down. Pipelined writes are
    /// dropped from memory only; they remain durable in the local store.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.inner.shutdown().await
    }

    /// Registers a listen target. The target is sent immediately when the
    /// watch stream is open, otherwise on the next (re)connect.
    pub async fn listen(&self, target: QueryData) -> SyncResult<()> {
        self.inner.listen(target).await
    }

    /// Withdraws a previously registered listen target.
    pub async fn unlisten(&self, target_id: TargetId) -> SyncResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Tops the write pipeline up from the local mutation queue and starts
    /// the write stream when there is something to send.
    pub async fn fill_write_pipeline(&self) -> SyncResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Tears both streams down and reconnects with fresh credentials. The
    /// registry is preserved; the pipeline refills from the (possibly new)
    /// user's mutation queue.
    pub async fn handle_credential_change(&self) -> SyncResult<()> {
        self.inner.handle_credential_change().await
    }

    /// One-shot transaction bound to the datastore.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.inner.datastore))
    }

    // Introspection, primarily for diagnostics and tests.

    pub fn is_network_enabled(&self) -> bool {
        self.inner.can_use_network()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_tracker.state()
    }

    pub fn listen_target(&self, target_id: TargetId) -> Option<QueryData> {
        self.inner.registry.get(target_id)
    }

    pub fn pending_write_count(&self) -> usize {
        self.inner.write_pipeline.len()
    }

    pub fn is_watch_stream_started(&self) -> bool {
        self.inner.watch_stream.is_started()
    }

    pub fn is_write_stream_started(&self) -> bool {
        self.inner.write_stream.is_started()
    }
}

struct RemoteStoreInner {
    datastore: Arc<Datastore>,
    local_store: Arc<dyn LocalStore>,
    syncer: Arc<dyn RemoteSyncer>,
    registry: Arc<ListenTargetRegistry>,
    write_pipeline: WritePipeline,
    online_tracker: OnlineStateTracker,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    aggregator: Mutex<Option<WatchChangeAggregator>>,
    network_enabled: AtomicBool,
}

impl RemoteStoreInner {
    fn can_use_network(&self) -> bool {
        self.network_enabled.load(Ordering::SeqCst)
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.registry.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.has_capacity()
    }

    async fn enable_network(&self) -> SyncResult<()> {
        self.network_enabled.store(true, Ordering::SeqCst);
        // Resume the previous write session, if one was persisted.
        self.write_stream
            .set_last_stream_token(self.local_store.last_stream_token());

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.online_tracker.update_state(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network(&self) -> SyncResult<()> {
        self.disable_network_internal().await;
        self.online_tracker.update_state(OnlineState::Offline).await;
        Ok(())
    }

    async fn disable_network_internal(&self) {
        self.network_enabled.store(false, Ordering::SeqCst);
        self.watch_stream.stop().await;
        self.write_stream.stop().await;
        let dropped = self.write_pipeline.clear();
        if dropped > 0 {
            log::debug!(
                "dropping {dropped} pipelined writes; they remain in the local mutation queue"
            );
        }
        self.clean_up_watch_stream_state();
    }

    async fn shutdown(&self) -> SyncResult<()> {
        log::debug!("remote store shutting down");
        self.disable_network_internal().await;
        // Unknown rather than Offline, to avoid spurious listener events.
        self.online_tracker.update_state(OnlineState::Unknown).await;
        self.datastore.shutdown();
        Ok(())
    }

    async fn handle_credential_change(&self) -> SyncResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        log::debug!("credentials changed, restarting streams");
        self.disable_network_internal().await;
        self.online_tracker.update_state(OnlineState::Unknown).await;
        self.syncer.handle_credential_change().await?;
        self.enable_network().await
    }

    async fn listen(&self, target: QueryData) -> SyncResult<()> {
        self.registry.insert(target.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&target).await?;
        }
        Ok(())
    }

    async fn unlisten(&self, target_id: TargetId) -> SyncResult<()> {
        self.registry.remove(target_id);

        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id).await?;
        }
        if self.registry.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // Nothing to watch, so the stream can no longer vouch for
                // connectivity either way.
                self.online_tracker.update_state(OnlineState::Unknown).await;
            }
        }
        Ok(())
    }

    async fn send_watch_request(&self, target: &QueryData) -> SyncResult<()> {
        self.record_pending_target_request(target.target_id());
        self.watch_stream.watch_query(target).await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> SyncResult<()> {
        self.record_pending_target_request(target_id);
        self.watch_stream.unwatch_target(target_id).await
    }

    fn record_pending_target_request(&self, target_id: TargetId) {
        let mut aggregator = self.aggregator.lock().unwrap();
        if let Some(aggregator) = aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
    }

    fn start_watch_stream(&self) {
        debug_assert!(self.should_start_watch_stream());
        {
            let provider = Arc::new(StoreMetadataProvider {
                registry: Arc::clone(&self.registry),
                syncer: Arc::clone(&self.syncer),
            });
            let mut aggregator = self.aggregator.lock().unwrap();
            *aggregator = Some(WatchChangeAggregator::new(provider));
        }
        self.watch_stream.start();
        self.online_tracker.handle_watch_stream_start();
    }

    fn clean_up_watch_stream_state(&self) {
        *self.aggregator.lock().unwrap() = None;
    }

    // ---- watch stream callbacks -------------------------------------------

    async fn on_watch_stream_open(&self) -> SyncResult<()> {
        for target in self.registry.snapshot() {
            self.send_watch_request(&target).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()> {
        // A frame arrived, so the backend is reachable.
        self.online_tracker.update_state(OnlineState::Online).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Removed {
                if let Some(cause) = target_change.cause.clone() {
                    // Per-target error; handled without touching the snapshot.
                    return self.process_target_error(target_change, cause).await;
                }
            }
        }

        {
            let mut guard = self.aggregator.lock().unwrap();
            let Some(aggregator) = guard.as_mut() else {
                // The stream was torn down while this frame was in flight.
                return Ok(());
            };
            match &change {
                WatchChange::TargetChange(target_change) => {
                    aggregator.handle_target_change(target_change);
                }
                WatchChange::DocumentChange(document_change) => {
                    aggregator.handle_document_change(document_change);
                }
                WatchChange::ExistenceFilter(filter) => {
                    aggregator.handle_existence_filter(filter);
                }
            }
        }

        if !snapshot_version.is_none()
            && snapshot_version >= self.local_store.last_remote_snapshot_version()
        {
            // A consistent snapshot has been reached.
            self.raise_watch_snapshot(snapshot_version).await?;
        }
        Ok(())
    }

    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> SyncResult<()> {
        debug_assert!(!snapshot_version.is_none());

        let remote_event = {
            let mut guard = self.aggregator.lock().unwrap();
            let Some(aggregator) = guard.as_mut() else {
                return Ok(());
            };
            aggregator.create_remote_event(snapshot_version)
        };

        // Fold fresh resume tokens back into the registry so a stream restart
        // resumes from this snapshot instead of replaying it.
        for (target_id, target_change) in &remote_event.target_changes {
            self.registry.update_from_remote_event(
                *target_id,
                snapshot_version,
                &target_change.resume_token,
            );
        }

        for &target_id in &remote_event.target_mismatches {
            let Some(target) = self.registry.clear_resume_token(target_id) else {
                // Unlistened while the mismatch was in flight.
                continue;
            };
            // Force the backend to re-materialise the target: unwatch, then
            // re-watch without a resume token. The mismatch purpose rides on
            // the request only and is never stored in the registry.
            self.send_unwatch_request(target_id).await?;
            let request = target.for_purpose(QueryPurpose::ExistenceFilterMismatch);
            self.send_watch_request(&request).await?;
        }

        self.syncer.apply_remote_event(remote_event).await
    }

    async fn process_target_error(
        &self,
        change: &WatchTargetChange,
        cause: SyncError,
    ) -> SyncResult<()> {
        log::debug!(
            "watch reported error for targets {:?}: {cause}",
            change.target_ids
        );
        for &target_id in &change.target_ids {
            if !self.registry.contains(target_id) {
                continue;
            }
            self.registry.remove(target_id);
            {
                let mut aggregator = self.aggregator.lock().unwrap();
                if let Some(aggregator) = aggregator.as_mut() {
                    aggregator.remove_target(target_id);
                }
            }
            self.syncer.reject_listen(target_id, cause.clone()).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, status: StreamStatus) {
        if status.is_ok() {
            // A graceful close only happens when the stream is no longer
            // needed; anything else is a programming error.
            assert!(
                !self.should_start_watch_stream(),
                "watch stream stopped gracefully while still needed"
            );
        }

        self.clean_up_watch_stream_state();

        if self.should_start_watch_stream() {
            if let Err(error) = &status {
                self.online_tracker.handle_watch_stream_failure(error).await;
            }
            self.start_watch_stream();
        } else {
            self.online_tracker.update_state(OnlineState::Unknown).await;
        }
    }

    // ---- write stream callbacks -------------------------------------------

    fn start_write_stream(&self) {
        debug_assert!(self.should_start_write_stream());
        self.write_stream.start();
    }

    async fn fill_write_pipeline(&self) -> SyncResult<()> {
        let mut last_batch_id = self.write_pipeline.last_batch_id();
        while self.can_add_to_write_pipeline() {
            match self.local_store.next_mutation_batch_after(last_batch_id).await? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch).await?;
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> SyncResult<()> {
        debug_assert!(self.can_add_to_write_pipeline());
        let mutations = batch.mutations.clone();
        self.write_pipeline.enqueue(batch);

        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn on_write_stream_open(&self) -> SyncResult<()> {
        self.write_stream.write_handshake().await
    }

    async fn on_write_handshake_complete(&self) -> SyncResult<()> {
        // Persist the negotiated token so a later session can resume it.
        self.local_store
            .set_last_stream_token(self.write_stream.last_stream_token());

        // Every pipelined batch is still unacked; re-send them in order.
        for batch in self.write_pipeline.batches() {
            self.write_stream.write_mutations(&batch.mutations).await?;
        }
        Ok(())
    }

    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()> {
        let batch = self.write_pipeline.pop_first();
        let stream_token = self.write_stream.last_stream_token();
        let result = MutationBatchResult::new(batch, commit_version, results, stream_token)?;
        self.syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, status: StreamStatus) {
        match &status {
            Ok(()) => {
                assert!(
                    !self.should_start_write_stream(),
                    "write stream stopped gracefully while still needed"
                );
            }
            Err(error) => {
                if !self.write_pipeline.is_empty() {
                    let handled = if self.write_stream.handshake_complete() {
                        self.handle_write_error(error).await
                    } else {
                        self.handle_handshake_error(error);
                        Ok(())
                    };
                    if let Err(err) = handled {
                        log::warn!("failed to process write stream error: {err}");
                    }
                }
            }
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
    }

    fn handle_handshake_error(&self, error: &SyncError) {
        if Datastore::is_permanent_error(error) {
            let token = self.write_stream.last_stream_token();
            log::debug!(
                "discarding stream token {} after permanent handshake error: {error}",
                BASE64_STANDARD.encode(&token)
            );
            // The next start handshakes from scratch.
            self.write_stream.set_last_stream_token(Vec::new());
            self.local_store.set_last_stream_token(Vec::new());
        }
    }

    async fn handle_write_error(&self, error: &SyncError) -> SyncResult<()> {
        if !Datastore::is_permanent_write_error(error) {
            // Transient; the restart re-sends the pipeline after backoff.
            return Ok(());
        }

        // Only the head batch can have caused the failure. The tail is
        // presumed healthy, so the restart skips the backoff delay.
        let batch = self.write_pipeline.pop_first();
        self.write_stream.inhibit_backoff();
        self.syncer
            .reject_failed_write(batch.batch_id, error.clone())
            .await?;
        self.fill_write_pipeline().await
    }
}

/// Lookup handle the aggregator holds back into the coordinator.
struct StoreMetadataProvider {
    registry: Arc<ListenTargetRegistry>,
    syncer: Arc<dyn RemoteSyncer>,
}

impl TargetMetadataProvider for StoreMetadataProvider {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn query_data_for_target(&self, target_id: TargetId) -> Option<QueryData> {
        self.registry.get(target_id)
    }
}

struct WatchEventsProxy {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamEvents for WatchEventsProxy {
    async fn on_watch_stream_open(&self) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_watch_stream_close(&self, status: StreamStatus) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_stream_close(status).await;
        }
    }
}

struct WriteEventsProxy {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamEvents for WriteEventsProxy {
    async fn on_write_stream_open(&self) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_write_handshake_complete(&self) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_response(commit_version, results).await,
            None => Ok(()),
        }
    }

    async fn on_write_stream_close(&self, status: StreamStatus) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_stream_close(status).await;
        }
    }
}
