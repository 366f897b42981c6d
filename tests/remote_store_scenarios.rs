//! End-to-end scenarios driving a [`RemoteStore`] against a scripted loopback
//! backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use docsync::error::{permission_denied, unavailable, SyncError, SyncResult};
use docsync::local::{LocalStore, MemoryLocalStore};
use docsync::model::{BatchId, DocumentKey, SnapshotVersion, TargetId, Timestamp};
use docsync::remote::connection::loopback::{loopback_pair, LoopbackServer, ServerStream};
use docsync::remote::connection::StreamKind;
use docsync::remote::mutation::{Mutation, MutationBatchResult};
use docsync::remote::query_data::{Query, QueryData, QueryPurpose};
use docsync::remote::remote_event::RemoteEvent;
use docsync::remote::serializer::WireSerializer;
use docsync::remote::{Datastore, OnlineState, RemoteStore, RemoteSyncer};

const DATABASE: &str = "projects/test/databases/(default)";

#[derive(Default)]
struct RecordingSyncer {
    events: Mutex<Vec<RemoteEvent>>,
    rejected_listens: Mutex<Vec<(TargetId, SyncError)>>,
    successful_writes: Mutex<Vec<MutationBatchResult>>,
    failed_writes: Mutex<Vec<(BatchId, SyncError)>>,
    online_states: Mutex<Vec<OnlineState>>,
    remote_keys: Mutex<BTreeMap<TargetId, BTreeSet<DocumentKey>>>,
    credential_changes: Mutex<usize>,
    local_store: Mutex<Option<Arc<MemoryLocalStore>>>,
}

impl RecordingSyncer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn track_local_store(&self, local_store: Arc<MemoryLocalStore>) {
        *self.local_store.lock().unwrap() = Some(local_store);
    }

    fn seed_remote_keys(&self, target_id: TargetId, paths: &[&str]) {
        self.remote_keys.lock().unwrap().insert(
            target_id,
            paths
                .iter()
                .map(|path| DocumentKey::parse(path).unwrap())
                .collect(),
        );
    }

    fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn successful_batch_ids(&self) -> Vec<BatchId> {
        self.successful_writes
            .lock()
            .unwrap()
            .iter()
            .map(|result| result.batch_id())
            .collect()
    }

    fn failed_batch_ids(&self) -> Vec<BatchId> {
        self.failed_writes
            .lock()
            .unwrap()
            .iter()
            .map(|(batch_id, _)| *batch_id)
            .collect()
    }

    fn online_states(&self) -> Vec<OnlineState> {
        self.online_states.lock().unwrap().clone()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteSyncer for RecordingSyncer {
    async fn apply_remote_event(&self, event: RemoteEvent) -> SyncResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn reject_listen(&self, target_id: TargetId, error: SyncError) -> SyncResult<()> {
        self.rejected_listens.lock().unwrap().push((target_id, error));
        Ok(())
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()> {
        let local_store = self.local_store.lock().unwrap().clone();
        if let Some(local_store) = local_store {
            local_store
                .acknowledge_batches_through(result.batch_id())
                .await;
        }
        self.successful_writes.lock().unwrap().push(result);
        Ok(())
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()> {
        let local_store = self.local_store.lock().unwrap().clone();
        if let Some(local_store) = local_store {
            local_store.acknowledge_batches_through(batch_id).await;
        }
        self.failed_writes.lock().unwrap().push((batch_id, error));
        Ok(())
    }

    async fn handle_online_state_change(&self, state: OnlineState) {
        self.online_states.lock().unwrap().push(state);
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.remote_keys
            .lock()
            .unwrap()
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn handle_credential_change(&self) -> SyncResult<()> {
        *self.credential_changes.lock().unwrap() += 1;
        Ok(())
    }
}

struct Harness {
    store: RemoteStore,
    server: LoopbackServer,
    syncer: Arc<RecordingSyncer>,
    local_store: Arc<MemoryLocalStore>,
}

fn harness() -> Harness {
    let (connection, server) = loopback_pair();
    let datastore = Arc::new(Datastore::new(connection, WireSerializer::new(DATABASE)));
    let local_store = Arc::new(MemoryLocalStore::new());
    let syncer = RecordingSyncer::new();
    syncer.track_local_store(Arc::clone(&local_store));
    let store = RemoteStore::new(
        datastore,
        Arc::clone(&local_store) as Arc<dyn LocalStore>,
        Arc::clone(&syncer) as Arc<dyn RemoteSyncer>,
    );
    Harness {
        store,
        server,
        syncer,
        local_store,
    }
}

fn listen_target(target_id: TargetId) -> QueryData {
    QueryData::new(Query::collection("rooms"), target_id, 1, QueryPurpose::Listen)
}

fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(DocumentKey::parse(path).unwrap())
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

async fn spin_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

async fn request_json(stream: &ServerStream) -> JsonValue {
    let payload = stream.next_request().await.expect("request frame");
    serde_json::from_slice(&payload).expect("request json")
}

async fn send_json(stream: &ServerStream, value: &JsonValue) {
    stream
        .send_response(serde_json::to_vec(value).expect("encode frame"))
        .await
        .expect("send frame");
}

fn target_change(kind: &str, target_ids: &[TargetId]) -> JsonValue {
    json!({
        "targetChange": {
            "targetChangeType": kind,
            "targetIds": target_ids,
        }
    })
}

fn snapshot_frame(target_ids: &[TargetId], resume_token: &[u8], seconds: i64) -> JsonValue {
    let mut change = json!({
        "targetChange": {
            "targetChangeType": "NO_CHANGE",
            "targetIds": target_ids,
            "readTime": { "seconds": seconds, "nanos": 0 },
        }
    });
    if !resume_token.is_empty() {
        change["targetChange"]["resumeToken"] = json!(BASE64_STANDARD.encode(resume_token));
    }
    change
}

fn document_change(path: &str, target_ids: &[TargetId]) -> JsonValue {
    json!({
        "documentChange": {
            "document": {
                "name": format!("{DATABASE}/documents/{path}"),
                "fields": {},
            },
            "targetIds": target_ids,
        }
    })
}

fn handshake_ack(token: &[u8]) -> JsonValue {
    json!({ "streamToken": BASE64_STANDARD.encode(token) })
}

fn write_ack(token: &[u8], commit_seconds: i64, result_count: usize) -> JsonValue {
    let results: Vec<JsonValue> = (0..result_count).map(|_| json!({})).collect();
    json!({
        "streamToken": BASE64_STANDARD.encode(token),
        "commitTime": { "seconds": commit_seconds, "nanos": 0 },
        "writeResults": results,
    })
}

/// Completes the write-stream handshake and drains the re-sent pipeline,
/// returning the write request frames in arrival order.
async fn complete_handshake(
    stream: &ServerStream,
    token: &[u8],
    expected_batches: usize,
) -> Vec<JsonValue> {
    let handshake = request_json(stream).await;
    assert_eq!(handshake.get("database"), Some(&json!(DATABASE)));
    send_json(stream, &handshake_ack(token)).await;

    let mut batches = Vec::new();
    for _ in 0..expected_batches {
        batches.push(request_json(stream).await);
    }
    batches
}

// S1 — listen, receive snapshot.
#[tokio::test]
async fn listen_receives_a_consistent_snapshot() {
    let h = harness();
    h.store.enable_network().await.unwrap();
    h.store.listen(listen_target(2)).await.unwrap();

    let watch = h.server.accept().await.unwrap();
    assert_eq!(watch.kind(), StreamKind::Watch);

    let request = request_json(&watch).await;
    assert_eq!(request.pointer("/addTarget/targetId"), Some(&json!(2)));

    send_json(&watch, &target_change("ADD", &[2])).await;
    send_json(&watch, &document_change("rooms/d", &[2])).await;
    send_json(&watch, &snapshot_frame(&[2], b"r1", 7)).await;

    spin_until(|| h.syncer.event_count() == 1).await;

    let events = h.syncer.events.lock().unwrap();
    let event = &events[0];
    assert_eq!(event.snapshot_version, version(7));
    assert!(event
        .document_updates
        .contains_key(&DocumentKey::parse("rooms/d").unwrap()));
    let change = event.target_changes.get(&2).unwrap();
    assert!(change
        .added_documents
        .contains(&DocumentKey::parse("rooms/d").unwrap()));
    assert_eq!(change.resume_token, b"r1");
    drop(events);

    let entry = h.store.listen_target(2).unwrap();
    assert_eq!(entry.resume_token(), b"r1");
    assert_eq!(entry.snapshot_version(), version(7));

    assert_eq!(h.syncer.online_states(), vec![OnlineState::Online]);
}

// S2 — existence-filter mismatch forces a tokenless re-listen.
#[tokio::test]
async fn existence_filter_mismatch_relistens_without_resume_token() {
    let h = harness();
    h.syncer.seed_remote_keys(3, &["rooms/a", "rooms/b", "rooms/c"]);

    h.store.enable_network().await.unwrap();
    let target = listen_target(3).with_resume_token(b"old".to_vec(), version(1));
    h.store.listen(target).await.unwrap();

    let watch = h.server.accept().await.unwrap();
    let request = request_json(&watch).await;
    assert_eq!(
        request.pointer("/addTarget/resumeToken"),
        Some(&json!(BASE64_STANDARD.encode(b"old")))
    );

    // The listen must be acked before target-level frames take effect.
    send_json(&watch, &target_change("ADD", &[3])).await;
    // Server claims five documents; the client only knows three.
    send_json(&watch, &json!({ "filter": { "targetId": 3, "count": 5 } })).await;
    send_json(&watch, &snapshot_frame(&[], b"", 2)).await;

    let unwatch = request_json(&watch).await;
    assert_eq!(unwatch.get("removeTarget"), Some(&json!(3)));

    let rewatch = request_json(&watch).await;
    assert_eq!(rewatch.pointer("/addTarget/targetId"), Some(&json!(3)));
    assert!(rewatch.pointer("/addTarget/resumeToken").is_none());
    assert_eq!(
        rewatch.pointer("/labels/sync-tag"),
        Some(&json!("existence-filter-mismatch"))
    );

    spin_until(|| h.syncer.event_count() == 1).await;
    {
        let events = h.syncer.events.lock().unwrap();
        assert!(events[0].target_mismatches.contains(&3));
    }

    // The registry keeps the target, with the token cleared and the purpose
    // still `Listen`.
    let entry = h.store.listen_target(3).unwrap();
    assert!(entry.resume_token().is_empty());
    assert_eq!(entry.purpose(), QueryPurpose::Listen);
}

// S3 — write pipeline FIFO through handshake and first ack.
#[tokio::test]
async fn write_pipeline_sends_batches_in_order() {
    let h = harness();
    for path in ["rooms/b1", "rooms/b2", "rooms/b3"] {
        h.local_store
            .enqueue_batch(vec![delete_mutation(path)])
            .await
            .unwrap();
    }

    h.store.enable_network().await.unwrap();
    assert_eq!(h.store.pending_write_count(), 3);

    let write = h.server.accept().await.unwrap();
    assert_eq!(write.kind(), StreamKind::Write);

    let batches = complete_handshake(&write, b"t1", 3).await;
    for (index, batch) in batches.iter().enumerate() {
        let expected = format!("{DATABASE}/documents/rooms/b{}", index + 1);
        assert_eq!(batch.pointer("/writes/0/delete"), Some(&json!(expected)));
    }
    spin_until(|| h.local_store.last_stream_token() == b"t1").await;

    send_json(&write, &write_ack(b"t2", 10, 1)).await;
    spin_until(|| !h.syncer.successful_batch_ids().is_empty()).await;

    assert_eq!(h.syncer.successful_batch_ids(), vec![1]);
    assert_eq!(h.store.pending_write_count(), 2);
    {
        let writes = h.syncer.successful_writes.lock().unwrap();
        assert_eq!(writes[0].commit_version, version(10));
        assert_eq!(writes[0].stream_token, b"t2");
    }
}

// S4 — permanent write error rejects the head batch and resends the tail.
#[tokio::test]
async fn permanent_write_error_drops_head_and_resends_tail() {
    let h = harness();
    for path in ["rooms/b1", "rooms/b2", "rooms/b3"] {
        h.local_store
            .enqueue_batch(vec![delete_mutation(path)])
            .await
            .unwrap();
    }

    h.store.enable_network().await.unwrap();
    let write = h.server.accept().await.unwrap();
    complete_handshake(&write, b"t1", 3).await;

    write.fail(permission_denied("rejected by rules")).await;

    spin_until(|| !h.syncer.failed_batch_ids().is_empty()).await;
    assert_eq!(h.syncer.failed_batch_ids(), vec![1]);
    assert_eq!(h.store.pending_write_count(), 2);

    // The restart skipped backoff and re-handshakes, then resends B2 and B3.
    let second = h.server.accept().await.unwrap();
    assert_eq!(second.kind(), StreamKind::Write);
    let batches = complete_handshake(&second, b"t2", 2).await;
    assert_eq!(
        batches[0].pointer("/writes/0/delete"),
        Some(&json!(format!("{DATABASE}/documents/rooms/b2")))
    );
    assert_eq!(
        batches[1].pointer("/writes/0/delete"),
        Some(&json!(format!("{DATABASE}/documents/rooms/b3")))
    );
}

// Transient write errors keep the pipeline intact.
#[tokio::test]
async fn transient_write_error_keeps_the_pipeline() {
    let h = harness();
    h.local_store
        .enqueue_batch(vec![delete_mutation("rooms/b1")])
        .await
        .unwrap();

    h.store.enable_network().await.unwrap();
    let write = h.server.accept().await.unwrap();
    complete_handshake(&write, b"t1", 1).await;

    write.fail(unavailable("backend restarting")).await;

    // The batch stays pipelined and is re-sent after the restart.
    let second = h.server.accept().await.unwrap();
    let batches = complete_handshake(&second, b"t1", 1).await;
    assert_eq!(
        batches[0].pointer("/writes/0/delete"),
        Some(&json!(format!("{DATABASE}/documents/rooms/b1")))
    );
    assert_eq!(h.store.pending_write_count(), 1);
    assert!(h.syncer.failed_batch_ids().is_empty());
}

// Permanent handshake errors clear the persisted stream token.
#[tokio::test]
async fn permanent_handshake_error_clears_the_stream_token() {
    let h = harness();
    h.local_store.set_last_stream_token(b"stale".to_vec());
    h.local_store
        .enqueue_batch(vec![delete_mutation("rooms/b1")])
        .await
        .unwrap();

    h.store.enable_network().await.unwrap();
    let write = h.server.accept().await.unwrap();

    let handshake = request_json(&write).await;
    assert_eq!(
        handshake.get("streamToken"),
        Some(&json!(BASE64_STANDARD.encode(b"stale")))
    );
    write.fail(permission_denied("token no longer valid")).await;

    spin_until(|| h.local_store.last_stream_token().is_empty()).await;

    // The restarted stream handshakes from scratch, without a token.
    let second = h.server.accept().await.unwrap();
    let handshake = request_json(&second).await;
    assert!(handshake.get("streamToken").is_none());
    assert_eq!(h.store.pending_write_count(), 1);
    assert!(h.syncer.failed_batch_ids().is_empty());
}

// S5 — credential rotation restarts both streams and refills the pipeline.
#[tokio::test]
async fn credential_change_restarts_streams_and_preserves_listens() {
    let h = harness();
    h.local_store
        .enqueue_batch(vec![delete_mutation("rooms/b1")])
        .await
        .unwrap();
    h.local_store
        .enqueue_batch(vec![delete_mutation("rooms/b2")])
        .await
        .unwrap();

    h.store.enable_network().await.unwrap();
    h.store.listen(listen_target(4)).await.unwrap();
    h.store.listen(listen_target(5)).await.unwrap();

    // Sort the two freshly opened streams by kind.
    let first = h.server.accept().await.unwrap();
    let second = h.server.accept().await.unwrap();
    let (watch, write) = if first.kind() == StreamKind::Watch {
        (first, second)
    } else {
        (second, first)
    };
    complete_handshake(&write, b"t1", 2).await;
    let _ = request_json(&watch).await;
    let _ = request_json(&watch).await;
    send_json(&watch, &target_change("ADD", &[4, 5])).await;
    spin_until(|| h.store.online_state() == OnlineState::Online).await;

    h.store.handle_credential_change().await.unwrap();

    assert_eq!(*h.syncer.credential_changes.lock().unwrap(), 1);
    // Old streams are gone.
    assert!(watch.next_request().await.is_none());
    assert!(write.next_request().await.is_none());

    // Registry survived; the pipeline refilled from the local store.
    assert!(h.store.listen_target(4).is_some());
    assert!(h.store.listen_target(5).is_some());
    assert_eq!(h.store.pending_write_count(), 2);

    // Both streams reconnect: the watch stream re-sends both listens in
    // target-id order, the write stream re-handshakes.
    let first = h.server.accept().await.unwrap();
    let second = h.server.accept().await.unwrap();
    let (watch, write) = if first.kind() == StreamKind::Watch {
        (first, second)
    } else {
        (second, first)
    };
    let relisten_a = request_json(&watch).await;
    let relisten_b = request_json(&watch).await;
    assert_eq!(relisten_a.pointer("/addTarget/targetId"), Some(&json!(4)));
    assert_eq!(relisten_b.pointer("/addTarget/targetId"), Some(&json!(5)));
    complete_handshake(&write, b"t2", 2).await;

    assert!(h
        .syncer
        .online_states()
        .contains(&OnlineState::Unknown));
}

// S6 — shutdown with pending writes reports Unknown and stops everything.
#[tokio::test]
async fn shutdown_with_pending_writes_goes_quiet() {
    let h = harness();
    h.local_store
        .enqueue_batch(vec![delete_mutation("rooms/b1")])
        .await
        .unwrap();

    h.store.enable_network().await.unwrap();
    let write = h.server.accept().await.unwrap();
    complete_handshake(&write, b"t1", 1).await;

    h.store.shutdown().await.unwrap();

    assert_eq!(h.store.online_state(), OnlineState::Unknown);
    assert_eq!(h.store.pending_write_count(), 0);
    assert!(!h.store.is_watch_stream_started());
    assert!(!h.store.is_write_stream_started());
    // Batches remain durable locally.
    assert_eq!(h.local_store.queued_batch_ids().await, vec![1]);
    // The datastore is gone; no further streams are accepted.
    assert!(write.next_request().await.is_none());
    assert!(h.server.accept().await.is_none());
}

// Round trip: enable → disable → enable re-sends the same listens.
#[tokio::test]
async fn network_round_trip_resends_listens() {
    let h = harness();
    h.store.enable_network().await.unwrap();
    h.store.listen(listen_target(2)).await.unwrap();

    let watch = h.server.accept().await.unwrap();
    let request = request_json(&watch).await;
    assert_eq!(request.pointer("/addTarget/targetId"), Some(&json!(2)));
    send_json(&watch, &target_change("ADD", &[2])).await;
    spin_until(|| h.store.online_state() == OnlineState::Online).await;

    h.store.disable_network().await.unwrap();
    assert_eq!(h.store.online_state(), OnlineState::Offline);
    assert!(!h.store.is_watch_stream_started());

    h.store.enable_network().await.unwrap();
    let watch = h.server.accept().await.unwrap();
    let request = request_json(&watch).await;
    assert_eq!(request.pointer("/addTarget/targetId"), Some(&json!(2)));

    assert_eq!(
        h.syncer.online_states(),
        vec![
            OnlineState::Online,
            OnlineState::Unknown,
            OnlineState::Offline,
        ]
    );
}

// Target errors drop the registry entry and surface a rejection.
#[tokio::test]
async fn server_side_target_error_rejects_the_listen() {
    let h = harness();
    h.store.enable_network().await.unwrap();
    h.store.listen(listen_target(2)).await.unwrap();

    let watch = h.server.accept().await.unwrap();
    let _ = request_json(&watch).await;

    send_json(
        &watch,
        &json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "permission denied" },
            }
        }),
    )
    .await;

    spin_until(|| !h.syncer.rejected_listens.lock().unwrap().is_empty()).await;
    {
        let rejected = h.syncer.rejected_listens.lock().unwrap();
        assert_eq!(rejected[0].0, 2);
        assert_eq!(rejected[0].1.code_str(), "sync/permission-denied");
    }
    assert!(h.store.listen_target(2).is_none());
}

// Invariant: the pipeline never exceeds MAX_PENDING_WRITES.
#[tokio::test]
async fn pipeline_caps_at_max_pending_writes() {
    let h = harness();
    for index in 0..12 {
        h.local_store
            .enqueue_batch(vec![delete_mutation(&format!("rooms/b{index}"))])
            .await
            .unwrap();
    }

    h.store.enable_network().await.unwrap();
    assert_eq!(h.store.pending_write_count(), 10);

    let write = h.server.accept().await.unwrap();
    complete_handshake(&write, b"t1", 10).await;

    // Acking the head tops the pipeline back up to the cap.
    send_json(&write, &write_ack(b"t2", 10, 1)).await;
    spin_until(|| !h.syncer.successful_batch_ids().is_empty()).await;
    assert_eq!(h.store.pending_write_count(), 10);

    // The eleventh batch goes out without waiting for a new handshake.
    let eleventh = request_json(&write).await;
    assert_eq!(
        eleventh.pointer("/writes/0/delete"),
        Some(&json!(format!("{DATABASE}/documents/rooms/b10")))
    );
}

// Stale snapshots are dropped instead of being delivered out of order.
#[tokio::test]
async fn stale_snapshots_are_not_delivered() {
    let h = harness();
    h.local_store.set_last_remote_snapshot_version(version(9));

    h.store.enable_network().await.unwrap();
    h.store.listen(listen_target(2)).await.unwrap();

    let watch = h.server.accept().await.unwrap();
    let _ = request_json(&watch).await;

    send_json(&watch, &target_change("ADD", &[2])).await;
    send_json(&watch, &document_change("rooms/d", &[2])).await;
    // Older than the local high-water mark; must not be raised.
    send_json(&watch, &snapshot_frame(&[2], b"r-old", 5)).await;
    // At the mark; delivered.
    send_json(&watch, &snapshot_frame(&[2], b"r-new", 9)).await;

    spin_until(|| h.syncer.event_count() > 0).await;
    let events = h.syncer.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].snapshot_version, version(9));
}
