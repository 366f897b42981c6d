use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::model::{SnapshotVersion, TargetId};
use crate::remote::connection::{Connection, StreamKind};
use crate::remote::query_data::QueryData;
use crate::remote::serializer::WireSerializer;
use crate::remote::stream::{FrameHandler, StreamCore, StreamStatus};
use crate::remote::watch_change::WatchChange;

/// Callbacks the remote store implements to drive the watch stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamEvents: Send + Sync + 'static {
    async fn on_watch_stream_open(&self) -> SyncResult<()>;

    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()>;

    async fn on_watch_stream_close(&self, status: StreamStatus);
}

/// Typed façade over the watch half of the connection: encodes listen
/// requests, decodes server frames, and owns the start/stop lifecycle.
pub struct WatchStream {
    core: Arc<StreamCore>,
    serializer: Arc<WireSerializer>,
    handler: Arc<dyn FrameHandler>,
}

impl WatchStream {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        serializer: Arc<WireSerializer>,
        events: Arc<dyn WatchStreamEvents>,
    ) -> Self {
        let handler: Arc<dyn FrameHandler> = Arc::new(WatchFrameHandler {
            serializer: Arc::clone(&serializer),
            events,
        });
        Self {
            core: Arc::new(StreamCore::new("watch", StreamKind::Watch, connection)),
            serializer,
            handler,
        }
    }

    pub fn start(&self) {
        self.core.start(Arc::clone(&self.handler));
    }

    pub async fn stop(&self) {
        self.core.stop(&self.handler).await;
    }

    pub fn is_started(&self) -> bool {
        self.core.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn mark_idle(&self) {
        self.core.mark_idle(&self.handler);
    }

    /// Registers interest in a target on the open stream.
    pub async fn watch_query(&self, target: &QueryData) -> SyncResult<()> {
        let request = self.serializer.encode_watch_request(target)?;
        self.core.send(request).await
    }

    /// Withdraws interest in a target on the open stream.
    pub async fn unwatch_target(&self, target_id: TargetId) -> SyncResult<()> {
        let request = self.serializer.encode_unwatch_request(target_id)?;
        self.core.send(request).await
    }
}

struct WatchFrameHandler {
    serializer: Arc<WireSerializer>,
    events: Arc<dyn WatchStreamEvents>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl FrameHandler for WatchFrameHandler {
    async fn on_open(&self) -> SyncResult<()> {
        self.events.on_watch_stream_open().await
    }

    async fn on_frame(&self, payload: Vec<u8>) -> SyncResult<()> {
        match self.serializer.decode_watch_change(&payload)? {
            Some(change) => {
                let snapshot_version = change.snapshot_version();
                self.events
                    .on_watch_stream_change(change, snapshot_version)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn on_close(&self, status: StreamStatus) {
        self.events.on_watch_stream_close(status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::platform::runtime;
    use crate::remote::connection::loopback::loopback_pair;
    use crate::remote::query_data::{Query, QueryPurpose};
    use crate::remote::watch_change::TargetChangeState;
    use serde_json::{json, Value as JsonValue};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingEvents {
        changes: Mutex<Vec<WatchChange>>,
        closes: Mutex<Vec<StreamStatus>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl WatchStreamEvents for RecordingEvents {
        async fn on_watch_stream_open(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn on_watch_stream_change(
            &self,
            change: WatchChange,
            _snapshot_version: SnapshotVersion,
        ) -> SyncResult<()> {
            self.changes.lock().unwrap().push(change);
            Ok(())
        }

        async fn on_watch_stream_close(&self, status: StreamStatus) {
            self.closes.lock().unwrap().push(status);
        }
    }

    fn serializer() -> Arc<WireSerializer> {
        Arc::new(WireSerializer::new("projects/test/databases/(default)"))
    }

    async fn spin_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn watch_requests_and_frames_cross_the_stream() {
        let (connection, server) = loopback_pair();
        let events = Arc::new(RecordingEvents::default());
        let stream = WatchStream::new(
            connection,
            serializer(),
            Arc::clone(&events) as Arc<dyn WatchStreamEvents>,
        );

        stream.start();
        let accepted = server.accept().await.unwrap();
        spin_until(|| stream.is_open()).await;

        let target = QueryData::new(Query::collection("rooms"), 1, 1, QueryPurpose::Listen);
        stream.watch_query(&target).await.unwrap();

        let request = accepted.next_request().await.unwrap();
        let value: JsonValue = serde_json::from_slice(&request).unwrap();
        assert_eq!(value.pointer("/addTarget/targetId"), Some(&json!(1)));

        let frame = json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [1],
            }
        });
        accepted
            .send_response(serde_json::to_vec(&frame).unwrap())
            .await
            .unwrap();

        spin_until(|| !events.changes.lock().unwrap().is_empty()).await;
        let changes = events.changes.lock().unwrap();
        match &changes[0] {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.state, TargetChangeState::Current);
                assert_eq!(change.target_ids, vec![1]);
            }
            other => panic!("unexpected change: {other:?}"),
        }
        drop(changes);

        stream.stop().await;
        let closes = events.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert!(closes[0].is_ok());
    }

    #[tokio::test]
    async fn undecodable_frames_close_the_stream_with_an_error() {
        let (connection, server) = loopback_pair();
        let events = Arc::new(RecordingEvents::default());
        let stream = WatchStream::new(
            connection,
            serializer(),
            Arc::clone(&events) as Arc<dyn WatchStreamEvents>,
        );

        stream.start();
        let accepted = server.accept().await.unwrap();
        spin_until(|| stream.is_open()).await;

        accepted.send_response(b"not json".to_vec()).await.unwrap();
        spin_until(|| !events.closes.lock().unwrap().is_empty()).await;

        let closes = events.closes.lock().unwrap();
        let error: &SyncError = closes[0].as_ref().unwrap_err();
        assert_eq!(error.code_str(), "sync/internal");
    }
}
