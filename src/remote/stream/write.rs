use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::model::SnapshotVersion;
use crate::remote::connection::{Connection, StreamKind};
use crate::remote::mutation::{Mutation, MutationResult};
use crate::remote::serializer::WireSerializer;
use crate::remote::stream::{FrameHandler, StreamCore, StreamStatus};

/// Callbacks the remote store implements to drive the write stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamEvents: Send + Sync + 'static {
    async fn on_write_stream_open(&self) -> SyncResult<()>;

    /// The handshake response arrived; mutations may be written from now on.
    async fn on_write_handshake_complete(&self) -> SyncResult<()>;

    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()>;

    async fn on_write_stream_close(&self, status: StreamStatus);
}

/// Typed façade over the write half of the connection.
///
/// Tracks the session handshake and caches the stream token the backend
/// refreshes with every response. The handshake flag survives an interruption
/// until the next open, so close handlers can still classify the failure.
pub struct WriteStream {
    core: Arc<StreamCore>,
    serializer: Arc<WireSerializer>,
    shared: Arc<WriteShared>,
    handler: Arc<dyn FrameHandler>,
}

struct WriteShared {
    state: Mutex<WriteState>,
}

struct WriteState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl WriteStream {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        serializer: Arc<WireSerializer>,
        events: Arc<dyn WriteStreamEvents>,
    ) -> Self {
        let shared = Arc::new(WriteShared {
            state: Mutex::new(WriteState {
                handshake_complete: false,
                last_stream_token: Vec::new(),
            }),
        });
        let handler: Arc<dyn FrameHandler> = Arc::new(WriteFrameHandler {
            serializer: Arc::clone(&serializer),
            shared: Arc::clone(&shared),
            events,
        });
        Self {
            core: Arc::new(StreamCore::new("write", StreamKind::Write, connection)),
            serializer,
            shared,
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

    pub fn inhibit_backoff(&self) {
        self.core.inhibit_backoff();
    }

    pub fn handshake_complete(&self) -> bool {
        self.shared.state.lock().unwrap().handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.shared.state.lock().unwrap().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        self.shared.state.lock().unwrap().last_stream_token = token;
    }

    /// Opens the session, presenting the persisted stream token (if any) so
    /// the backend can resume it.
    pub async fn write_handshake(&self) -> SyncResult<()> {
        assert!(self.is_open(), "handshake requires an open write stream");
        assert!(
            !self.handshake_complete(),
            "handshake already completed on this stream"
        );
        let token = self.last_stream_token();
        let request = self.serializer.encode_write_handshake(&token)?;
        self.core.send(request).await
    }

    /// Sends one mutation batch under the current session token.
    pub async fn write_mutations(&self, mutations: &[Mutation]) -> SyncResult<()> {
        assert!(self.is_open(), "mutations require an open write stream");
        assert!(
            self.handshake_complete(),
            "mutations sent before the handshake completed"
        );
        let token = self.last_stream_token();
        let request = self.serializer.encode_write_request(&token, mutations)?;
        self.core.send(request).await
    }
}

struct WriteFrameHandler {
    serializer: Arc<WireSerializer>,
    shared: Arc<WriteShared>,
    events: Arc<dyn WriteStreamEvents>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl FrameHandler for WriteFrameHandler {
    async fn on_open(&self) -> SyncResult<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.handshake_complete = false;
        }
        self.events.on_write_stream_open().await
    }

    async fn on_frame(&self, payload: Vec<u8>) -> SyncResult<()> {
        let response = self.serializer.decode_write_response(&payload)?;
        let is_handshake_ack = {
            let mut state = self.shared.state.lock().unwrap();
            state.last_stream_token = response.stream_token;
            if state.handshake_complete {
                false
            } else {
                state.handshake_complete = true;
                true
            }
        };

        if is_handshake_ack {
            self.events.on_write_handshake_complete().await
        } else {
            self.events
                .on_write_response(response.commit_version, response.results)
                .await
        }
    }

    async fn on_close(&self, status: StreamStatus) {
        self.events.on_write_stream_close(status).await;
    }
}
