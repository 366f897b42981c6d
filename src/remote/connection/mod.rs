pub mod loopback;

pub use loopback::{loopback_pair, LoopbackConnection, LoopbackServer, ServerStream};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncResult;

/// Which duplex stream a caller is opening.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Watch,
    Write,
}

/// Unary RPC surface used outside the streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryMethod {
    Lookup,
    Commit,
}

/// Transport the datastore runs over. Implementations own their I/O tasks;
/// the frames they deliver are consumed by a single reader per stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(&self, kind: StreamKind) -> SyncResult<Arc<dyn WireStream>>;

    async fn invoke(&self, method: UnaryMethod, request: Vec<u8>) -> SyncResult<Vec<u8>>;

    /// Tears the connection down; subsequent opens and invokes fail.
    fn shutdown(&self);
}

/// One duplex byte stream. `next` returns `None` once the stream is closed
/// from either side; a terminal error is delivered before the `None`.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WireStream: Send + Sync + std::fmt::Debug + 'static {
    async fn send(&self, payload: Vec<u8>) -> SyncResult<()>;

    async fn next(&self) -> Option<SyncResult<Vec<u8>>>;

    async fn close(&self);
}
