use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::error::{internal_error, unavailable, SyncError, SyncResult};
use crate::remote::connection::{Connection, StreamKind, UnaryMethod, WireStream};

/// Builds an in-memory connection pair: the client half plugs into a
/// datastore, the server half lets a test (or an embedded backend) accept
/// streams and script responses.
pub fn loopback_pair() -> (Arc<LoopbackConnection>, LoopbackServer) {
    let (accept_tx, accept_rx) = async_channel::unbounded();
    let unary_responses = Arc::new(Mutex::new(VecDeque::new()));
    let unary_requests = Arc::new(Mutex::new(Vec::new()));

    let connection = Arc::new(LoopbackConnection {
        accepts: accept_tx,
        unary_responses: Arc::clone(&unary_responses),
        unary_requests: Arc::clone(&unary_requests),
        shut_down: AtomicBool::new(false),
    });
    let server = LoopbackServer {
        accepts: accept_rx,
        unary_responses,
        unary_requests,
    };
    (connection, server)
}

/// Client half of the loopback pair.
pub struct LoopbackConnection {
    accepts: Sender<ServerStream>,
    unary_responses: Arc<Mutex<VecDeque<SyncResult<Vec<u8>>>>>,
    unary_requests: Arc<Mutex<Vec<(UnaryMethod, Vec<u8>)>>>,
    shut_down: AtomicBool,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for LoopbackConnection {
    async fn open_stream(&self, kind: StreamKind) -> SyncResult<Arc<dyn WireStream>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(unavailable("connection is shut down"));
        }

        let (to_server_tx, to_server_rx) = async_channel::unbounded();
        let (to_client_tx, to_client_rx) = async_channel::unbounded();

        let server_stream = ServerStream {
            kind,
            to_client: to_client_tx,
            from_client: to_server_rx,
        };
        self.accepts
            .send(server_stream)
            .await
            .map_err(|_| unavailable("no peer accepting streams"))?;

        Ok(Arc::new(ClientStream {
            outbound: to_server_tx,
            inbound: to_client_rx,
        }))
    }

    async fn invoke(&self, method: UnaryMethod, request: Vec<u8>) -> SyncResult<Vec<u8>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(unavailable("connection is shut down"));
        }
        self.unary_requests.lock().unwrap().push((method, request));
        self.unary_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(internal_error("no scripted response for unary call")))
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.accepts.close();
    }
}

/// Server half of the loopback pair.
pub struct LoopbackServer {
    accepts: Receiver<ServerStream>,
    unary_responses: Arc<Mutex<VecDeque<SyncResult<Vec<u8>>>>>,
    unary_requests: Arc<Mutex<Vec<(UnaryMethod, Vec<u8>)>>>,
}

impl LoopbackServer {
    /// Waits for the client to open the next stream.
    pub async fn accept(&self) -> Option<ServerStream> {
        self.accepts.recv().await.ok()
    }

    /// Scripts the response for the next unary call.
    pub fn push_unary_response(&self, response: SyncResult<Vec<u8>>) {
        self.unary_responses.lock().unwrap().push_back(response);
    }

    /// Unary requests received so far, in call order.
    pub fn unary_requests(&self) -> Vec<(UnaryMethod, Vec<u8>)> {
        self.unary_requests.lock().unwrap().clone()
    }
}

/// One accepted stream, seen from the server side.
pub struct ServerStream {
    kind: StreamKind,
    to_client: Sender<SyncResult<Vec<u8>>>,
    from_client: Receiver<Vec<u8>>,
}

impl ServerStream {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Next frame the client sent, or `None` once the client closed.
    pub async fn next_request(&self) -> Option<Vec<u8>> {
        self.from_client.recv().await.ok()
    }

    pub async fn send_response(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.to_client
            .send(Ok(payload))
            .await
            .map_err(|_| internal_error("client side of loopback stream is gone"))
    }

    /// Terminates the stream with an error; the client observes the error and
    /// then end-of-stream.
    pub async fn fail(&self, error: SyncError) {
        let _ = self.to_client.send(Err(error)).await;
        self.to_client.close();
    }

    /// Closes the stream from the server side without an error payload.
    pub async fn close(&self) {
        self.to_client.close();
    }
}

#[derive(Debug)]
struct ClientStream {
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<SyncResult<Vec<u8>>>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WireStream for ClientStream {
    async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| unavailable("loopback stream closed"))
    }

    async fn next(&self) -> Option<SyncResult<Vec<u8>>> {
        self.inbound.recv().await.ok()
    }

    async fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}
