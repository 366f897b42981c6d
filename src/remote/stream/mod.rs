pub mod watch;
pub mod write;

pub use watch::{WatchStream, WatchStreamEvents};
pub use write::{WriteStream, WriteStreamEvents};

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{internal_error, unavailable, SyncResult};
use crate::platform::runtime::{self, DelayedOperation};
use crate::remote::connection::{Connection, StreamKind, WireStream};

/// Final status of a stream incarnation. `Ok(())` is a graceful stop.
pub type StreamStatus = SyncResult<()>;

/// Grace period before an idle-marked stream is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const BACKOFF_INITIAL_DELAY_MS: u64 = 1_000;
const BACKOFF_MAX_DELAY_MS: u64 = 60_000;
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_JITTER: f64 = 0.5;

/// Byte-level callbacks the typed stream wrappers plug into the core.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub(crate) trait FrameHandler: Send + Sync + 'static {
    async fn on_open(&self) -> SyncResult<()>;
    async fn on_frame(&self, payload: Vec<u8>) -> SyncResult<()>;
    async fn on_close(&self, status: StreamStatus);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Open,
}

/// Exponential backoff applied between dial attempts. The first attempt is
/// immediate; the counter resets once the server actually talks to us.
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn next_delay(&mut self) -> Duration {
        if self.attempt == 0 {
            self.attempt = 1;
            return Duration::ZERO;
        }
        let base = (BACKOFF_INITIAL_DELAY_MS as f64)
            * BACKOFF_FACTOR.powi(self.attempt.saturating_sub(1) as i32);
        let base = base.min(BACKOFF_MAX_DELAY_MS as f64);
        let jitter = BACKOFF_JITTER * base * rand::thread_rng().gen_range(-1.0..=1.0);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((base + jitter).round().max(0.0) as u64)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Shared Start/Stop/MarkIdle machinery beneath the watch and write streams.
///
/// The core runs one read loop per incarnation; a generation counter orphans
/// loops belonging to stopped incarnations so each incarnation delivers at
/// most one close.
pub(crate) struct StreamCore {
    label: &'static str,
    kind: StreamKind,
    connection: Arc<dyn Connection>,
    state: Mutex<CoreState>,
}

struct CoreState {
    phase: Phase,
    generation: u64,
    raw: Option<Arc<dyn WireStream>>,
    backoff: Backoff,
    idle_timer: Option<DelayedOperation>,
}

impl StreamCore {
    pub(crate) fn new(
        label: &'static str,
        kind: StreamKind,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            label,
            kind,
            connection,
            state: Mutex::new(CoreState {
                phase: Phase::Idle,
                generation: 0,
                raw: None,
                backoff: Backoff::new(),
                idle_timer: None,
            }),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        matches!(
            self.state.lock().unwrap().phase,
            Phase::Starting | Phase::Open
        )
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Open
    }

    pub(crate) fn inhibit_backoff(&self) {
        self.state.lock().unwrap().backoff.reset();
    }

    pub(crate) fn start(self: &Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let (generation, delay) = {
            let mut state = self.state.lock().unwrap();
            assert!(
                state.phase == Phase::Idle,
                "{} stream started while already running",
                self.label
            );
            state.phase = Phase::Starting;
            state.generation += 1;
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            (state.generation, state.backoff.next_delay())
        };

        let core = Arc::clone(self);
        runtime::spawn_detached(async move {
            core.run(generation, delay, handler).await;
        });
    }

    /// Idempotent; delivers exactly one OK close per running incarnation and
    /// none when already stopped.
    pub(crate) async fn stop(&self, handler: &Arc<dyn FrameHandler>) {
        let raw = {
            let mut state = self.state.lock().unwrap();
            if !matches!(state.phase, Phase::Starting | Phase::Open) {
                return;
            }
            state.generation += 1;
            state.phase = Phase::Idle;
            // A clean stop clears any accumulated backoff; the next start
            // dials immediately.
            state.backoff.reset();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.raw.take()
        };
        if let Some(raw) = raw {
            raw.close().await;
        }
        handler.on_close(Ok(())).await;
    }

    /// Schedules the stream to close (with an OK status) unless traffic
    /// resumes within the idle grace period.
    pub(crate) fn mark_idle(self: &Arc<Self>, handler: &Arc<dyn FrameHandler>) {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Open || state.idle_timer.is_some() {
            return;
        }
        let core = Arc::downgrade(self);
        let handler = Arc::clone(handler);
        state.idle_timer = Some(DelayedOperation::schedule(IDLE_TIMEOUT, move || async move {
            if let Some(core) = Weak::upgrade(&core) {
                log::debug!("{} stream idle, closing", core.label);
                core.stop(&handler).await;
            }
        }));
    }

    pub(crate) async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        let raw = {
            let mut state = self.state.lock().unwrap();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.raw.clone()
        };
        let raw =
            raw.ok_or_else(|| internal_error(format!("{} stream is not open", self.label)))?;
        raw.send(payload).await
    }

    async fn run(self: Arc<Self>, generation: u64, delay: Duration, handler: Arc<dyn FrameHandler>) {
        if !delay.is_zero() {
            log::debug!("{} stream backing off for {delay:?}", self.label);
            runtime::sleep(delay).await;
        }
        if self.is_stale(generation) {
            return;
        }

        let raw = match self.connection.open_stream(self.kind).await {
            Ok(raw) => raw,
            Err(err) => {
                self.finish(generation, Err(err), &handler).await;
                return;
            }
        };

        let stale = {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                true
            } else {
                state.phase = Phase::Open;
                state.raw = Some(Arc::clone(&raw));
                false
            }
        };
        if stale {
            raw.close().await;
            return;
        }

        if let Err(err) = handler.on_open().await {
            raw.close().await;
            self.finish(generation, Err(err), &handler).await;
            return;
        }

        loop {
            match raw.next().await {
                Some(Ok(payload)) => {
                    if self.is_stale(generation) {
                        return;
                    }
                    // The server is talking; future restarts dial immediately.
                    self.state.lock().unwrap().backoff.reset();
                    if let Err(err) = handler.on_frame(payload).await {
                        raw.close().await;
                        self.finish(generation, Err(err), &handler).await;
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.finish(generation, Err(err), &handler).await;
                    return;
                }
                None => {
                    let err = unavailable(format!("{} stream closed by server", self.label));
                    self.finish(generation, Err(err), &handler).await;
                    return;
                }
            }
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.state.lock().unwrap().generation != generation
    }

    async fn finish(
        &self,
        generation: u64,
        status: StreamStatus,
        handler: &Arc<dyn FrameHandler>,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                // stop() superseded this incarnation and already closed it.
                return;
            }
            state.phase = Phase::Idle;
            state.raw = None;
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
        }
        if let Err(err) = &status {
            log::debug!("{} stream interrupted: {err}", self.label);
        }
        handler.on_close(status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::connection::loopback::loopback_pair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        opens: AtomicUsize,
        frames: Mutex<Vec<Vec<u8>>>,
        closes: Mutex<Vec<StreamStatus>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl FrameHandler for CountingHandler {
        async fn on_open(&self) -> SyncResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_frame(&self, payload: Vec<u8>) -> SyncResult<()> {
            self.frames.lock().unwrap().push(payload);
            Ok(())
        }

        async fn on_close(&self, status: StreamStatus) {
            self.closes.lock().unwrap().push(status);
        }
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
    async fn delivers_frames_and_single_ok_close_on_stop() {
        let (connection, server) = loopback_pair();
        let core = Arc::new(StreamCore::new("test", StreamKind::Watch, connection));
        let handler: Arc<CountingHandler> = Arc::new(CountingHandler::default());
        let dyn_handler: Arc<dyn FrameHandler> = Arc::clone(&handler) as _;

        core.start(Arc::clone(&dyn_handler));
        let accepted = server.accept().await.unwrap();
        spin_until(|| core.is_open()).await;
        assert!(core.is_started());

        accepted.send_response(b"frame".to_vec()).await.unwrap();
        spin_until(|| !handler.frames.lock().unwrap().is_empty()).await;

        core.stop(&dyn_handler).await;
        assert!(!core.is_started());
        {
            let closes = handler.closes.lock().unwrap();
            assert_eq!(closes.len(), 1);
            assert!(closes[0].is_ok());
        }

        // A second stop is a no-op.
        core.stop(&dyn_handler).await;
        assert_eq!(handler.closes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn server_error_surfaces_as_err_close() {
        let (connection, server) = loopback_pair();
        let core = Arc::new(StreamCore::new("test", StreamKind::Watch, connection));
        let handler: Arc<CountingHandler> = Arc::new(CountingHandler::default());
        let dyn_handler: Arc<dyn FrameHandler> = Arc::clone(&handler) as _;

        core.start(dyn_handler);
        let accepted = server.accept().await.unwrap();
        spin_until(|| core.is_open()).await;

        accepted.fail(unavailable("gone")).await;
        spin_until(|| !handler.closes.lock().unwrap().is_empty()).await;

        assert!(!core.is_started());
        let closes = handler.closes.lock().unwrap();
        assert_eq!(
            closes[0].as_ref().unwrap_err().code_str(),
            "sync/unavailable"
        );
    }

    #[tokio::test]
    async fn restart_is_allowed_after_close() {
        let (connection, server) = loopback_pair();
        let core = Arc::new(StreamCore::new("test", StreamKind::Write, connection));
        let handler: Arc<CountingHandler> = Arc::new(CountingHandler::default());
        let dyn_handler: Arc<dyn FrameHandler> = Arc::clone(&handler) as _;

        core.start(Arc::clone(&dyn_handler));
        let first = server.accept().await.unwrap();
        spin_until(|| core.is_open()).await;
        first.fail(unavailable("gone")).await;
        spin_until(|| !core.is_started()).await;

        core.inhibit_backoff();
        core.start(dyn_handler);
        let _second = server.accept().await.unwrap();
        spin_until(|| core.is_open()).await;
        assert_eq!(handler.opens.load(Ordering::SeqCst), 2);
    }
}
