use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::SyncError;
use crate::platform::runtime::DelayedOperation;
use crate::remote::remote_syncer::RemoteSyncer;

/// Observable connectivity derived from watch-stream health.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// Initial state, or network paused; no claim either way.
    Unknown,
    /// A frame arrived from the backend.
    Online,
    /// Enough consecutive failures to give up optimism.
    Offline,
}

/// Consecutive watch-stream failures tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a freshly started watch stream may stay silent before the client
/// is reported offline.
const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sole authority over the externally visible [`OnlineState`].
///
/// Stream code reports events; it never writes the state directly.
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    syncer: Arc<dyn RemoteSyncer>,
    timeout: Duration,
    state: Mutex<TrackerState>,
}

struct TrackerState {
    online_state: OnlineState,
    failure_count: u32,
    timer: Option<DelayedOperation>,
    should_warn_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(syncer: Arc<dyn RemoteSyncer>) -> Self {
        Self::with_timeout(syncer, ONLINE_STATE_TIMEOUT)
    }

    fn with_timeout(syncer: Arc<dyn RemoteSyncer>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                syncer,
                timeout,
                state: Mutex::new(TrackerState {
                    online_state: OnlineState::Unknown,
                    failure_count: 0,
                    timer: None,
                    should_warn_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.inner.state.lock().unwrap().online_state
    }

    /// Called when the watch stream (re)starts. Resets the failure counter and
    /// arms the debounce timer: if the stream is still silent when it fires,
    /// the client is reported offline.
    pub fn handle_watch_stream_start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.failure_count = 0;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        let weak = Arc::downgrade(&self.inner);
        state.timer = Some(DelayedOperation::schedule(
            self.inner.timeout,
            move || async move {
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.handle_timeout().await;
                }
            },
        ));
    }

    /// Called on every watch-stream interruption. An interruption while
    /// `Online` merely drops back to `Unknown`; repeated failures while not
    /// online trip the `Offline` threshold.
    pub async fn handle_watch_stream_failure(&self, error: &SyncError) {
        enum Action {
            ToUnknown,
            ToOffline { warn: bool },
            Nothing,
        }

        let action = {
            let mut state = self.inner.state.lock().unwrap();
            if state.online_state == OnlineState::Online {
                state.failure_count = 0;
                Action::ToUnknown
            } else {
                state.failure_count += 1;
                if state.failure_count >= MAX_WATCH_STREAM_FAILURES {
                    if let Some(timer) = state.timer.take() {
                        timer.cancel();
                    }
                    let warn = state.should_warn_offline;
                    state.should_warn_offline = false;
                    Action::ToOffline { warn }
                } else {
                    Action::Nothing
                }
            }
        };

        match action {
            Action::ToUnknown => {
                self.inner.set_and_broadcast(OnlineState::Unknown).await;
            }
            Action::ToOffline { warn } => {
                if warn {
                    log::warn!("could not reach the backend, operating in offline mode: {error}");
                } else {
                    log::debug!("backend still unreachable: {error}");
                }
                self.inner.set_and_broadcast(OnlineState::Offline).await;
            }
            Action::Nothing => {}
        }
    }

    /// Explicit state assignment from the coordinator (enable/disable/shutdown
    /// paths, or `Online` on the first received frame). Clears the failure
    /// counter and the debounce timer.
    pub async fn update_state(&self, new_state: OnlineState) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.failure_count = 0;
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            if new_state == OnlineState::Online {
                state.should_warn_offline = false;
            }
        }
        self.inner.set_and_broadcast(new_state).await;
    }
}

impl TrackerInner {
    async fn handle_timeout(self: Arc<Self>) {
        let warn = {
            let mut state = self.state.lock().unwrap();
            if state.online_state != OnlineState::Unknown {
                return;
            }
            state.timer = None;
            let warn = state.should_warn_offline;
            state.should_warn_offline = false;
            warn
        };
        if warn {
            log::warn!("backend did not respond within 10 seconds, operating in offline mode");
        } else {
            log::debug!("backend still silent after stream start");
        }
        self.set_and_broadcast(OnlineState::Offline).await;
    }

    /// Transitions are announced to the sync engine only on actual change.
    async fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.online_state == new_state {
                false
            } else {
                state.online_state = new_state;
                true
            }
        };
        if changed {
            self.syncer.handle_online_state_change(new_state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{unavailable, SyncResult};
    use crate::model::{BatchId, DocumentKey, TargetId};
    use crate::platform::runtime;
    use crate::remote::mutation::MutationBatchResult;
    use crate::remote::remote_event::RemoteEvent;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct RecordingSyncer {
        states: Mutex<Vec<OnlineState>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl RemoteSyncer for RecordingSyncer {
        async fn apply_remote_event(&self, _event: RemoteEvent) -> SyncResult<()> {
            Ok(())
        }

        async fn reject_listen(&self, _target_id: TargetId, _error: SyncError) -> SyncResult<()> {
            Ok(())
        }

        async fn apply_successful_write(&self, _result: MutationBatchResult) -> SyncResult<()> {
            Ok(())
        }

        async fn reject_failed_write(&self, _batch_id: BatchId, _error: SyncError) -> SyncResult<()> {
            Ok(())
        }

        async fn handle_online_state_change(&self, state: OnlineState) {
            self.states.lock().unwrap().push(state);
        }

        fn remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
            BTreeSet::new()
        }
    }

    #[tokio::test]
    async fn first_failure_reports_offline_once() {
        let syncer = Arc::new(RecordingSyncer::default());
        let tracker = OnlineStateTracker::new(Arc::clone(&syncer) as Arc<dyn RemoteSyncer>);

        tracker.handle_watch_stream_start();
        tracker
            .handle_watch_stream_failure(&unavailable("connection refused"))
            .await;
        assert_eq!(tracker.state(), OnlineState::Offline);

        // Further failures keep the state; no duplicate broadcast.
        tracker
            .handle_watch_stream_failure(&unavailable("connection refused"))
            .await;
        assert_eq!(
            syncer.states.lock().unwrap().as_slice(),
            &[OnlineState::Offline]
        );
    }

    #[tokio::test]
    async fn failure_while_online_drops_to_unknown() {
        let syncer = Arc::new(RecordingSyncer::default());
        let tracker = OnlineStateTracker::new(Arc::clone(&syncer) as Arc<dyn RemoteSyncer>);

        tracker.update_state(OnlineState::Online).await;
        tracker
            .handle_watch_stream_failure(&unavailable("reset"))
            .await;

        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            syncer.states.lock().unwrap().as_slice(),
            &[OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn silent_stream_goes_offline_after_debounce() {
        let syncer = Arc::new(RecordingSyncer::default());
        let tracker = OnlineStateTracker::with_timeout(
            Arc::clone(&syncer) as Arc<dyn RemoteSyncer>,
            Duration::from_millis(20),
        );

        tracker.handle_watch_stream_start();
        for _ in 0..50 {
            if tracker.state() == OnlineState::Offline {
                return;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        panic!("debounce timer never fired");
    }

    #[tokio::test]
    async fn going_online_cancels_the_debounce() {
        let syncer = Arc::new(RecordingSyncer::default());
        let tracker = OnlineStateTracker::with_timeout(
            Arc::clone(&syncer) as Arc<dyn RemoteSyncer>,
            Duration::from_millis(20),
        );

        tracker.handle_watch_stream_start();
        tracker.update_state(OnlineState::Online).await;

        runtime::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.state(), OnlineState::Online);
        assert_eq!(
            syncer.states.lock().unwrap().as_slice(),
            &[OnlineState::Online]
        );
    }
}
