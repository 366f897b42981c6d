use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Platform-independent helper to spawn an async task that runs in the background.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Platform-independent helper to spawn an async task that runs in the background.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static FALLBACK_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build fallback tokio runtime")
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else {
        let _ = FALLBACK_RUNTIME.spawn(future);
    }
}

/// Asynchronously waits for the provided duration in a platform-compatible way.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    use gloo_timers::future::sleep;
    sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    use tokio::time::sleep;
    sleep(duration).await;
}

/// One-shot task scheduled to run after a delay.
///
/// `cancel` is safe to call after the task has already fired; the handle only
/// flips a flag the pending task checks before running.
pub struct DelayedOperation {
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn schedule<F, Fut>(delay: Duration, task: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        spawn_detached(async move {
            sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task().await;
            }
        });
        Self { cancelled }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn delayed_operation_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _op = DelayedOperation::schedule(Duration::from_millis(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..50 {
            if fired.load(Ordering::SeqCst) == 1 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("delayed operation never fired");
    }

    #[tokio::test]
    async fn cancelled_operation_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let op = DelayedOperation::schedule(Duration::from_millis(20), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        op.cancel();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Cancelling again after the deadline passed is a no-op.
        op.cancel();
    }
}
