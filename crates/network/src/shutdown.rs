use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Runs a teardown exactly once, making every other caller wait for it.
///
/// The application and the process exit hook may both close a node. Whoever
/// takes the permit first runs the teardown; the other blocks on the permit
/// and returns once the teardown is finished, so an exit can neither skip nor
/// cut short a close already in progress.
///
/// The future returned by [`ShutdownCoordinator::run_once`] must be driven to
/// completion; dropping it mid-teardown leaves the guard set with the
/// teardown unfinished.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    permit: Mutex<()>,
    done: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call performed the teardown.
    pub async fn run_once<F, Fut>(&self, teardown: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let _permit = self.permit.lock().await;
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        teardown().await;
        true
    }

    /// True once a teardown has started.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}
