//! An abstraction over the asynchronous runtime.
//!
//! The rest of the crate obtains timers and task spawning exclusively through
//! this module, which keeps the core testable and the runtime pluggable. The
//! default implementation is tokio.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod tokio_rt;

pub(crate) use tokio_rt::default_runtime;

/// A cheaply-cloneable handle to the runtime implementation.
pub(crate) type SharedRuntime = Arc<dyn Runtime>;

/// The core functionality required from an async runtime: spawning background
/// tasks and time-based operations.
pub(crate) trait Runtime: Send + Sync {
    /// Spawns the given task to run in the background.
    fn spawn(
        &self,
        task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn TaskHandle>;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;

    /// The current monotonic time.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A future that resolves after a specified duration.
pub(crate) trait Sleep: Send + Sync + Future<Output = ()> {}

/// Handle to a spawned task, used to abort it when its owner goes away.
pub(crate) trait TaskHandle: Send + Sync {
    /// Abort the associated task.
    fn abort(&self);
}

pub(crate) type BoxedTaskHandle = Box<dyn TaskHandle>;

/// Convenience: sleep until an absolute instant, completing immediately if it
/// has already passed.
pub(crate) fn sleep_until(
    runtime: &SharedRuntime,
    deadline: Instant,
) -> Pin<Box<dyn Sleep>> {
    runtime.sleep(deadline.saturating_duration_since(runtime.now()))
}
