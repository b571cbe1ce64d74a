use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::{Runtime, SharedRuntime, Sleep, TaskHandle};

#[derive(Default)]
pub(crate) struct TokioRuntime;

struct TokioTaskHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl TaskHandle for TokioTaskHandle {
    fn abort(&self) {
        self.handle.abort();
    }
}

struct TokioSleep {
    inner: Pin<Box<tokio::time::Sleep>>,
}

impl Future for TokioSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl Sleep for TokioSleep {}

impl Runtime for TokioRuntime {
    fn spawn(
        &self,
        task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn TaskHandle> {
        Box::new(TokioTaskHandle {
            handle: tokio::task::spawn(task),
        })
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(TokioSleep {
            inner: Box::pin(tokio::time::sleep(duration)),
        })
    }
}

/// Returns the default (tokio) runtime handle.
pub(crate) fn default_runtime() -> SharedRuntime {
    Arc::new(TokioRuntime)
}
