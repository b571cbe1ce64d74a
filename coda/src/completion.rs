//! Completion queues: the delivery point for batch completions and server
//! request-call events.
//!
//! Producers are internal tasks; consumers are application threads blocking
//! in [`CompletionQueue::next`]. Events are FIFO per producer. Shutdown is
//! one-way: once requested, `next` keeps returning queued events until the
//! queue is empty and every outstanding event source (accepted batch or
//! pending request-call) has delivered, then returns [`Next::Shutdown`]
//! forever.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::trace;

/// An application-chosen opaque value identifying a batch or request-call.
///
/// The queue stores tags verbatim and hands the same value back; the core
/// never interprets them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag(pub u64);

/// The result of [`CompletionQueue::next`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Next {
    /// An event became available before the deadline.
    Event { tag: Tag, ok: bool },
    /// The deadline expired with no event available.
    Timeout,
    /// The queue has shut down and drained; no further events will ever be
    /// delivered.
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    /// Accepts batch completions only.
    ConsumerDrained,
    /// Additionally accepts server request-call events.
    ServerRequestBearing,
}

struct State {
    events: VecDeque<(Tag, bool)>,
    /// Event sources (accepted batches, pending request-call tags) that have
    /// not yet delivered their event.
    outstanding: usize,
    shutdown: bool,
}

struct Shared {
    kind: Kind,
    state: Mutex<State>,
    cond: Condvar,
}

/// An ordered sink for `(tag, ok)` completion events.
#[derive(Clone)]
pub struct CompletionQueue {
    shared: Arc<Shared>,
}

impl CompletionQueue {
    /// Creates a consumer-drained queue, the mode used for client batches.
    pub fn new() -> Self {
        Self::with_kind(Kind::ConsumerDrained)
    }

    /// Creates a queue that additionally accepts server request-call tags.
    pub fn for_server() -> Self {
        Self::with_kind(Kind::ServerRequestBearing)
    }

    fn with_kind(kind: Kind) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                state: Mutex::new(State {
                    events: VecDeque::new(),
                    outstanding: 0,
                    shutdown: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn accepts_request_calls(&self) -> bool {
        self.shared.kind == Kind::ServerRequestBearing
    }

    /// Whether `other` is a clone of this queue.
    pub(crate) fn same_queue(&self, other: &CompletionQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Blocks for the next event, up to `deadline`.
    ///
    /// Safe to call from any number of threads concurrently; each event is
    /// delivered to exactly one caller.
    pub fn next(&self, deadline: Instant) -> Next {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some((tag, ok)) = state.events.pop_front() {
                return Next::Event { tag, ok };
            }
            if state.shutdown && state.outstanding == 0 {
                return Next::Shutdown;
            }
            let now = Instant::now();
            if now >= deadline {
                return Next::Timeout;
            }
            let (guard, timeout) = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if timeout.timed_out() && state.events.is_empty() {
                if state.shutdown && state.outstanding == 0 {
                    return Next::Shutdown;
                }
                return Next::Timeout;
            }
        }
    }

    /// Requests shutdown. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.cond.notify_all();
    }

    /// Registers a new event source. Each registration must eventually be
    /// resolved by exactly one [`enqueue`](Self::enqueue) or
    /// [`abandon_source`](Self::abandon_source) call.
    pub(crate) fn register_source(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.outstanding += 1;
    }

    /// Delivers an event for a previously registered source.
    pub(crate) fn enqueue(&self, tag: Tag, ok: bool) {
        let mut state = self.shared.state.lock().unwrap();
        debug_assert!(state.outstanding > 0, "enqueue without registered source");
        state.outstanding = state.outstanding.saturating_sub(1);
        state.events.push_back((tag, ok));
        trace!(tag = tag.0, ok, "completion enqueued");
        self.shared.cond.notify_one();
    }

    /// Releases a registered source without delivering an event. Used when a
    /// source is torn down before it could ever produce one.
    pub(crate) fn abandon_source(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.outstanding = state.outstanding.saturating_sub(1);
        self.shared.cond.notify_all();
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("CompletionQueue")
            .field("queued", &state.events.len())
            .field("outstanding", &state.outstanding)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn event_then_timeout() {
        let cq = CompletionQueue::new();
        cq.register_source();
        cq.enqueue(Tag(7), true);
        assert_eq!(
            cq.next(soon()),
            Next::Event {
                tag: Tag(7),
                ok: true
            }
        );
        assert_eq!(cq.next(soon()), Next::Timeout);
    }

    #[test]
    fn shutdown_waits_for_outstanding_sources() {
        let cq = CompletionQueue::new();
        cq.register_source();
        cq.shutdown();
        // Source is still outstanding: not yet Shutdown.
        assert_eq!(cq.next(soon()), Next::Timeout);
        cq.enqueue(Tag(1), false);
        assert_eq!(
            cq.next(soon()),
            Next::Event {
                tag: Tag(1),
                ok: false
            }
        );
        assert_eq!(cq.next(soon()), Next::Shutdown);
        // Shutdown is sticky.
        assert_eq!(cq.next(soon()), Next::Shutdown);
    }

    #[test]
    fn shutdown_with_empty_queue() {
        let cq = CompletionQueue::new();
        cq.shutdown();
        assert_eq!(cq.next(soon()), Next::Shutdown);
    }

    #[test]
    fn abandoned_source_releases_shutdown() {
        let cq = CompletionQueue::new();
        cq.register_source();
        cq.shutdown();
        cq.abandon_source();
        assert_eq!(cq.next(soon()), Next::Shutdown);
    }

    #[test]
    fn events_fifo_per_producer() {
        let cq = CompletionQueue::new();
        for i in 0..5 {
            cq.register_source();
            cq.enqueue(Tag(i), true);
        }
        for i in 0..5 {
            assert_eq!(
                cq.next(soon()),
                Next::Event {
                    tag: Tag(i),
                    ok: true
                }
            );
        }
    }

    #[test]
    fn cross_thread_wakeup() {
        let cq = CompletionQueue::new();
        cq.register_source();
        let cq2 = cq.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cq2.enqueue(Tag(9), true);
        });
        let got = cq.next(Instant::now() + Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(
            got,
            Next::Event {
                tag: Tag(9),
                ok: true
            }
        );
    }
}
