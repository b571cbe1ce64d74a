//! The call engine.
//!
//! A [`Call`] binds one transport stream to a sequence of operation batches
//! submitted by the application. Each accepted batch yields exactly one
//! `(tag, ok)` completion event on the call's completion queue; `ok` is true
//! iff every op in the batch completed per its own contract.
//!
//! Outbound ops are funneled through a single per-call sender in submission
//! order and inbound ops through a single receiver, which is what upholds
//! the per-call ordering guarantees. Cancellation (explicit, deadline, or
//! channel shutdown) promptly fails every pending batch with `ok=false` and
//! resets the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

use crate::completion::{CompletionQueue, Tag};
use crate::metadata::Metadata;
use crate::rt::{sleep_until, BoxedTaskHandle, SharedRuntime};
use crate::Status;

pub(crate) mod driver;

/// The default cap on received message sizes.
pub const DEFAULT_MAX_RECV_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
/// The default cap on sent message sizes (unlimited).
pub const DEFAULT_MAX_SEND_MESSAGE_SIZE: usize = usize::MAX;
/// The default per-call byte budget for the retry replay buffer.
pub const DEFAULT_RETRY_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Side {
    Client,
    Server,
}

/// The six op kinds (plus the two directional closing variants) a batch may
/// carry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum OpKind {
    SendInitialMetadata,
    SendMessage,
    SendClose,
    SendStatus,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatus,
    RecvClose,
}

impl OpKind {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Kinds that may appear at most once across a call's lifetime.
    fn at_most_once(self) -> bool {
        !matches!(self, OpKind::SendMessage | OpKind::RecvMessage)
    }

    fn valid_on(self, side: Side) -> bool {
        match self {
            OpKind::SendInitialMetadata | OpKind::SendMessage | OpKind::RecvMessage => true,
            OpKind::SendClose | OpKind::RecvInitialMetadata | OpKind::RecvStatus => {
                side == Side::Client
            }
            OpKind::SendStatus | OpKind::RecvClose => side == Side::Server,
        }
    }

    fn name(self) -> &'static str {
        match self {
            OpKind::SendInitialMetadata => "send_initial_metadata",
            OpKind::SendMessage => "send_message",
            OpKind::SendClose => "send_close",
            OpKind::SendStatus => "send_status",
            OpKind::RecvInitialMetadata => "recv_initial_metadata",
            OpKind::RecvMessage => "recv_message",
            OpKind::RecvStatus => "recv_status",
            OpKind::RecvClose => "recv_close",
        }
    }
}

// ===== slots =====

/// Receives the peer's initial metadata once the corresponding op completes.
#[derive(Clone, Default)]
pub struct MetadataSlot(Arc<Mutex<Option<Metadata>>>);

impl MetadataSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<Metadata> {
        self.0.lock().unwrap().take()
    }

    fn set(&self, value: Metadata) {
        *self.0.lock().unwrap() = Some(value);
    }
}

/// Receives one inbound message. Left unset when the op completed past
/// end-of-stream (the batch then completes with `ok=false`).
#[derive(Clone, Default)]
pub struct MessageSlot(Arc<Mutex<Option<Bytes>>>);

impl MessageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<Bytes> {
        self.0.lock().unwrap().take()
    }

    fn set(&self, value: Option<Bytes>) {
        *self.0.lock().unwrap() = value;
    }
}

/// Receives the final status and trailing metadata of a call.
#[derive(Clone, Default)]
pub struct StatusSlot(Arc<Mutex<Option<(Status, Metadata)>>>);

impl StatusSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<(Status, Metadata)> {
        self.0.lock().unwrap().take()
    }

    fn set(&self, value: (Status, Metadata)) {
        *self.0.lock().unwrap() = Some(value);
    }
}

/// Receives the server-side close notification: whether the call was
/// cancelled (by the client, a deadline, or shutdown) rather than completed
/// by this server's own status.
#[derive(Clone, Default)]
pub struct CloseSlot(Arc<Mutex<Option<bool>>>);

impl CloseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelled(&self) -> Option<bool> {
        *self.0.lock().unwrap()
    }

    fn set(&self, cancelled: bool) {
        *self.0.lock().unwrap() = Some(cancelled);
    }
}

// ===== batch =====

enum Op {
    SendInitialMetadata(Metadata),
    SendMessage(Bytes),
    SendClose,
    SendStatus(Status, Metadata),
    RecvInitialMetadata(MetadataSlot),
    RecvMessage(MessageSlot),
    RecvStatus(StatusSlot),
    RecvClose(CloseSlot),
}

impl Op {
    fn kind(&self) -> OpKind {
        match self {
            Op::SendInitialMetadata(_) => OpKind::SendInitialMetadata,
            Op::SendMessage(_) => OpKind::SendMessage,
            Op::SendClose => OpKind::SendClose,
            Op::SendStatus(..) => OpKind::SendStatus,
            Op::RecvInitialMetadata(_) => OpKind::RecvInitialMetadata,
            Op::RecvMessage(_) => OpKind::RecvMessage,
            Op::RecvStatus(_) => OpKind::RecvStatus,
            Op::RecvClose(_) => OpKind::RecvClose,
        }
    }
}

/// An ordered group of ops submitted to a call as a unit.
#[derive(Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends the leading header block. At most once per call; required before
    /// any `send_message`.
    pub fn send_initial_metadata(mut self, metadata: Metadata) -> Self {
        self.ops.push(Op::SendInitialMetadata(metadata));
        self
    }

    /// Sends one message on the stream.
    pub fn send_message(mut self, message: impl Into<Bytes>) -> Self {
        self.ops.push(Op::SendMessage(message.into()));
        self
    }

    /// Half-closes the outbound direction (client only).
    pub fn send_close(mut self) -> Self {
        self.ops.push(Op::SendClose);
        self
    }

    /// Sends the trailers and closes the outbound direction (server only).
    pub fn send_status(mut self, status: Status, trailers: Metadata) -> Self {
        self.ops.push(Op::SendStatus(status, trailers));
        self
    }

    /// Completes when the peer's header block arrives (client only).
    pub fn recv_initial_metadata(mut self, slot: MetadataSlot) -> Self {
        self.ops.push(Op::RecvInitialMetadata(slot));
        self
    }

    /// Receives one message; the op completes `ok=false` past end-of-stream.
    pub fn recv_message(mut self, slot: MessageSlot) -> Self {
        self.ops.push(Op::RecvMessage(slot));
        self
    }

    /// Completes when the call reaches its final status (client only).
    pub fn recv_status(mut self, slot: StatusSlot) -> Self {
        self.ops.push(Op::RecvStatus(slot));
        self
    }

    /// Completes when the call finishes, reporting whether it was cancelled
    /// (server only).
    pub fn recv_close(mut self, slot: CloseSlot) -> Self {
        self.ops.push(Op::RecvClose(slot));
        self
    }
}

/// A batch that could not be started. The whole batch is rejected
/// synchronously; no event will be delivered for it.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchError {
    /// The batch contains the named op kind more than once.
    DuplicateOp(&'static str),
    /// An op of the named kind is already in flight on this call.
    AlreadyInFlight(&'static str),
    /// The named at-most-once op was already used on this call.
    AlreadyUsed(&'static str),
    /// The named op is not valid on this side of the call.
    WrongSide(&'static str),
    /// `send_message` without `send_initial_metadata` having been sent.
    MissingInitialMetadata,
    /// A send op after the outbound direction was closed.
    OutboundClosed,
    /// The batch is empty.
    EmptyBatch,
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchError::DuplicateOp(op) => write!(f, "batch contains {op} more than once"),
            BatchError::AlreadyInFlight(op) => write!(f, "{op} is already in flight"),
            BatchError::AlreadyUsed(op) => write!(f, "{op} was already used on this call"),
            BatchError::WrongSide(op) => write!(f, "{op} is not valid on this side of the call"),
            BatchError::MissingInitialMetadata => {
                write!(f, "send_message requires send_initial_metadata first")
            }
            BatchError::OutboundClosed => write!(f, "the outbound direction is closed"),
            BatchError::EmptyBatch => write!(f, "batch contains no ops"),
        }
    }
}

impl std::error::Error for BatchError {}

#[derive(Default)]
struct OpFlags {
    in_flight: u8,
    used: u8,
}

// ===== latch =====

/// A set-once cell that async waiters can await. The first `set` wins.
pub(crate) struct Latch<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Latch<T> {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    pub(crate) fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(value);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub(crate) async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                // The latch lives as long as the call; an unset, dropped
                // latch means the waiter is being torn down anyway.
                std::future::pending::<()>().await;
            }
        }
    }
}

// ===== the call =====

pub(crate) enum SendWork {
    InitialMetadata(Metadata, oneshot::Sender<bool>),
    Message(Bytes, oneshot::Sender<bool>),
    Close(oneshot::Sender<bool>),
    Status(Status, Metadata, oneshot::Sender<bool>),
}

pub(crate) enum RecvWork {
    InitialMetadata(oneshot::Sender<(Metadata, bool)>),
    Message(oneshot::Sender<(Option<Bytes>, bool)>),
}

pub(crate) struct CallInner {
    side: Side,
    path: String,
    cq: CompletionQueue,
    deadline: Option<Instant>,
    flags: Mutex<OpFlags>,
    send_tx: mpsc::UnboundedSender<SendWork>,
    recv_tx: mpsc::UnboundedSender<RecvWork>,
    /// The final status of the call and the trailing metadata (client), or
    /// the locally produced terminal status (server).
    pub(crate) terminal: Latch<(Status, Metadata)>,
    /// Resolves when the call completes; the value is the cancelled flag.
    pub(crate) completed: Latch<bool>,
    cancelled: AtomicBool,
    cancel_tx: watch::Sender<Option<Status>>,
    /// Set once the application has released every handle; drivers wind down
    /// once no further batches can arrive.
    destroy_tx: watch::Sender<bool>,
    pub(crate) peer: Mutex<String>,
    pub(crate) authority: Mutex<String>,
    runtime: SharedRuntime,
    tasks: Mutex<Vec<BoxedTaskHandle>>,
    app_handles: std::sync::atomic::AtomicUsize,
}

/// One RPC.
///
/// Dropping the last application handle of a call that has not reached its
/// final status cancels it.
pub struct Call {
    inner: Arc<CallInner>,
}

impl Clone for Call {
    fn clone(&self) -> Self {
        self.inner.app_handles.fetch_add(1, Ordering::SeqCst);
        Call {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if self.inner.app_handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            if self.inner.terminal.get().is_none() {
                self.inner
                    .cancel(Status::cancelled("call dropped before completion"));
            }
            let _ = self.inner.destroy_tx.send(true);
        }
    }
}

impl Call {
    pub(crate) fn new(
        side: Side,
        path: String,
        cq: CompletionQueue,
        deadline: Option<Instant>,
        runtime: SharedRuntime,
    ) -> (Call, mpsc::UnboundedReceiver<SendWork>, mpsc::UnboundedReceiver<RecvWork>) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(CallInner {
            side,
            path,
            cq,
            deadline,
            flags: Mutex::new(OpFlags::default()),
            send_tx,
            recv_tx,
            terminal: Latch::new(),
            completed: Latch::new(),
            cancelled: AtomicBool::new(false),
            cancel_tx: watch::Sender::new(None),
            destroy_tx: watch::Sender::new(false),
            peer: Mutex::new(String::new()),
            authority: Mutex::new(String::new()),
            runtime,
            tasks: Mutex::new(Vec::new()),
            app_handles: std::sync::atomic::AtomicUsize::new(1),
        });

        // The deadline is enforced locally on both sides; the wire carries it
        // to the server in grpc-timeout form.
        if let Some(deadline) = deadline {
            let weak = Arc::downgrade(&inner);
            let runtime = inner.runtime.clone();
            let task = inner.runtime.spawn(Box::pin(async move {
                sleep_until(&runtime, deadline).await;
                if let Some(inner) = weak.upgrade() {
                    inner.cancel(Status::deadline_exceeded("deadline exceeded"));
                }
            }));
            inner.tasks.lock().unwrap().push(task);
        }

        (Call { inner: inner.clone() }, send_rx, recv_rx)
    }

    pub(crate) fn inner(&self) -> &Arc<CallInner> {
        &self.inner
    }

    /// The method path of this call.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// A printable description of the remote peer, once known.
    pub fn peer(&self) -> String {
        self.inner.peer.lock().unwrap().clone()
    }

    /// The `:authority` this call is (or will be) sent under. Empty on the
    /// client until the call is bound to a transport stream.
    pub fn authority(&self) -> String {
        self.inner.authority.lock().unwrap().clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Cancels the call: pending batches complete with `ok=false` and the
    /// transport stream is reset. Idempotent.
    pub fn cancel(&self, status: Status) {
        self.inner.cancel(status);
    }

    /// Submits a batch of ops, tagged with `tag`. On success exactly one
    /// completion event for `tag` will be delivered on the call's completion
    /// queue. On failure the whole batch is rejected and no event is
    /// delivered.
    pub fn start_batch(&self, batch: Batch, tag: Tag) -> Result<(), BatchError> {
        let inner = &self.inner;
        if batch.ops.is_empty() {
            return Err(BatchError::EmptyBatch);
        }

        // Validate the whole batch synchronously under the flags lock, so a
        // rejected batch has no effect.
        {
            let mut flags = inner.flags.lock().unwrap();
            let mut batch_bits: u8 = 0;
            let mut outbound_closing = inner.flags_outbound_closed(&flags);
            let mut metadata_sent = flags.used & OpKind::SendInitialMetadata.bit() != 0;
            for op in &batch.ops {
                let kind = op.kind();
                let bit = kind.bit();
                if !kind.valid_on(inner.side) {
                    return Err(BatchError::WrongSide(kind.name()));
                }
                if batch_bits & bit != 0 {
                    return Err(BatchError::DuplicateOp(kind.name()));
                }
                if flags.in_flight & bit != 0 {
                    return Err(BatchError::AlreadyInFlight(kind.name()));
                }
                if kind.at_most_once() && flags.used & bit != 0 {
                    return Err(BatchError::AlreadyUsed(kind.name()));
                }
                match kind {
                    OpKind::SendInitialMetadata => metadata_sent = true,
                    OpKind::SendMessage => {
                        if !metadata_sent {
                            return Err(BatchError::MissingInitialMetadata);
                        }
                        if outbound_closing {
                            return Err(BatchError::OutboundClosed);
                        }
                    }
                    OpKind::SendClose | OpKind::SendStatus => {
                        if outbound_closing {
                            return Err(BatchError::OutboundClosed);
                        }
                        outbound_closing = true;
                    }
                    _ => {}
                }
                batch_bits |= bit;
            }
            flags.in_flight |= batch_bits;
            flags.used |= batch_bits;
        }

        // Enqueue the transport work synchronously so that ops of the same
        // direction execute in batch submission order across batches.
        let mut receipts = Vec::with_capacity(batch.ops.len());
        for op in batch.ops {
            match op {
                Op::SendInitialMetadata(md) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = inner.send_tx.send(SendWork::InitialMetadata(md, tx));
                    receipts.push(OpReceipt::Send(OpKind::SendInitialMetadata, rx));
                }
                Op::SendMessage(message) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = inner.send_tx.send(SendWork::Message(message, tx));
                    receipts.push(OpReceipt::Send(OpKind::SendMessage, rx));
                }
                Op::SendClose => {
                    let (tx, rx) = oneshot::channel();
                    let _ = inner.send_tx.send(SendWork::Close(tx));
                    receipts.push(OpReceipt::Send(OpKind::SendClose, rx));
                }
                Op::SendStatus(status, trailers) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = inner.send_tx.send(SendWork::Status(status, trailers, tx));
                    receipts.push(OpReceipt::Send(OpKind::SendStatus, rx));
                }
                Op::RecvInitialMetadata(slot) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = inner.recv_tx.send(RecvWork::InitialMetadata(tx));
                    receipts.push(OpReceipt::RecvInitialMetadata(rx, slot));
                }
                Op::RecvMessage(slot) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = inner.recv_tx.send(RecvWork::Message(tx));
                    receipts.push(OpReceipt::RecvMessage(rx, slot));
                }
                Op::RecvStatus(slot) => receipts.push(OpReceipt::RecvStatus(slot)),
                Op::RecvClose(slot) => receipts.push(OpReceipt::RecvClose(slot)),
            }
        }

        inner.cq.register_source();
        // The batch task is not tracked for abort: if the drivers go away its
        // receipts resolve to failures and the completion event still fires.
        let batch_inner = inner.clone();
        inner.runtime.spawn(Box::pin(async move {
            run_batch(batch_inner, receipts, tag).await;
        }));
        Ok(())
    }
}

enum OpReceipt {
    Send(OpKind, oneshot::Receiver<bool>),
    RecvInitialMetadata(oneshot::Receiver<(Metadata, bool)>, MetadataSlot),
    RecvMessage(oneshot::Receiver<(Option<Bytes>, bool)>, MessageSlot),
    RecvStatus(StatusSlot),
    RecvClose(CloseSlot),
}

impl OpReceipt {
    fn kind(&self) -> OpKind {
        match self {
            OpReceipt::Send(kind, _) => *kind,
            OpReceipt::RecvInitialMetadata(..) => OpKind::RecvInitialMetadata,
            OpReceipt::RecvMessage(..) => OpKind::RecvMessage,
            OpReceipt::RecvStatus(_) => OpKind::RecvStatus,
            OpReceipt::RecvClose(_) => OpKind::RecvClose,
        }
    }
}

async fn run_batch(inner: Arc<CallInner>, receipts: Vec<OpReceipt>, tag: Tag) {
    let mut ok = true;
    let mut bits: u8 = 0;
    for receipt in receipts {
        bits |= receipt.kind().bit();
        match receipt {
            OpReceipt::Send(_, rx) => {
                ok &= rx.await.unwrap_or(false);
            }
            OpReceipt::RecvInitialMetadata(rx, slot) => {
                let (metadata, op_ok) = rx.await.unwrap_or((Metadata::new(), false));
                slot.set(metadata);
                ok &= op_ok;
            }
            OpReceipt::RecvMessage(rx, slot) => {
                let (message, op_ok) = rx.await.unwrap_or((None, false));
                slot.set(message);
                ok &= op_ok;
            }
            OpReceipt::RecvStatus(slot) => {
                // Always completes, delivering the final status even when the
                // call failed or was cancelled.
                slot.set(inner.terminal.wait().await);
            }
            OpReceipt::RecvClose(slot) => {
                slot.set(inner.completed.wait().await);
            }
        }
    }
    {
        let mut flags = inner.flags.lock().unwrap();
        flags.in_flight &= !bits;
    }
    trace!(tag = tag.0, ok, "batch complete");
    inner.cq.enqueue(tag, ok);
}

impl CallInner {
    fn flags_outbound_closed(&self, flags: &OpFlags) -> bool {
        flags.used & (OpKind::SendClose.bit() | OpKind::SendStatus.bit()) != 0
    }

    pub(crate) fn cancel(&self, status: Status) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // `completed` may already carry false if the call finished cleanly;
        // the first setter wins in that case and this cancel is a no-op for
        // observers.
        let was_done = !self.terminal.set((status.clone(), Metadata::new()));
        self.completed.set(!was_done);
        let _ = self.cancel_tx.send(Some(status));
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves the call's final status from the transport/driver side.
    pub(crate) fn finish(&self, status: Status, trailers: Metadata) {
        if self.terminal.set((status, trailers)) {
            self.completed.set(false);
        }
    }

    pub(crate) fn cancel_watch(&self) -> watch::Receiver<Option<Status>> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn destroy_watch(&self) -> watch::Receiver<bool> {
        self.destroy_tx.subscribe()
    }

    pub(crate) fn side(&self) -> Side {
        self.side
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    pub(crate) fn add_task(&self, task: BoxedTaskHandle) {
        self.tasks.lock().unwrap().push(task);
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("path", &self.inner.path)
            .field("side", &self.inner.side)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::default_runtime;
    use crate::Code;
    use std::time::Duration;

    fn new_test_call() -> (
        Call,
        mpsc::UnboundedReceiver<SendWork>,
        mpsc::UnboundedReceiver<RecvWork>,
    ) {
        Call::new(
            Side::Client,
            "/test.Service/Method".to_string(),
            CompletionQueue::new(),
            None,
            default_runtime(),
        )
    }

    #[tokio::test]
    async fn duplicate_op_in_batch_is_rejected() {
        let (call, _send_rx, _recv_rx) = new_test_call();
        let batch = Batch::new()
            .send_initial_metadata(Metadata::new())
            .send_message("a")
            .send_message("b");
        assert_eq!(
            call.start_batch(batch, Tag(1)).unwrap_err(),
            BatchError::DuplicateOp("send_message")
        );
    }

    #[tokio::test]
    async fn in_flight_op_is_rejected() {
        let (call, _send_rx, _recv_rx) = new_test_call();
        call.start_batch(
            Batch::new()
                .send_initial_metadata(Metadata::new())
                .send_message("a"),
            Tag(1),
        )
        .unwrap();
        // The first send_message has not completed (nobody is driving the
        // send queue), so a second one fails synchronously.
        assert_eq!(
            call.start_batch(Batch::new().send_message("b"), Tag(2)).unwrap_err(),
            BatchError::AlreadyInFlight("send_message")
        );
    }

    #[tokio::test]
    async fn at_most_once_ops_are_enforced() {
        let (call, _send_rx, mut recv_rx) = new_test_call();
        call.start_batch(
            Batch::new().recv_initial_metadata(MetadataSlot::new()),
            Tag(1),
        )
        .unwrap();
        // Complete the pending recv op.
        match recv_rx.recv().await.unwrap() {
            RecvWork::InitialMetadata(tx) => {
                let _ = tx.send((Metadata::new(), true));
            }
            _ => panic!("unexpected work"),
        }
        // Wait for the batch to finish so the op is no longer in flight.
        let deadline = Instant::now() + Duration::from_secs(5);
        let cq_clone = call.inner.cq.clone();
        tokio::task::spawn_blocking(move || cq_clone.next(deadline))
            .await
            .unwrap();

        assert_eq!(
            call.start_batch(
                Batch::new().recv_initial_metadata(MetadataSlot::new()),
                Tag(2)
            )
            .unwrap_err(),
            BatchError::AlreadyUsed("recv_initial_metadata")
        );
    }

    #[tokio::test]
    async fn send_message_requires_initial_metadata() {
        let (call, _send_rx, _recv_rx) = new_test_call();
        assert_eq!(
            call.start_batch(Batch::new().send_message("a"), Tag(1)).unwrap_err(),
            BatchError::MissingInitialMetadata
        );
    }

    #[tokio::test]
    async fn sends_after_close_are_rejected() {
        let (call, _send_rx, _recv_rx) = new_test_call();
        call.start_batch(
            Batch::new()
                .send_initial_metadata(Metadata::new())
                .send_close(),
            Tag(1),
        )
        .unwrap();
        assert_eq!(
            call.start_batch(Batch::new().send_message("late"), Tag(2)).unwrap_err(),
            BatchError::OutboundClosed
        );
    }

    #[tokio::test]
    async fn server_ops_rejected_on_client() {
        let (call, _send_rx, _recv_rx) = new_test_call();
        assert_eq!(
            call.start_batch(
                Batch::new().send_status(Status::ok(), Metadata::new()),
                Tag(1)
            )
            .unwrap_err(),
            BatchError::WrongSide("send_status")
        );
        assert_eq!(
            call.start_batch(Batch::new().recv_close(CloseSlot::new()), Tag(2)).unwrap_err(),
            BatchError::WrongSide("recv_close")
        );
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let (call, _send_rx, _recv_rx) = new_test_call();
        assert_eq!(
            call.start_batch(Batch::new(), Tag(1)).unwrap_err(),
            BatchError::EmptyBatch
        );
    }

    #[tokio::test]
    async fn cancel_fails_pending_batches() {
        let (call, mut send_rx, _recv_rx) = new_test_call();
        let cq = call.inner.cq.clone();
        call.start_batch(
            Batch::new().send_initial_metadata(Metadata::new()),
            Tag(7),
        )
        .unwrap();

        // A driver would fail the pending work on cancel; emulate it.
        call.cancel(Status::cancelled("test cancel"));
        match send_rx.recv().await.unwrap() {
            SendWork::InitialMetadata(_, tx) => {
                let _ = tx.send(false);
            }
            _ => panic!("unexpected work"),
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let next = tokio::task::spawn_blocking(move || cq.next(deadline))
            .await
            .unwrap();
        assert_eq!(
            next,
            crate::completion::Next::Event {
                tag: Tag(7),
                ok: false
            }
        );
    }

    #[tokio::test]
    async fn recv_status_always_delivers_final_status() {
        let (call, _send_rx, _recv_rx) = new_test_call();
        let cq = call.inner.cq.clone();
        let slot = StatusSlot::new();
        call.start_batch(Batch::new().recv_status(slot.clone()), Tag(3)).unwrap();
        call.cancel(Status::deadline_exceeded("too slow"));

        let deadline = Instant::now() + Duration::from_secs(5);
        let next = tokio::task::spawn_blocking(move || cq.next(deadline))
            .await
            .unwrap();
        assert_eq!(
            next,
            crate::completion::Next::Event {
                tag: Tag(3),
                ok: true
            }
        );
        let (status, _) = slot.take().unwrap();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn deadline_cancels_the_call() {
        let (call, _send_rx, _recv_rx) = Call::new(
            Side::Client,
            "/test.Service/Method".to_string(),
            CompletionQueue::new(),
            Some(Instant::now() + Duration::from_millis(20)),
            default_runtime(),
        );
        let (status, _) = call.inner.terminal.wait().await;
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(call.inner.is_cancelled());
    }
}
