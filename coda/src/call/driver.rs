//! The transport-facing side of the call engine: per-call driver tasks that
//! turn queued send/recv work into stream activity.
//!
//! A client call runs three cooperating tasks: a send loop that records
//! outbound ops into the replay buffer, a controller that owns recv
//! dispatch and the attempt lifecycle (including retries and hedging), and
//! one pump per transport attempt. A server call runs a send loop and a
//! demand-driven recv loop over the accepted stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::call::{CallInner, RecvWork, SendWork};
use crate::client::service_config::{HedgingPolicy, RetryPolicy};
use crate::metadata::Metadata;
use crate::rt::{BoxedTaskHandle, SharedRuntime};
use crate::transport::TransportStream;
use crate::{Code, Status};

/// Binds one call attempt to a transport stream: performs the pick and opens
/// the stream carrying the call's leading metadata.
#[async_trait]
pub(crate) trait Binder: Send + Sync {
    async fn bind(&self, metadata: Metadata) -> Result<BoundStream, Status>;
}

pub(crate) struct BoundStream {
    pub(crate) stream: TransportStream,
    pub(crate) peer: String,
    pub(crate) authority: String,
}

/// Per-call configuration handed to the client driver by the channel.
pub(crate) struct ClientCallConfig {
    pub(crate) binder: Arc<dyn Binder>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) hedging_policy: Option<HedgingPolicy>,
    pub(crate) retry_buffer_limit: usize,
    pub(crate) max_send_message_size: usize,
    pub(crate) max_recv_message_size: usize,
}

// ===== replay buffer =====

enum ReplayOp {
    Message(Bytes),
    Close,
}

/// Outbound ops buffered for (re)play onto attempts. When retries or hedging
/// are active, ops are acknowledged to the application once buffered; the
/// per-op ack sender is kept otherwise so the attempt can acknowledge on
/// transport acceptance.
struct Replay {
    headers: Option<Metadata>,
    ops: Vec<(ReplayOp, Option<oneshot::Sender<bool>>)>,
    bytes: usize,
    /// The buffer exceeded its budget: retries are off for this call.
    overflowed: bool,
}

struct SharedReplay {
    state: Mutex<Replay>,
    /// Bumped on every buffer change; a watch (rather than a bare notify) so
    /// that an update between a waiter's check and its await is never lost.
    changed: watch::Sender<u64>,
}

impl SharedReplay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Replay {
                headers: None,
                ops: Vec::new(),
                bytes: 0,
                overflowed: false,
            }),
            changed: watch::Sender::new(0),
        })
    }

    fn mark_changed(&self) {
        self.changed.send_modify(|v| *v += 1);
    }

    /// Fails every op that was buffered but never acknowledged by an
    /// attempt. Called once the call has reached its final status, so a send
    /// the transport never accepted does not leave its batch pending.
    fn fail_unacked(&self) {
        let mut state = self.state.lock();
        for (_, ack) in state.ops.iter_mut() {
            if let Some(ack) = ack.take() {
                let _ = ack.send(false);
            }
        }
    }
}

// ===== inbound events =====

enum InboundEvent {
    Bound(u64, String, String),
    Headers(u64, Metadata),
    Message(u64, Bytes),
    Final(u64, Status, Metadata),
}

// ===== recv dispatch =====

/// Inbound data shared between the wire and pending recv ops.
struct RecvState {
    headers: Option<Metadata>,
    messages: VecDeque<Bytes>,
    /// No further messages will arrive.
    eos: bool,
    pending: VecDeque<RecvWork>,
}

impl RecvState {
    fn new() -> Self {
        Self {
            headers: None,
            messages: VecDeque::new(),
            eos: false,
            pending: VecDeque::new(),
        }
    }

    /// Matches pending recv ops against available inbound data, in order.
    /// Returns true if a message or the header block was delivered to the
    /// application.
    fn dispatch(&mut self) -> bool {
        let mut delivered = false;
        while let Some(front) = self.pending.front() {
            match front {
                RecvWork::InitialMetadata(_) => {
                    if let Some(md) = self.headers.clone() {
                        let Some(RecvWork::InitialMetadata(tx)) = self.pending.pop_front() else {
                            unreachable!()
                        };
                        let _ = tx.send((md, true));
                        delivered = true;
                    } else if self.eos {
                        // Trailers-only outcome: the op completes with empty
                        // metadata; the interesting part is in the status.
                        let Some(RecvWork::InitialMetadata(tx)) = self.pending.pop_front() else {
                            unreachable!()
                        };
                        let _ = tx.send((Metadata::new(), true));
                    } else {
                        break;
                    }
                }
                RecvWork::Message(_) => {
                    if let Some(message) = self.messages.pop_front() {
                        let Some(RecvWork::Message(tx)) = self.pending.pop_front() else {
                            unreachable!()
                        };
                        let _ = tx.send((Some(message), true));
                        delivered = true;
                    } else if self.eos {
                        let Some(RecvWork::Message(tx)) = self.pending.pop_front() else {
                            unreachable!()
                        };
                        let _ = tx.send((None, false));
                    } else {
                        break;
                    }
                }
            }
        }
        delivered
    }

    fn fail_all_pending(&mut self) {
        for work in self.pending.drain(..) {
            match work {
                RecvWork::InitialMetadata(tx) => {
                    let _ = tx.send((Metadata::new(), false));
                }
                RecvWork::Message(tx) => {
                    let _ = tx.send((None, false));
                }
            }
        }
    }
}

// ===== client driver =====

pub(crate) fn start_client_driver(
    inner: &Arc<CallInner>,
    config: ClientCallConfig,
    send_rx: mpsc::UnboundedReceiver<SendWork>,
    recv_rx: mpsc::UnboundedReceiver<RecvWork>,
) {
    let replay = SharedReplay::new();
    let runtime = inner.runtime().clone();

    let optimistic_acks = config.retry_policy.is_some() || config.hedging_policy.is_some();
    let send_task = runtime.spawn(Box::pin(client_send_loop(
        inner.clone(),
        send_rx,
        replay.clone(),
        config.max_send_message_size,
        config.retry_buffer_limit,
        optimistic_acks,
    )));
    inner.add_task(send_task);

    let controller_task = runtime.spawn(Box::pin(client_controller(
        inner.clone(),
        config,
        replay,
        recv_rx,
    )));
    inner.add_task(controller_task);
}

async fn client_send_loop(
    inner: Arc<CallInner>,
    mut send_rx: mpsc::UnboundedReceiver<SendWork>,
    replay: Arc<SharedReplay>,
    max_send_message_size: usize,
    retry_buffer_limit: usize,
    optimistic_acks: bool,
) {
    let mut cancel_rx = inner.cancel_watch();
    let mut destroy_rx = inner.destroy_watch();
    loop {
        let work = tokio::select! {
            work = send_rx.recv() => work,
            _ = cancelled(&mut cancel_rx) => break,
            _ = destroyed(&mut destroy_rx) => break,
        };
        let Some(work) = work else { return };
        match work {
            SendWork::InitialMetadata(md, tx) => {
                {
                    let mut state = replay.state.lock();
                    state.headers = Some(md);
                }
                replay.mark_changed();
                let _ = tx.send(true);
            }
            SendWork::Message(message, tx) => {
                if inner.terminal.get().is_some() {
                    // The call already has its final status; nothing further
                    // goes out.
                    let _ = tx.send(false);
                    continue;
                }
                if message.len() > max_send_message_size {
                    let _ = tx.send(false);
                    inner.cancel(Status::resource_exhausted(format!(
                        "attempted to send message larger than max ({} vs. {})",
                        message.len(),
                        max_send_message_size
                    )));
                    break;
                }
                {
                    let mut state = replay.state.lock();
                    state.bytes += message.len();
                    if state.bytes > retry_buffer_limit {
                        state.overflowed = true;
                    }
                    if optimistic_acks {
                        let _ = tx.send(true);
                        state.ops.push((ReplayOp::Message(message), None));
                    } else {
                        state.ops.push((ReplayOp::Message(message), Some(tx)));
                    }
                }
                replay.mark_changed();
            }
            SendWork::Close(tx) => {
                if inner.terminal.get().is_some() {
                    let _ = tx.send(false);
                    continue;
                }
                {
                    let mut state = replay.state.lock();
                    if optimistic_acks {
                        let _ = tx.send(true);
                        state.ops.push((ReplayOp::Close, None));
                    } else {
                        state.ops.push((ReplayOp::Close, Some(tx)));
                    }
                }
                replay.mark_changed();
            }
            SendWork::Status(_, _, tx) => {
                // Not reachable: validated against on the client side.
                let _ = tx.send(false);
            }
        }
    }
    // Cancelled or destroyed: every queued and future send op fails. The
    // drain holds only the receiver so the call itself can be freed; it ends
    // when the call's sender side is dropped.
    spawn_send_drain(inner, send_rx);
}

fn spawn_send_drain(inner: Arc<CallInner>, mut send_rx: mpsc::UnboundedReceiver<SendWork>) {
    inner.runtime().spawn(Box::pin(async move {
        while let Some(work) = send_rx.recv().await {
            match work {
                SendWork::InitialMetadata(_, tx)
                | SendWork::Message(_, tx)
                | SendWork::Close(tx)
                | SendWork::Status(_, _, tx) => {
                    let _ = tx.send(false);
                }
            }
        }
    }));
}

struct AttemptHandle {
    pump_task: BoxedTaskHandle,
    send_task: BoxedTaskHandle,
}

impl AttemptHandle {
    fn abort(&self) {
        self.pump_task.abort();
        self.send_task.abort();
    }
}

struct RetrySchedule {
    next_delay: Duration,
    policy: RetryPolicy,
}

impl RetrySchedule {
    fn next(&mut self) -> Duration {
        let delay = self.next_delay;
        self.next_delay = Duration::from_secs_f64(
            self.policy
                .max_backoff
                .as_secs_f64()
                .min(self.next_delay.as_secs_f64() * self.policy.backoff_multiplier),
        );
        // Per the retry design, the actual delay is drawn uniformly from
        // (0, current].
        Duration::from_secs_f64(rand::random_range(0.0..=delay.as_secs_f64().max(f64::MIN_POSITIVE)))
    }
}

async fn client_controller(
    inner: Arc<CallInner>,
    config: ClientCallConfig,
    replay: Arc<SharedReplay>,
    mut recv_rx: mpsc::UnboundedReceiver<RecvWork>,
) {
    let runtime = inner.runtime().clone();
    let mut cancel_rx = inner.cancel_watch();
    let mut destroy_rx = inner.destroy_watch();
    let (events_tx, mut events_rx) = mpsc::channel::<InboundEvent>(8);

    let mut state = RecvState::new();
    let mut attempts: HashMap<u64, AttemptHandle> = HashMap::new();
    let mut next_attempt_id: u64 = 0;
    let mut attempts_started: u32 = 0;
    let mut elected: Option<u64> = None;
    let mut committed = false;
    let mut finished = false;
    let mut last_failure: Option<(Status, Metadata)> = None;

    let max_attempts = config
        .retry_policy
        .as_ref()
        .map(|p| p.max_attempts)
        .or(config.hedging_policy.as_ref().map(|p| p.max_attempts))
        .unwrap_or(1);
    let mut retry_schedule = config.retry_policy.clone().map(|policy| RetrySchedule {
        next_delay: policy.initial_backoff,
        policy,
    });

    // Timer driving delayed attempt starts: the retry backoff, or the
    // hedging delay.
    let mut timer: Option<std::pin::Pin<Box<dyn crate::rt::Sleep>>> = None;

    let start_attempt = |attempts: &mut HashMap<u64, AttemptHandle>,
                          next_attempt_id: &mut u64,
                          attempts_started: &mut u32| {
        let id = *next_attempt_id;
        *next_attempt_id += 1;
        *attempts_started += 1;
        let handle = spawn_attempt(
            id,
            config.binder.clone(),
            replay.clone(),
            events_tx.clone(),
            runtime.clone(),
        );
        attempts.insert(id, handle);
        trace!(attempt = id, "started call attempt");
    };

    start_attempt(&mut attempts, &mut next_attempt_id, &mut attempts_started);
    if let Some(hedging) = &config.hedging_policy {
        if attempts_started < max_attempts {
            timer = Some(runtime.sleep(hedging.hedging_delay));
        }
    }

    loop {
        tokio::select! {
            work = recv_rx.recv() => {
                match work {
                    Some(work) => {
                        state.pending.push_back(work);
                        if state.dispatch() {
                            committed = true;
                        }
                    }
                    None => break,
                }
            }
            Some(event) = events_rx.recv() => {
                match event {
                    InboundEvent::Bound(id, peer, authority) => {
                        if elected.is_none() || elected == Some(id) {
                            *inner.peer.lock().unwrap() = peer;
                            *inner.authority.lock().unwrap() = authority;
                        }
                    }
                    InboundEvent::Headers(id, md) => {
                        if finished || (elected.is_some() && elected != Some(id)) {
                            continue;
                        }
                        // Receiving the header block elects this attempt:
                        // the others are abandoned.
                        elect(id, &mut elected, &mut attempts, &mut timer);
                        state.headers = Some(md);
                        if state.dispatch() {
                            committed = true;
                        }
                    }
                    InboundEvent::Message(id, message) => {
                        if finished || (elected.is_some() && elected != Some(id)) {
                            continue;
                        }
                        if message.len() > config.max_recv_message_size {
                            inner.cancel(Status::resource_exhausted(format!(
                                "received message larger than max ({} vs. {})",
                                message.len(),
                                config.max_recv_message_size
                            )));
                            continue;
                        }
                        elect(id, &mut elected, &mut attempts, &mut timer);
                        // A reply message commits the call: the replay buffer
                        // is dead from here on.
                        committed = true;
                        state.messages.push_back(message);
                        state.dispatch();
                    }
                    InboundEvent::Final(id, status, trailers) => {
                        if finished {
                            continue;
                        }
                        if elected.is_some() && elected != Some(id) {
                            attempts.remove(&id);
                            continue;
                        }
                        attempts.remove(&id);

                        if elected == Some(id) && committed {
                            finish(&inner, &mut state, &replay, &mut finished, status, trailers);
                            continue;
                        }

                        // Uncommitted outcome: eligible for another attempt.
                        elected = None;
                        state.headers = None;
                        state.messages.clear();
                        last_failure = Some((status.clone(), trailers.clone()));

                        let overflowed = replay.state.lock().overflowed;
                        let retryable = is_retryable(&config, &status);
                        if !overflowed && retryable && attempts_started < max_attempts {
                            if let Some(schedule) = &mut retry_schedule {
                                let delay = schedule.next();
                                debug!(code = ?status.code(), ?delay, "retrying call");
                                timer = Some(runtime.sleep(delay));
                            } else if attempts.is_empty() && timer.is_none() {
                                // Hedged attempts all failed early; start the
                                // next one immediately.
                                start_attempt(&mut attempts, &mut next_attempt_id, &mut attempts_started);
                            }
                        } else if attempts.is_empty() && timer.is_none() {
                            finish(&inner, &mut state, &replay, &mut finished, status, trailers);
                        }
                    }
                }
            }
            _ = wait_timer(&mut timer), if timer.is_some() => {
                timer = None;
                if finished || committed && config.hedging_policy.is_some() {
                    continue;
                }
                if attempts_started < max_attempts {
                    start_attempt(&mut attempts, &mut next_attempt_id, &mut attempts_started);
                    if let Some(hedging) = &config.hedging_policy {
                        if attempts_started < max_attempts && elected.is_none() {
                            timer = Some(runtime.sleep(hedging.hedging_delay));
                        }
                    }
                } else if attempts.is_empty() {
                    if let Some((status, trailers)) = last_failure.take() {
                        finish(&inner, &mut state, &replay, &mut finished, status, trailers);
                    }
                }
            }
            _ = cancelled(&mut cancel_rx) => break,
            _ = destroyed(&mut destroy_rx) => break,
        }
    }

    // Cancelled or the call went away: reset any live attempt and fail
    // everything still pending.
    for (_, attempt) in attempts.drain() {
        attempt.abort();
    }
    state.eos = true;
    state.dispatch();
    state.fail_all_pending();
    spawn_recv_drain(inner, recv_rx);
}

fn spawn_recv_drain(inner: Arc<CallInner>, mut recv_rx: mpsc::UnboundedReceiver<RecvWork>) {
    inner.runtime().spawn(Box::pin(async move {
        while let Some(work) = recv_rx.recv().await {
            match work {
                RecvWork::InitialMetadata(tx) => {
                    let _ = tx.send((Metadata::new(), false));
                }
                RecvWork::Message(tx) => {
                    let _ = tx.send((None, false));
                }
            }
        }
    }));
}

fn elect(
    id: u64,
    elected: &mut Option<u64>,
    attempts: &mut HashMap<u64, AttemptHandle>,
    timer: &mut Option<std::pin::Pin<Box<dyn crate::rt::Sleep>>>,
) {
    if elected.is_some() {
        return;
    }
    *elected = Some(id);
    *timer = None;
    attempts.retain(|&other, handle| {
        if other == id {
            true
        } else {
            handle.abort();
            false
        }
    });
}

fn finish(
    inner: &Arc<CallInner>,
    state: &mut RecvState,
    replay: &SharedReplay,
    finished: &mut bool,
    status: Status,
    trailers: Metadata,
) {
    *finished = true;
    state.eos = true;
    state.dispatch();
    inner.finish(status, trailers);
    replay.fail_unacked();
}

fn is_retryable(config: &ClientCallConfig, status: &Status) -> bool {
    if let Some(policy) = &config.retry_policy {
        return policy.retryable_status_codes.contains(&status.code());
    }
    if let Some(policy) = &config.hedging_policy {
        // For hedging, a listed non-fatal code allows the remaining attempts
        // to proceed; anything else resolves the call.
        return policy.non_fatal_status_codes.contains(&status.code())
            || policy.non_fatal_status_codes.is_empty();
    }
    false
}

async fn wait_timer(timer: &mut Option<std::pin::Pin<Box<dyn crate::rt::Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn cancelled(cancel_rx: &mut watch::Receiver<Option<Status>>) {
    while cancel_rx.borrow_and_update().is_none() {
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn destroyed(destroy_rx: &mut watch::Receiver<bool>) {
    while !*destroy_rx.borrow_and_update() {
        if destroy_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_attempt(
    id: u64,
    binder: Arc<dyn Binder>,
    replay: Arc<SharedReplay>,
    events_tx: mpsc::Sender<InboundEvent>,
    runtime: SharedRuntime,
) -> AttemptHandle {
    let (stream_tx, stream_rx) = oneshot::channel::<Box<dyn crate::transport::StreamSendHalf>>();

    let pump_replay = replay.clone();
    let pump_events = events_tx.clone();
    let pump_task = runtime.spawn(Box::pin(async move {
        // The attempt starts once the leading metadata is available.
        let mut changed_rx = pump_replay.changed.subscribe();
        let headers = loop {
            {
                let state = pump_replay.state.lock();
                if let Some(headers) = state.headers.clone() {
                    break headers;
                }
            }
            if changed_rx.changed().await.is_err() {
                return;
            }
        };

        let bound = match binder.bind(headers).await {
            Ok(bound) => bound,
            Err(status) => {
                let _ = pump_events
                    .send(InboundEvent::Final(id, status, Metadata::new()))
                    .await;
                return;
            }
        };
        let _ = pump_events
            .send(InboundEvent::Bound(id, bound.peer, bound.authority))
            .await;
        let TransportStream { send, mut recv } = bound.stream;
        if stream_tx.send(send).is_err() {
            return;
        }

        match recv.initial_metadata().await {
            Ok(Some(md)) => {
                let _ = pump_events.send(InboundEvent::Headers(id, md)).await;
            }
            Ok(None) => {
                // Trailers-only response; fall through to the trailers.
            }
            Err(status) => {
                let _ = pump_events
                    .send(InboundEvent::Final(id, status, Metadata::new()))
                    .await;
                return;
            }
        }
        loop {
            match recv.message().await {
                Ok(Some(message)) => {
                    if pump_events
                        .send(InboundEvent::Message(id, message))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    let _ = pump_events
                        .send(InboundEvent::Final(id, status, Metadata::new()))
                        .await;
                    return;
                }
            }
        }
        let (status, trailers) = recv.trailers().await;
        let _ = pump_events
            .send(InboundEvent::Final(id, status, trailers))
            .await;
    }));

    let send_replay = replay.clone();
    let send_task = runtime.spawn(Box::pin(async move {
        let Ok(mut send) = stream_rx.await else { return };
        let mut changed_rx = send_replay.changed.subscribe();
        let mut cursor = 0usize;
        loop {
            enum Next {
                Message(Bytes, Option<oneshot::Sender<bool>>),
                Close(Option<oneshot::Sender<bool>>),
            }
            let next = loop {
                {
                    let mut state = send_replay.state.lock();
                    if cursor < state.ops.len() {
                        let (op, ack) = &mut state.ops[cursor];
                        let ack = ack.take();
                        cursor += 1;
                        break match op {
                            ReplayOp::Message(m) => Next::Message(m.clone(), ack),
                            ReplayOp::Close => Next::Close(ack),
                        };
                    }
                }
                if changed_rx.changed().await.is_err() {
                    return;
                }
            };
            match next {
                Next::Message(message, ack) => {
                    let result = send.send_message(message).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(result.is_ok());
                    }
                    if result.is_err() {
                        // The pump observes the failure on the recv side.
                        return;
                    }
                }
                Next::Close(ack) => {
                    let result = send.half_close().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(result.is_ok());
                    }
                    return;
                }
            }
        }
    }));

    AttemptHandle {
        pump_task,
        send_task,
    }
}

// ===== server driver =====

/// Server-side configuration: size caps come from the server builder.
pub(crate) struct ServerCallConfig {
    pub(crate) max_send_message_size: usize,
}

pub(crate) fn start_server_driver(
    inner: &Arc<CallInner>,
    stream: crate::transport::ServerStream,
    config: ServerCallConfig,
    send_rx: mpsc::UnboundedReceiver<SendWork>,
    recv_rx: mpsc::UnboundedReceiver<RecvWork>,
) {
    let runtime = inner.runtime().clone();
    *inner.peer.lock().unwrap() = stream.head.peer.clone();
    *inner.authority.lock().unwrap() = stream.head.authority.clone().unwrap_or_default();

    let send_task = runtime.spawn(Box::pin(server_send_loop(
        inner.clone(),
        stream.send,
        config,
        send_rx,
    )));
    inner.add_task(send_task);

    let recv_task = runtime.spawn(Box::pin(server_recv_loop(
        inner.clone(),
        stream.recv,
        recv_rx,
    )));
    inner.add_task(recv_task);
}

async fn server_send_loop(
    inner: Arc<CallInner>,
    mut send: Box<dyn crate::transport::ServerSendHalf>,
    config: ServerCallConfig,
    mut send_rx: mpsc::UnboundedReceiver<SendWork>,
) {
    let mut cancel_rx = inner.cancel_watch();
    let mut destroy_rx = inner.destroy_watch();
    loop {
        let work = tokio::select! {
            work = send_rx.recv() => work,
            _ = cancelled(&mut cancel_rx) => {
                send.reset(Code::Cancelled);
                break;
            }
            _ = destroyed(&mut destroy_rx) => break,
        };
        let Some(work) = work else { return };
        match work {
            SendWork::InitialMetadata(md, tx) => {
                let result = send.send_initial_metadata(md).await;
                let _ = tx.send(result.is_ok());
                if let Err(status) = result {
                    inner.cancel(status);
                    break;
                }
            }
            SendWork::Message(message, tx) => {
                if message.len() > config.max_send_message_size {
                    let _ = tx.send(false);
                    inner.cancel(Status::resource_exhausted(format!(
                        "attempted to send message larger than max ({} vs. {})",
                        message.len(),
                        config.max_send_message_size
                    )));
                    break;
                }
                let result = send.send_message(message).await;
                let _ = tx.send(result.is_ok());
                if let Err(status) = result {
                    inner.cancel(status);
                    break;
                }
            }
            SendWork::Status(status, trailers, tx) => {
                let result = send.send_status(&status, trailers.clone()).await;
                let _ = tx.send(result.is_ok());
                match result {
                    Ok(()) => {
                        // The call is complete from this server's point of
                        // view; recv_close reports cancelled=false.
                        inner.finish(status, trailers);
                    }
                    Err(err_status) => inner.cancel(err_status),
                }
                break;
            }
            SendWork::Close(tx) => {
                // Not reachable: validated against on the server side.
                let _ = tx.send(false);
            }
        }
    }
    spawn_send_drain(inner, send_rx);
}

async fn server_recv_loop(
    inner: Arc<CallInner>,
    mut recv: Box<dyn crate::transport::ServerRecvHalf>,
    mut recv_rx: mpsc::UnboundedReceiver<RecvWork>,
) {
    let mut cancel_rx = inner.cancel_watch();
    let mut destroy_rx = inner.destroy_watch();
    let mut eos = false;
    loop {
        let work = tokio::select! {
            work = recv_rx.recv() => work,
            _ = cancelled(&mut cancel_rx) => break,
            _ = destroyed(&mut destroy_rx) => break,
        };
        let Some(work) = work else { return };
        match work {
            RecvWork::InitialMetadata(tx) => {
                // The client's header block was consumed when the stream was
                // accepted; nothing further arrives here.
                let _ = tx.send((Metadata::new(), false));
            }
            RecvWork::Message(tx) => {
                if eos {
                    let _ = tx.send((None, false));
                    continue;
                }
                // Demand-driven: one posted recv op pulls exactly one message
                // so transport flow control reaches the peer.
                let message = tokio::select! {
                    message = recv.message() => message,
                    _ = cancelled(&mut cancel_rx) => {
                        let _ = tx.send((None, false));
                        break;
                    }
                };
                match message {
                    Ok(Some(message)) => {
                        let _ = tx.send((Some(message), true));
                    }
                    Ok(None) => {
                        eos = true;
                        let _ = tx.send((None, false));
                    }
                    Err(status) => {
                        let _ = tx.send((None, false));
                        debug!(code = ?status.code(), "server stream recv failed");
                        inner.cancel(status);
                        break;
                    }
                }
            }
        }
    }
    spawn_recv_drain(inner, recv_rx);
}
