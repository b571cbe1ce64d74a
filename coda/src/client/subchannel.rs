//! Subchannels: one (prospective or live) connection to one resolved
//! address.
//!
//! An internal subchannel owns the transport and runs an event-driven state
//! machine; LB policies hold lightweight [`Subchannel`] handles that share
//! the internal one through the pool. Subchannels for the same (address,
//! channel-args) pair are shared across channels unless a channel opts out
//! of the shared pool.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::client::backoff::ExponentialBackoff;
use crate::client::load_balancing::SubchannelState;
use crate::client::name_resolution::Address;
use crate::client::ConnectivityState;
use crate::metadata::Metadata;
use crate::rt::{BoxedTaskHandle, SharedRuntime};
use crate::transport::{ClientStreamHead, StreamTransport, Transport, TransportOptions};

/// Delivered a subchannel's state transitions. Multiple watchers may be
/// registered; they are notified outside the subchannel's state lock.
pub(crate) trait SubchannelWatcher: Send + Sync {
    fn on_state_change(&self, state: SubchannelState);
}

/// Watches a health service on the peer. Health checking is configured per
/// channel; when set, a connected transport is surfaced as READY only once
/// the peer reports SERVING.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HealthCheckConfig {
    pub(crate) service_name: String,
}

enum InternalState {
    Idle,
    Connecting {
        task: Option<BoxedTaskHandle>,
    },
    Ready {
        transport: Arc<dyn StreamTransport>,
        monitor_task: Option<BoxedTaskHandle>,
    },
    TransientFailure {
        backoff_task: Option<BoxedTaskHandle>,
        error: String,
    },
    Shutdown,
}

impl InternalState {
    fn connected_transport(&self) -> Option<Arc<dyn StreamTransport>> {
        match self {
            Self::Ready { transport, .. } => Some(transport.clone()),
            _ => None,
        }
    }

    fn to_subchannel_state(&self) -> SubchannelState {
        match self {
            Self::Idle => SubchannelState {
                connectivity_state: ConnectivityState::Idle,
                last_connection_error: None,
            },
            Self::Connecting { .. } => SubchannelState {
                connectivity_state: ConnectivityState::Connecting,
                last_connection_error: None,
            },
            Self::Ready { .. } => SubchannelState {
                connectivity_state: ConnectivityState::Ready,
                last_connection_error: None,
            },
            Self::TransientFailure { error, .. } => {
                let err: Arc<dyn Error + Send + Sync> = Arc::from(Box::from(error.clone()));
                SubchannelState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    last_connection_error: Some(err),
                }
            }
            Self::Shutdown => SubchannelState {
                connectivity_state: ConnectivityState::Shutdown,
                last_connection_error: None,
            },
        }
    }
}

impl Drop for InternalState {
    fn drop(&mut self) {
        let task = match self {
            Self::Idle | Self::Shutdown => None,
            Self::Connecting { task } => task.take(),
            Self::Ready { monitor_task, .. } => monitor_task.take(),
            Self::TransientFailure { backoff_task, .. } => backoff_task.take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Connecting { .. } => "Connecting",
            Self::Ready { .. } => "Ready",
            Self::TransientFailure { .. } => "TransientFailure",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(s)
    }
}

enum StateMachineEvent {
    ConnectionRequested,
    ConnectionSucceeded(
        Arc<dyn StreamTransport>,
        oneshot::Receiver<Result<(), String>>,
    ),
    ConnectionTimedOut,
    ConnectionFailed(String),
    ConnectionTerminated,
    BackoffExpired,
    Shutdown,
}

impl Debug for StateMachineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionRequested => "ConnectionRequested",
            Self::ConnectionSucceeded(..) => "ConnectionSucceeded",
            Self::ConnectionTimedOut => "ConnectionTimedOut",
            Self::ConnectionFailed(_) => "ConnectionFailed",
            Self::ConnectionTerminated => "ConnectionTerminated",
            Self::BackoffExpired => "BackoffExpired",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(s)
    }
}

pub(crate) struct InternalSubchannel {
    key: SubchannelKey,
    transport: Arc<dyn Transport>,
    backoff: Arc<ExponentialBackoff>,
    health_check: Option<HealthCheckConfig>,
    unregister_fn: Mutex<Option<Box<dyn FnOnce(SubchannelKey) + Send + Sync>>>,
    event_tx: mpsc::UnboundedSender<StateMachineEvent>,
    inner: Mutex<InnerSubchannel>,
    runtime: SharedRuntime,
}

struct InnerSubchannel {
    state: InternalState,
    watchers: Vec<Arc<dyn SubchannelWatcher>>,
}

impl InternalSubchannel {
    pub(crate) fn new(
        key: SubchannelKey,
        transport: Arc<dyn Transport>,
        backoff: Arc<ExponentialBackoff>,
        health_check: Option<HealthCheckConfig>,
        unregister_fn: Box<dyn FnOnce(SubchannelKey) + Send + Sync>,
        runtime: SharedRuntime,
    ) -> Arc<InternalSubchannel> {
        let (tx, mut rx) = mpsc::unbounded_channel::<StateMachineEvent>();
        let isc = Arc::new(Self {
            key: key.clone(),
            transport,
            backoff,
            health_check,
            unregister_fn: Mutex::new(Some(unregister_fn)),
            event_tx: tx,
            inner: Mutex::new(InnerSubchannel {
                state: InternalState::Idle,
                watchers: Vec::new(),
            }),
            runtime: runtime.clone(),
        });

        // This long running task implements the subchannel state machine.
        // When the subchannel is dropped, the channel from which this task
        // reads is closed, and therefore the task exits because rx.recv()
        // returns None.
        let weak = Arc::downgrade(&isc);
        runtime.spawn(Box::pin(async move {
            trace!(subchannel = %key, "starting subchannel state machine");
            while let Some(event) = rx.recv().await {
                let Some(isc) = weak.upgrade() else { break };
                trace!(subchannel = %isc.key, event = ?event, "subchannel event");
                match event {
                    StateMachineEvent::ConnectionRequested => isc.move_to_connecting(),
                    StateMachineEvent::ConnectionSucceeded(svc, closed_rx) => {
                        isc.move_to_ready(svc, closed_rx)
                    }
                    StateMachineEvent::ConnectionTimedOut => {
                        isc.move_to_transient_failure("connect timeout expired".to_string())
                    }
                    StateMachineEvent::ConnectionFailed(err) => isc.move_to_transient_failure(err),
                    StateMachineEvent::ConnectionTerminated => isc.move_to_idle(),
                    StateMachineEvent::BackoffExpired => isc.move_to_idle(),
                    StateMachineEvent::Shutdown => {
                        isc.move_to_shutdown();
                        break;
                    }
                }
            }
            trace!("exiting subchannel state machine");
        }));
        isc
    }

    pub(crate) fn address(&self) -> Address {
        self.key.address.clone()
    }

    pub(crate) fn connected_transport(&self) -> Option<Arc<dyn StreamTransport>> {
        self.inner.lock().unwrap().state.connected_transport()
    }

    /// Begins connecting asynchronously. A no-op unless the subchannel is
    /// IDLE: in TRANSIENT_FAILURE the current backoff must expire first (the
    /// subchannel then reports IDLE and a new request proceeds).
    pub(crate) fn request_connection(&self) {
        let inner = self.inner.lock().unwrap();
        if let InternalState::Idle = inner.state {
            let _ = self.event_tx.send(StateMachineEvent::ConnectionRequested);
        }
    }

    /// Sets the next connection attempt's delay to zero. Does not itself
    /// trigger an attempt.
    pub(crate) fn reset_backoff(&self) {
        self.backoff.skip_next();
    }

    /// Terminal: closes any transport and reports SHUTDOWN.
    pub(crate) fn shutdown(&self) {
        let _ = self.event_tx.send(StateMachineEvent::Shutdown);
    }

    pub(crate) fn register_watcher(&self, watcher: Arc<dyn SubchannelWatcher>) {
        let state = {
            let mut inner = self.inner.lock().unwrap();
            inner.watchers.push(watcher.clone());
            inner.state.to_subchannel_state()
        };
        watcher.on_state_change(state);
    }

    pub(crate) fn unregister_watcher(&self, watcher: &Arc<dyn SubchannelWatcher>) {
        self.inner
            .lock()
            .unwrap()
            .watchers
            .retain(|w| !Arc::ptr_eq(w, watcher));
    }

    fn notify_watchers(&self, state: SubchannelState) {
        let watchers = self.inner.lock().unwrap().watchers.clone();
        for w in &watchers {
            w.on_state_change(state.clone());
        }
    }

    fn set_state(&self, state: InternalState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let InternalState::Shutdown = inner.state {
            return false;
        }
        inner.state = state;
        true
    }

    fn move_to_idle(&self) {
        if !self.set_state(InternalState::Idle) {
            return;
        }
        self.notify_watchers(SubchannelState {
            connectivity_state: ConnectivityState::Idle,
            last_connection_error: None,
        });
    }

    fn move_to_connecting(&self) {
        {
            // A second ConnectionRequested racing the first is a no-op.
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.state, InternalState::Idle) {
                return;
            }
        }
        if !self.set_state(InternalState::Connecting { task: None }) {
            return;
        }
        self.notify_watchers(SubchannelState {
            connectivity_state: ConnectivityState::Connecting,
            last_connection_error: None,
        });

        let min_connect_timeout = self.backoff.min_connect_timeout();
        let transport = self.transport.clone();
        let address = self.address().address;
        let event_tx = self.event_tx.clone();
        let health_check = self.health_check.clone();
        let runtime = self.runtime.clone();
        let opts = TransportOptions {
            connect_deadline: Some(Instant::now() + min_connect_timeout),
            tcp_nodelay: true,
            ..Default::default()
        };

        let connect_task = self.runtime.spawn(Box::pin(async move {
            let sleep = runtime.sleep(min_connect_timeout);
            tokio::select! {
                _ = sleep => {
                    let _ = event_tx.send(StateMachineEvent::ConnectionTimedOut);
                }
                result = connect_and_health_check(
                    transport, address, runtime.clone(), opts, health_check) => {
                    match result {
                        Ok((svc, closed_rx)) => {
                            let _ = event_tx
                                .send(StateMachineEvent::ConnectionSucceeded(svc, closed_rx));
                        }
                        Err(e) => {
                            let _ = event_tx.send(StateMachineEvent::ConnectionFailed(e));
                        }
                    }
                }
            }
        }));
        self.set_state(InternalState::Connecting {
            task: Some(connect_task),
        });
    }

    fn move_to_ready(
        &self,
        transport: Arc<dyn StreamTransport>,
        closed_rx: oneshot::Receiver<Result<(), String>>,
    ) {
        // A successful attempt resets the backoff schedule.
        self.backoff.reset();

        if !self.set_state(InternalState::Ready {
            transport: transport.clone(),
            monitor_task: None,
        }) {
            return;
        }
        self.notify_watchers(SubchannelState {
            connectivity_state: ConnectivityState::Ready,
            last_connection_error: None,
        });

        let event_tx = self.event_tx.clone();
        let monitor_task = self.runtime.spawn(Box::pin(async move {
            if let Ok(Err(e)) = closed_rx.await {
                debug!("transport closed with error: {e}");
            }
            let _ = event_tx.send(StateMachineEvent::ConnectionTerminated);
        }));
        self.set_state(InternalState::Ready {
            transport,
            monitor_task: Some(monitor_task),
        });
    }

    fn move_to_transient_failure(&self, error: String) {
        if !self.set_state(InternalState::TransientFailure {
            backoff_task: None,
            error: error.clone(),
        }) {
            return;
        }

        let err: Arc<dyn Error + Send + Sync> = Arc::from(Box::from(error.clone()));
        self.notify_watchers(SubchannelState {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(err),
        });

        let delay = self.backoff.backoff_duration();
        let event_tx = self.event_tx.clone();
        let runtime = self.runtime.clone();
        let backoff_task = self.runtime.spawn(Box::pin(async move {
            runtime.sleep(delay).await;
            let _ = event_tx.send(StateMachineEvent::BackoffExpired);
        }));
        self.set_state(InternalState::TransientFailure {
            backoff_task: Some(backoff_task),
            error,
        });
    }

    fn move_to_shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = InternalState::Shutdown;
        }
        self.notify_watchers(SubchannelState {
            connectivity_state: ConnectivityState::Shutdown,
            last_connection_error: None,
        });
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        if let Some(unregister_fn) = self.unregister_fn.lock().unwrap().take() {
            unregister_fn(self.key.clone());
        }
    }
}

async fn connect_and_health_check(
    transport: Arc<dyn Transport>,
    address: String,
    runtime: SharedRuntime,
    opts: TransportOptions,
    health_check: Option<HealthCheckConfig>,
) -> Result<
    (
        Arc<dyn StreamTransport>,
        oneshot::Receiver<Result<(), String>>,
    ),
    String,
> {
    let connected = transport.connect(address, runtime, &opts).await?;
    if let Some(config) = health_check {
        health::wait_until_serving(connected.transport.as_ref(), &config.service_name).await?;
    }
    Ok((connected.transport, connected.disconnection_listener))
}

pub(crate) mod health {
    //! The client side of the standard health-watch protocol.
    //!
    //! Messages cross the core as opaque bytes, so the two tiny messages this
    //! needs are encoded by hand rather than through a codec: a
    //! HealthCheckRequest carrying the service name in field 1, and a
    //! HealthCheckResponse carrying the serving status varint in field 1.

    use super::*;

    pub(crate) const HEALTH_WATCH_PATH: &str = "/grpc.health.v1.Health/Watch";

    pub(crate) const SERVING: u64 = 1;

    pub(crate) fn encode_request(service: &str) -> Bytes {
        let name = service.as_bytes();
        if name.is_empty() {
            return Bytes::new();
        }
        debug_assert!(name.len() < 128);
        let mut buf = BytesMut::with_capacity(2 + name.len());
        buf.put_u8(0x0a); // field 1, length-delimited
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        buf.freeze()
    }

    pub(crate) fn decode_status(message: &[u8]) -> u64 {
        // field 1, varint; absent means UNKNOWN(0).
        if message.len() >= 2 && message[0] == 0x08 {
            let mut value: u64 = 0;
            let mut shift = 0;
            for &b in &message[1..] {
                value |= u64::from(b & 0x7f) << shift;
                if b & 0x80 == 0 {
                    return value;
                }
                shift += 7;
            }
        }
        0
    }

    /// Opens a watch stream and resolves once the peer reports SERVING, or
    /// fails when the stream ends or reports any other state.
    pub(crate) async fn wait_until_serving(
        transport: &dyn StreamTransport,
        service: &str,
    ) -> Result<(), String> {
        let head = ClientStreamHead {
            path: HEALTH_WATCH_PATH.to_string(),
            authority: transport.peer(),
            timeout: None,
            metadata: Metadata::new(),
        };
        let mut stream = transport
            .open_stream(head)
            .await
            .map_err(|s| format!("health watch stream failed: {s}"))?;
        stream
            .send
            .send_message(encode_request(service))
            .await
            .map_err(|s| format!("health watch send failed: {s}"))?;
        stream
            .recv
            .initial_metadata()
            .await
            .map_err(|s| format!("health watch failed: {s}"))?;
        match stream.recv.message().await {
            Ok(Some(message)) if decode_status(&message) == SERVING => Ok(()),
            Ok(Some(message)) => Err(format!(
                "health watch reported non-serving status {}",
                decode_status(&message)
            )),
            Ok(None) => Err("health watch stream ended".to_string()),
            Err(status) => Err(format!("health watch failed: {status}")),
        }
    }
}

// SubchannelKey uniquely identifies a subchannel in the pool.
#[derive(PartialEq, PartialOrd, Eq, Ord, Clone)]
pub(crate) struct SubchannelKey {
    address: Address,
    args_fingerprint: u64,
}

impl SubchannelKey {
    pub(crate) fn new(address: Address, args_fingerprint: u64) -> Self {
        Self {
            address,
            args_fingerprint,
        }
    }
}

impl Display for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:x}", self.address, self.args_fingerprint)
    }
}

impl Debug for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A pool of internal subchannels, shared by every channel that did not opt
/// out. Entries are weak: the last LB handle going away removes the entry.
pub(crate) struct SubchannelPool {
    subchannels: RwLock<BTreeMap<SubchannelKey, Weak<InternalSubchannel>>>,
}

impl SubchannelPool {
    pub(crate) fn new() -> Self {
        Self {
            subchannels: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn lookup(&self, key: &SubchannelKey) -> Option<Arc<InternalSubchannel>> {
        self.subchannels
            .read()
            .unwrap()
            .get(key)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn register(
        &self,
        key: &SubchannelKey,
        isc: Arc<InternalSubchannel>,
    ) -> Arc<InternalSubchannel> {
        trace!(key = %key, "registering subchannel with the pool");
        self.subchannels
            .write()
            .unwrap()
            .insert(key.clone(), Arc::downgrade(&isc));
        isc
    }

    pub(crate) fn unregister(&self, key: &SubchannelKey) {
        let mut subchannels = self.subchannels.write().unwrap();
        match subchannels.get(key) {
            Some(weak) if weak.upgrade().is_some() => {
                // Re-registered concurrently; leave the live entry alone.
            }
            Some(_) => {
                trace!(key = %key, "removing subchannel from the pool");
                subchannels.remove(key);
            }
            None => {
                warn!(key = %key, "attempt to unregister unknown subchannel");
            }
        }
    }
}

pub(crate) static GLOBAL_SUBCHANNEL_POOL: LazyLock<Arc<SubchannelPool>> =
    LazyLock::new(|| Arc::new(SubchannelPool::new()));

// ===== the LB-facing handle =====

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(0);

struct SubchannelInner {
    id: u64,
    isc: Arc<InternalSubchannel>,
    watcher: Mutex<Option<Arc<dyn SubchannelWatcher>>>,
}

impl Drop for SubchannelInner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            self.isc.unregister_watcher(&watcher);
        }
    }
}

/// A `Subchannel` represents a method of communicating with a server which
/// may be connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
/// - IDLE transitions to CONNECTING when `connect` is called.
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on
///   error.
/// - READY transitions to IDLE when the connection is lost.
/// - TRANSIENT_FAILURE transitions to IDLE once the reconnect backoff timer
///   expires, after which a new `connect` call may be made. The timer scales
///   exponentially and is reset when the subchannel becomes READY.
///
/// When the last clone of a `Subchannel` is dropped, its watcher is
/// unregistered and no subsequent state updates are delivered for it.
#[derive(Clone)]
pub struct Subchannel {
    inner: Arc<SubchannelInner>,
}

impl Subchannel {
    pub(crate) fn new(isc: Arc<InternalSubchannel>) -> Self {
        Self {
            inner: Arc::new(SubchannelInner {
                id: NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                isc,
                watcher: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn attach_watcher(&self, watcher: Arc<dyn SubchannelWatcher>) {
        let prev = self.inner.watcher.lock().unwrap().replace(watcher.clone());
        debug_assert!(prev.is_none(), "subchannel watcher attached twice");
        self.inner.isc.register_watcher(watcher);
    }

    /// Begins connecting; a no-op unless the subchannel is IDLE.
    pub fn connect(&self) {
        self.inner.isc.request_connection();
    }

    /// The resolved address this subchannel connects to.
    pub fn address(&self) -> Address {
        self.inner.isc.address()
    }

    pub(crate) fn connected_transport(&self) -> Option<Arc<dyn StreamTransport>> {
        self.inner.isc.connected_transport()
    }

    pub(crate) fn reset_backoff(&self) {
        self.inner.isc.reset_backoff();
    }

    pub(crate) fn downgrade(&self) -> WeakSubchannel {
        WeakSubchannel {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A non-owning reference to a [`Subchannel`], used by watchers so a pending
/// notification does not keep a dropped handle alive.
pub(crate) struct WeakSubchannel {
    inner: Weak<SubchannelInner>,
}

impl WeakSubchannel {
    pub(crate) fn upgrade(&self) -> Option<Subchannel> {
        self.inner.upgrade().map(|inner| Subchannel { inner })
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Subchannel {}

impl std::hash::Hash for Subchannel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Display for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subchannel({}, {})", self.inner.id, self.address())
    }
}

impl Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
