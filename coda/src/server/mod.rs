//! The server core: accepts inbound transports, demultiplexes each inbound
//! stream onto a registered method (or the generic handler), and pairs each
//! stream with an application-posted request-call tag.
//!
//! Construction follows the builder pattern: declare listening endpoints,
//! register methods, attach completion queues, then `build_and_start`. A
//! matched stream materialises as a server-side [`Call`] and the posted tag
//! fires on its completion queue with `ok=true`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::call::driver::{start_server_driver, ServerCallConfig};
use crate::call::{self, Call, CallInner, Side};
use crate::completion::{CompletionQueue, Tag};
use crate::metadata::Metadata;
use crate::rt::{default_runtime, sleep_until, BoxedTaskHandle, SharedRuntime};
use crate::transport::{http2, BindOptions, InboundTransport, Listener, ServerStream};
use crate::Status;

/// How the core treats the first request message of a registered method.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PayloadHandling {
    /// Messages are read by the application through `recv_message` ops.
    #[default]
    None,
    /// The first request message is read before the request-call tag fires
    /// and delivered alongside the call.
    PreRead,
}

/// Identifies a registered method on a server.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegisteredMethodId(usize);

/// Describes one method of a service for bulk registration.
pub struct MethodDesc {
    pub name: String,
    pub payload_handling: PayloadHandling,
    pub idempotent: bool,
}

/// The call data delivered to a matched request-call tag.
pub struct ServerCall {
    pub call: Call,
    /// The full method path of the inbound stream.
    pub path: String,
    pub authority: Option<String>,
    pub deadline: Option<Instant>,
    /// The client's leading metadata.
    pub metadata: Metadata,
    /// The pre-read first message, for methods registered with
    /// [`PayloadHandling::PreRead`].
    pub payload: Option<Bytes>,
    pub peer: String,
}

/// Receives the [`ServerCall`] when a posted request-call tag is matched.
#[derive(Clone, Default)]
pub struct ServerCallSlot(Arc<Mutex<Option<ServerCall>>>);

impl ServerCallSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<ServerCall> {
        self.0.lock().unwrap().take()
    }

    fn set(&self, call: ServerCall) {
        *self.0.lock().unwrap() = Some(call);
    }
}

/// Errors from posting a request-call tag.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestCallError {
    /// The completion queue was not created with
    /// [`CompletionQueue::for_server`].
    NotAServerQueue,
    /// The completion queue was not attached to this server at build time.
    UnattachedQueue,
    /// The server has no generic handler registered.
    NoGenericHandler,
}

impl fmt::Display for RequestCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RequestCallError::NotAServerQueue => {
                "completion queue does not accept server request calls"
            }
            RequestCallError::UnattachedQueue => "completion queue is not attached to this server",
            RequestCallError::NoGenericHandler => "no generic handler was registered",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for RequestCallError {}

#[derive(Clone)]
struct PostedTag {
    cq: CompletionQueue,
    tag: Tag,
    slot: ServerCallSlot,
}

#[derive(Default)]
struct MethodQueue {
    parked_streams: VecDeque<ServerStream>,
    pending_tags: VecDeque<PostedTag>,
}

struct MethodEntry {
    path: String,
    host: Option<String>,
    payload_handling: PayloadHandling,
    #[allow(dead_code)]
    idempotent: bool,
    queue: Mutex<MethodQueue>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Serving,
    ShuttingDown,
    Stopped,
}

struct ServerInner {
    methods: Vec<MethodEntry>,
    lookup: HashMap<(String, Option<String>), usize>,
    generic: Option<MethodEntry>,
    cqs: Vec<CompletionQueue>,
    max_send_message_size: usize,
    runtime: SharedRuntime,
    local_addrs: Vec<String>,
    phase: watch::Sender<Phase>,
    /// Accept loops over the listening endpoints; aborted at shutdown.
    listener_tasks: Mutex<Vec<BoxedTaskHandle>>,
    /// Stream-accept loops, one per live transport. These are not aborted at
    /// shutdown: they observe GOAWAY and drain on their own.
    transport_tasks: Mutex<Vec<BoxedTaskHandle>>,
    goaways: Mutex<Vec<watch::Sender<bool>>>,
    active_calls: Mutex<Vec<Weak<CallInner>>>,
}

/// A running server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Builds a [`Server`].
pub struct ServerBuilder {
    methods: Vec<MethodEntry>,
    generic: bool,
    cqs: Vec<CompletionQueue>,
    addrs: Vec<String>,
    listeners: Vec<Box<dyn Listener>>,
    reuse_port: bool,
    max_send_message_size: usize,
    max_recv_message_size: usize,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            methods: Vec::new(),
            generic: false,
            cqs: Vec::new(),
            addrs: Vec::new(),
            listeners: Vec::new(),
            reuse_port: true,
            max_send_message_size: call::DEFAULT_MAX_SEND_MESSAGE_SIZE,
            max_recv_message_size: call::DEFAULT_MAX_RECV_MESSAGE_SIZE,
        }
    }
}

impl ServerBuilder {
    /// Registers a method by its full path (`/service/method`), optionally
    /// bound to a specific `:authority`.
    pub fn register_method(
        &mut self,
        path: &str,
        host: Option<&str>,
        payload_handling: PayloadHandling,
        idempotent: bool,
    ) -> RegisteredMethodId {
        let id = RegisteredMethodId(self.methods.len());
        self.methods.push(MethodEntry {
            path: path.to_string(),
            host: host.map(str::to_string),
            payload_handling,
            idempotent,
            queue: Mutex::new(MethodQueue::default()),
        });
        id
    }

    /// Registers every method of a service under `/{service}/{method}`.
    pub fn register_service(
        &mut self,
        service: &str,
        methods: impl IntoIterator<Item = MethodDesc>,
    ) -> Vec<RegisteredMethodId> {
        methods
            .into_iter()
            .map(|m| {
                self.register_method(
                    &format!("/{service}/{}", m.name),
                    None,
                    m.payload_handling,
                    m.idempotent,
                )
            })
            .collect()
    }

    /// Registers the generic handler: inbound streams matching no registered
    /// method are delivered to generic request-call tags instead of being
    /// rejected with `Unimplemented`.
    pub fn register_generic_handler(&mut self) -> &mut Self {
        self.generic = true;
        self
    }

    /// Attaches a completion queue. Only attached queues may be used with
    /// `request_call`.
    pub fn attach_completion_queue(&mut self, cq: &CompletionQueue) -> &mut Self {
        self.cqs.push(cq.clone());
        self
    }

    /// Declares a TCP listening endpoint, e.g. `"127.0.0.1:50051"`.
    pub fn add_listening_port(&mut self, addr: &str) -> &mut Self {
        self.addrs.push(addr.to_string());
        self
    }

    /// Adds a pre-built listener, e.g. an [`crate::inmemory::Listener`].
    pub fn add_listener(&mut self, listener: impl Listener + 'static) -> &mut Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Controls SO_REUSEPORT on TCP listening ports. Defaults to on; with it
    /// off, a second server binding the same port fails to start.
    pub fn reuse_port(&mut self, enabled: bool) -> &mut Self {
        self.reuse_port = enabled;
        self
    }

    pub fn max_send_message_size(&mut self, limit: usize) -> &mut Self {
        self.max_send_message_size = limit;
        self
    }

    pub fn max_recv_message_size(&mut self, limit: usize) -> &mut Self {
        self.max_recv_message_size = limit;
        self
    }

    /// Binds the listening endpoints and starts accepting inbound
    /// transports.
    pub async fn build_and_start(mut self) -> Result<Server, crate::Error> {
        let runtime = default_runtime();
        let mut listeners = std::mem::take(&mut self.listeners);
        for addr in &self.addrs {
            let listener = http2::bind(
                addr,
                BindOptions {
                    reuse_port: self.reuse_port,
                    max_recv_message_size: self.max_recv_message_size,
                },
            )
            .await?;
            listeners.push(listener);
        }

        let mut lookup = HashMap::new();
        for (i, m) in self.methods.iter().enumerate() {
            lookup.insert((m.path.clone(), m.host.clone()), i);
        }
        let local_addrs: Vec<String> = listeners.iter().map(|l| l.local_addr()).collect();

        let inner = Arc::new(ServerInner {
            methods: self.methods,
            lookup,
            generic: self.generic.then(|| MethodEntry {
                path: String::new(),
                host: None,
                payload_handling: PayloadHandling::None,
                idempotent: false,
                queue: Mutex::new(MethodQueue::default()),
            }),
            cqs: self.cqs,
            max_send_message_size: self.max_send_message_size,
            runtime: runtime.clone(),
            local_addrs,
            phase: watch::Sender::new(Phase::Serving),
            listener_tasks: Mutex::new(Vec::new()),
            transport_tasks: Mutex::new(Vec::new()),
            goaways: Mutex::new(Vec::new()),
            active_calls: Mutex::new(Vec::new()),
        });

        for mut listener in listeners {
            let accept_inner = Arc::downgrade(&inner);
            let task = runtime.spawn(Box::pin(async move {
                while let Some(transport) = listener.accept().await {
                    let Some(inner) = accept_inner.upgrade() else { return };
                    if *inner.phase.borrow() != Phase::Serving {
                        return;
                    }
                    trace!("accepted inbound transport");
                    inner.clone().spawn_transport(transport);
                }
            }));
            inner.listener_tasks.lock().unwrap().push(task);
        }

        Ok(Server { inner })
    }
}

impl Server {
    /// Posts a request-call tag for a registered method. When an inbound
    /// stream for that method is matched, `slot` receives the call and `tag`
    /// fires on `cq` with `ok=true`.
    pub fn request_call(
        &self,
        method: RegisteredMethodId,
        cq: &CompletionQueue,
        tag: Tag,
        slot: ServerCallSlot,
    ) -> Result<(), RequestCallError> {
        self.inner.check_queue(cq)?;
        let entry = &self.inner.methods[method.0];
        self.inner.post_tag(entry, cq, tag, slot);
        Ok(())
    }

    /// Posts a request-call tag for the generic handler.
    pub fn request_generic_call(
        &self,
        cq: &CompletionQueue,
        tag: Tag,
        slot: ServerCallSlot,
    ) -> Result<(), RequestCallError> {
        self.inner.check_queue(cq)?;
        let entry = self
            .inner
            .generic
            .as_ref()
            .ok_or(RequestCallError::NoGenericHandler)?;
        self.inner.post_tag(entry, cq, tag, slot);
        Ok(())
    }

    /// Stops accepting new streams, sends GOAWAY on live transports, and
    /// waits for outstanding calls to complete until `deadline`, after which
    /// the survivors are cancelled.
    pub async fn shutdown(&self, deadline: Option<Instant>) {
        let inner = &self.inner;
        let initiated = inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Serving {
                *phase = Phase::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !initiated {
            // A concurrent shutdown is in progress (or done); just wait.
            self.wait().await;
            return;
        }
        debug!("server shutting down");

        // Stop accepting: drop the listener tasks, then GOAWAY live
        // transports so their stream loops drain.
        for task in inner.listener_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for goaway in inner.goaways.lock().unwrap().iter() {
            let _ = goaway.send(true);
        }

        // Unmatched request-call tags fire with ok=false; parked streams are
        // refused.
        let entries = inner.methods.iter().chain(inner.generic.iter());
        for entry in entries {
            let mut queue = entry.queue.lock().unwrap();
            for posted in queue.pending_tags.drain(..) {
                posted.cq.enqueue(posted.tag, false);
            }
            for mut stream in queue.parked_streams.drain(..) {
                inner.runtime.spawn(Box::pin(async move {
                    let _ = stream
                        .send
                        .send_status(&Status::unavailable("server shutting down"), Metadata::new())
                        .await;
                }));
            }
        }

        inner.drain_calls(deadline).await;
        let _ = inner.phase.send(Phase::Stopped);
    }

    /// Blocks until the server has fully stopped.
    pub async fn wait(&self) {
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == Phase::Stopped).await;
    }

    /// The bound addresses of this server's listening endpoints, in the
    /// order they were declared (pre-built listeners first).
    pub fn local_addrs(&self) -> &[String] {
        &self.inner.local_addrs
    }
}

impl ServerInner {
    fn check_queue(&self, cq: &CompletionQueue) -> Result<(), RequestCallError> {
        if !cq.accepts_request_calls() {
            return Err(RequestCallError::NotAServerQueue);
        }
        if !self.cqs.iter().any(|attached| attached.same_queue(cq)) {
            return Err(RequestCallError::UnattachedQueue);
        }
        Ok(())
    }

    fn post_tag(self: &Arc<Self>, entry: &MethodEntry, cq: &CompletionQueue, tag: Tag, slot: ServerCallSlot) {
        cq.register_source();
        let posted = PostedTag {
            cq: cq.clone(),
            tag,
            slot,
        };
        if *self.phase.borrow() != Phase::Serving {
            posted.cq.enqueue(posted.tag, false);
            return;
        }
        let stream = {
            let mut queue = entry.queue.lock().unwrap();
            match queue.parked_streams.pop_front() {
                Some(stream) => Some(stream),
                None => {
                    queue.pending_tags.push_back(posted.clone());
                    None
                }
            }
        };
        if let Some(stream) = stream {
            self.materialize(stream, posted, entry.payload_handling);
        }
    }

    fn spawn_transport(self: Arc<Self>, mut transport: Box<dyn InboundTransport>) {
        let goaway_tx = watch::Sender::new(false);
        let mut goaway_rx = goaway_tx.subscribe();
        self.goaways.lock().unwrap().push(goaway_tx);

        let inner = Arc::downgrade(&self);
        let runtime = self.runtime.clone();
        let task = runtime.spawn(Box::pin(async move {
            let mut sent_goaway = false;
            loop {
                let stream = if sent_goaway {
                    // Keep draining whatever was already in flight on the
                    // connection.
                    transport.accept_stream().await
                } else {
                    tokio::select! {
                        stream = transport.accept_stream() => stream,
                        _ = goaway_rx.wait_for(|g| *g) => {
                            transport.goaway();
                            sent_goaway = true;
                            continue;
                        }
                    }
                };
                let Some(stream) = stream else { return };
                let Some(inner) = inner.upgrade() else { return };
                inner.dispatch(stream);
            }
        }));
        self.transport_tasks.lock().unwrap().push(task);
    }

    /// Classifies an inbound stream: exact (path, host) match, then
    /// host-wildcard path match, then the generic handler, then
    /// `Unimplemented`.
    fn dispatch(self: &Arc<Self>, stream: ServerStream) {
        let path = stream.head.path.clone();
        let host = stream.head.authority.clone();

        let entry = host
            .as_ref()
            .and_then(|h| self.lookup.get(&(path.clone(), Some(h.clone()))))
            .or_else(|| self.lookup.get(&(path.clone(), None)))
            .map(|&i| &self.methods[i])
            .or(self.generic.as_ref());

        let Some(entry) = entry else {
            trace!(path = %path, "no handler for inbound stream");
            let mut stream = stream;
            self.runtime.spawn(Box::pin(async move {
                let _ = stream
                    .send
                    .send_status(
                        &Status::unimplemented(format!("method {path} is not implemented")),
                        Metadata::new(),
                    )
                    .await;
            }));
            return;
        };

        let mut queue = entry.queue.lock().unwrap();
        match queue.pending_tags.pop_front() {
            Some(posted) => {
                drop(queue);
                self.materialize(stream, posted, entry.payload_handling);
            }
            None => queue.parked_streams.push_back(stream),
        }
    }

    /// Turns a matched stream into a server-side call and fires the tag.
    fn materialize(
        self: &Arc<Self>,
        mut stream: ServerStream,
        posted: PostedTag,
        payload_handling: PayloadHandling,
    ) {
        let inner = self.clone();
        self.runtime.spawn(Box::pin(async move {
            let payload = match payload_handling {
                PayloadHandling::None => None,
                PayloadHandling::PreRead => match stream.recv.message().await {
                    Ok(payload) => payload,
                    Err(status) => {
                        warn!(code = ?status.code(), "failed to pre-read request payload");
                        stream.send.reset(crate::Code::Internal);
                        posted.cq.enqueue(posted.tag, false);
                        return;
                    }
                },
            };

            let (call, send_rx, recv_rx) = Call::new(
                Side::Server,
                stream.head.path.clone(),
                posted.cq.clone(),
                stream.head.deadline,
                inner.runtime.clone(),
            );
            let server_call = ServerCall {
                path: stream.head.path.clone(),
                authority: stream.head.authority.clone(),
                deadline: stream.head.deadline,
                metadata: stream.head.metadata.clone(),
                payload,
                peer: stream.head.peer.clone(),
                call: call.clone(),
            };
            start_server_driver(
                call.inner(),
                stream,
                ServerCallConfig {
                    max_send_message_size: inner.max_send_message_size,
                },
                send_rx,
                recv_rx,
            );
            inner
                .active_calls
                .lock()
                .unwrap()
                .push(Arc::downgrade(call.inner()));
            posted.slot.set(server_call);
            posted.cq.enqueue(posted.tag, true);
        }));
    }

    async fn drain_calls(&self, deadline: Option<Instant>) {
        let calls: Vec<Arc<CallInner>> = self
            .active_calls
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for call in &calls {
            if call.completed.get().is_some() {
                continue;
            }
            let expired = match deadline {
                None => {
                    call.completed.wait().await;
                    false
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = call.completed.wait() => false,
                        _ = sleep_until(&self.runtime, deadline) => true,
                    }
                }
            };
            if expired {
                // Deadline hit: cancel this call and every remaining one.
                for call in &calls {
                    if call.completed.get().is_none() {
                        call.cancel(Status::cancelled("server shutdown"));
                    }
                }
                break;
            }
        }
    }
}
