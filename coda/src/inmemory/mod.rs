//! An in-process transport: channel-backed connections between a client
//! channel and a server in the same binary, registered under the
//! `inmemory:///` scheme. Messages still cross the 5-byte framing layer so
//! the full wire path is exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Once};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::client::name_resolution::{
    self, Address, Endpoint, Resolver, ResolverBuilder, ResolverController, ResolverOptions,
    ResolverUpdate, Target,
};
use crate::codec::{encode_frame, FrameDecoder};
use crate::metadata::Metadata;
use crate::rt::SharedRuntime;
use crate::transport::{
    self, ClientStreamHead, ConnectedTransport, InboundTransport, ServerRecvHalf, ServerSendHalf,
    ServerStream, ServerStreamHead, StreamRecvHalf, StreamSendHalf, TransportOptions,
    TransportStream, GLOBAL_TRANSPORT_REGISTRY,
};
use crate::{Code, Status};

pub(crate) static INMEMORY_NETWORK_TYPE: &str = "inmemory";

const FRAME_WINDOW: usize = 8;

enum ClientFrame {
    Message(Bytes),
    HalfClose,
}

enum ServerFrame {
    Headers(Metadata),
    Message(Bytes),
    Trailers(Status, Metadata),
}

struct ListenerCore {
    id: String,
    conn_tx: mpsc::UnboundedSender<AcceptedConn>,
    closed: watch::Sender<bool>,
}

struct AcceptedConn {
    stream_rx: mpsc::UnboundedReceiver<ServerStream>,
    goaway: Arc<AtomicBool>,
    goaway_tx: watch::Sender<bool>,
}

static LISTENERS: LazyLock<Mutex<HashMap<String, Arc<ListenerCore>>>> =
    LazyLock::new(Mutex::default);

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// An in-process listening endpoint. Hand it to a server and dial it with a
/// channel whose target is [`Listener::target`].
pub struct Listener {
    core: Arc<ListenerCore>,
    conn_rx: mpsc::UnboundedReceiver<AcceptedConn>,
}

impl Listener {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        reg();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ListenerCore {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed).to_string(),
            conn_tx,
            closed: watch::Sender::new(false),
        });
        LISTENERS
            .lock()
            .unwrap()
            .insert(core.id.clone(), core.clone());
        Listener { core, conn_rx }
    }

    /// The channel target that resolves to this listener.
    pub fn target(&self) -> String {
        format!("inmemory:///{}", self.core.id)
    }

    pub fn id(&self) -> String {
        self.core.id.clone()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        LISTENERS.lock().unwrap().remove(&self.core.id);
        let _ = self.core.closed.send(true);
    }
}

#[async_trait]
impl transport::Listener for Listener {
    async fn accept(&mut self) -> Option<Box<dyn InboundTransport>> {
        let conn = self.conn_rx.recv().await?;
        Some(Box::new(InMemoryInbound { conn }))
    }

    fn local_addr(&self) -> String {
        format!("inmemory:{}", self.core.id)
    }
}

struct InMemoryInbound {
    conn: AcceptedConn,
}

#[async_trait]
impl InboundTransport for InMemoryInbound {
    async fn accept_stream(&mut self) -> Option<ServerStream> {
        let mut goaway_rx = self.conn.goaway_tx.subscribe();
        tokio::select! {
            stream = self.conn.stream_rx.recv() => stream,
            _ = goaway_rx.wait_for(|g| *g) => None,
        }
    }

    fn goaway(&self) {
        self.conn.goaway.store(true, Ordering::SeqCst);
        let _ = self.conn.goaway_tx.send(true);
    }
}

// ===== client side =====

struct ClientTransport {}

#[async_trait]
impl transport::Transport for ClientTransport {
    async fn connect(
        &self,
        address: String,
        _runtime: SharedRuntime,
        opts: &TransportOptions,
    ) -> Result<ConnectedTransport, String> {
        let core = LISTENERS
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or(format!("could not find listener for address {address}"))?;

        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let goaway = Arc::new(AtomicBool::new(false));
        let conn = AcceptedConn {
            stream_rx,
            goaway: goaway.clone(),
            goaway_tx: watch::Sender::new(false),
        };
        core.conn_tx
            .send(conn)
            .map_err(|_| format!("listener for address {address} is closed"))?;

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let mut closed_rx = core.closed.subscribe();
        tokio::spawn(async move {
            let _ = closed_rx.wait_for(|c| *c).await;
            let _ = disconnect_tx.send(Ok(()));
        });

        Ok(ConnectedTransport {
            transport: Arc::new(InMemoryStreamTransport {
                peer: format!("inmemory:{}", core.id),
                stream_tx,
                goaway,
                max_recv_message_size: opts.max_recv_message_size,
            }),
            disconnection_listener: disconnect_rx,
        })
    }
}

struct InMemoryStreamTransport {
    peer: String,
    stream_tx: mpsc::UnboundedSender<ServerStream>,
    goaway: Arc<AtomicBool>,
    max_recv_message_size: usize,
}

#[async_trait]
impl transport::StreamTransport for InMemoryStreamTransport {
    async fn open_stream(&self, head: ClientStreamHead) -> Result<TransportStream, Status> {
        if self.goaway.load(Ordering::SeqCst) {
            return Err(Status::unavailable("connection is draining (GOAWAY)"));
        }
        let (client_tx, client_rx) = mpsc::channel::<ClientFrame>(FRAME_WINDOW);
        let (server_tx, server_rx) = mpsc::channel::<ServerFrame>(FRAME_WINDOW);
        let reset = Arc::new(watch::Sender::<Option<Code>>::new(None));

        let deadline = head.timeout.map(|t| Instant::now() + t);
        let server_stream = ServerStream {
            head: ServerStreamHead {
                path: head.path,
                authority: Some(head.authority),
                metadata: head.metadata,
                deadline,
                peer: "inmemory:client".to_string(),
            },
            send: Box::new(InMemoryServerSend {
                tx: server_tx,
                reset: reset.clone(),
                headers_sent: false,
                closed: false,
            }),
            recv: Box::new(InMemoryServerRecv {
                rx: client_rx,
                reset_rx: reset.subscribe(),
                decoder: FrameDecoder::new(crate::call::DEFAULT_MAX_RECV_MESSAGE_SIZE),
                eos: false,
            }),
        };
        self.stream_tx
            .send(server_stream)
            .map_err(|_| Status::unavailable("connection closed"))?;

        Ok(TransportStream {
            send: Box::new(InMemoryClientSend {
                tx: Some(client_tx),
                reset: reset.clone(),
            }),
            recv: Box::new(InMemoryClientRecv {
                rx: server_rx,
                reset_rx: reset.subscribe(),
                decoder: FrameDecoder::new(self.max_recv_message_size),
                trailers: None,
                eos: false,
            }),
        })
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

fn reset_status(code: Code) -> Status {
    Status::new(code, "stream reset by peer")
}

async fn wait_reset(reset_rx: &mut watch::Receiver<Option<Code>>) -> Status {
    match reset_rx.wait_for(|r| r.is_some()).await {
        Ok(code) => reset_status(code.unwrap()),
        Err(_) => reset_status(Code::Cancelled),
    }
}

struct InMemoryClientSend {
    tx: Option<mpsc::Sender<ClientFrame>>,
    reset: Arc<watch::Sender<Option<Code>>>,
}

#[async_trait]
impl StreamSendHalf for InMemoryClientSend {
    async fn send_message(&mut self, message: Bytes) -> Result<(), Status> {
        let Some(tx) = &self.tx else {
            return Err(Status::internal("send after half-close"));
        };
        tx.send(ClientFrame::Message(encode_frame(message)))
            .await
            .map_err(|_| Status::unavailable("stream closed"))
    }

    async fn half_close(&mut self) -> Result<(), Status> {
        let Some(tx) = self.tx.take() else {
            return Err(Status::internal("already half-closed"));
        };
        tx.send(ClientFrame::HalfClose)
            .await
            .map_err(|_| Status::unavailable("stream closed"))
    }

    fn reset(&mut self, code: Code) {
        self.tx = None;
        self.reset.send_if_modified(|r| {
            if r.is_none() {
                *r = Some(code);
                true
            } else {
                false
            }
        });
    }
}

struct InMemoryClientRecv {
    rx: mpsc::Receiver<ServerFrame>,
    reset_rx: watch::Receiver<Option<Code>>,
    decoder: FrameDecoder,
    trailers: Option<(Status, Metadata)>,
    eos: bool,
}

#[async_trait]
impl StreamRecvHalf for InMemoryClientRecv {
    async fn initial_metadata(&mut self) -> Result<Option<Metadata>, Status> {
        let frame = tokio::select! {
            frame = self.rx.recv() => frame,
            status = wait_reset(&mut self.reset_rx) => return Err(status),
        };
        match frame {
            Some(ServerFrame::Headers(md)) => Ok(Some(md)),
            Some(ServerFrame::Trailers(status, md)) => {
                self.trailers = Some((status, md));
                self.eos = true;
                Ok(None)
            }
            Some(ServerFrame::Message(_)) => {
                Err(Status::internal("protocol error: message before headers"))
            }
            None => Err(Status::unavailable("stream closed before headers")),
        }
    }

    async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if self.eos {
                return Ok(None);
            }
            if let Some(message) = self.decoder.next_frame()? {
                return Ok(Some(message));
            }
            let frame = tokio::select! {
                frame = self.rx.recv() => frame,
                status = wait_reset(&mut self.reset_rx) => return Err(status),
            };
            match frame {
                Some(ServerFrame::Message(chunk)) => self.decoder.extend(&chunk),
                Some(ServerFrame::Trailers(status, md)) => {
                    self.trailers = Some((status, md));
                    self.eos = true;
                    if !self.decoder.is_empty() {
                        return Err(Status::internal("truncated message before trailers"));
                    }
                    return Ok(None);
                }
                Some(ServerFrame::Headers(_)) => {
                    return Err(Status::internal("protocol error: duplicate headers"));
                }
                None => {
                    return Err(Status::unavailable("stream closed before trailers"));
                }
            }
        }
    }

    async fn trailers(&mut self) -> (Status, Metadata) {
        if let Some(trailers) = self.trailers.take() {
            return trailers;
        }
        // Drain until the trailers arrive.
        loop {
            match self.message().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    if let Some(trailers) = self.trailers.take() {
                        return trailers;
                    }
                    return (Status::unavailable("stream closed without status"), Metadata::new());
                }
                Err(status) => return (status, Metadata::new()),
            }
        }
    }
}

struct InMemoryServerSend {
    tx: mpsc::Sender<ServerFrame>,
    reset: Arc<watch::Sender<Option<Code>>>,
    headers_sent: bool,
    closed: bool,
}

#[async_trait]
impl ServerSendHalf for InMemoryServerSend {
    async fn send_initial_metadata(&mut self, metadata: Metadata) -> Result<(), Status> {
        if self.headers_sent {
            return Err(Status::internal("initial metadata already sent"));
        }
        self.headers_sent = true;
        self.tx
            .send(ServerFrame::Headers(metadata))
            .await
            .map_err(|_| Status::cancelled("stream closed by client"))
    }

    async fn send_message(&mut self, message: Bytes) -> Result<(), Status> {
        if !self.headers_sent {
            return Err(Status::internal("message sent before initial metadata"));
        }
        if self.closed {
            return Err(Status::internal("message sent after status"));
        }
        self.tx
            .send(ServerFrame::Message(encode_frame(message)))
            .await
            .map_err(|_| Status::cancelled("stream closed by client"))
    }

    async fn send_status(&mut self, status: &Status, trailers: Metadata) -> Result<(), Status> {
        if self.closed {
            return Err(Status::internal("status already sent"));
        }
        self.closed = true;
        self.tx
            .send(ServerFrame::Trailers(status.clone(), trailers))
            .await
            .map_err(|_| Status::cancelled("stream closed by client"))
    }

    fn reset(&mut self, code: Code) {
        self.closed = true;
        self.reset.send_if_modified(|r| {
            if r.is_none() {
                *r = Some(code);
                true
            } else {
                false
            }
        });
    }
}

struct InMemoryServerRecv {
    rx: mpsc::Receiver<ClientFrame>,
    reset_rx: watch::Receiver<Option<Code>>,
    decoder: FrameDecoder,
    eos: bool,
}

#[async_trait]
impl ServerRecvHalf for InMemoryServerRecv {
    async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if self.eos {
                return Ok(None);
            }
            if let Some(message) = self.decoder.next_frame()? {
                return Ok(Some(message));
            }
            let frame = tokio::select! {
                frame = self.rx.recv() => frame,
                status = wait_reset(&mut self.reset_rx) => return Err(status),
            };
            match frame {
                Some(ClientFrame::Message(chunk)) => self.decoder.extend(&chunk),
                Some(ClientFrame::HalfClose) => {
                    self.eos = true;
                    return Ok(None);
                }
                // The client went away without half-closing.
                None => return Err(Status::cancelled("stream reset by client")),
            }
        }
    }
}

// ===== registration =====

/// Registers the in-memory transport and its resolver. Idempotent; invoked
/// automatically when a [`Listener`] is created.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_TRANSPORT_REGISTRY.add_transport(INMEMORY_NETWORK_TYPE, ClientTransport {});
        name_resolution::global_registry().add_builder(Box::new(InMemoryResolverBuilder));
    });
}

struct InMemoryResolverBuilder;

impl ResolverBuilder for InMemoryResolverBuilder {
    fn scheme(&self) -> &'static str {
        "inmemory"
    }

    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let id = target
            .path()
            .strip_prefix('/')
            .unwrap_or(target.path())
            .to_string();
        options.work_scheduler.schedule_work();
        Box::new(InMemoryResolver {
            id,
            published: false,
        })
    }

    fn default_authority(&self, target: &Target) -> String {
        let path = target.path();
        format!("inmemory:{}", path.strip_prefix('/').unwrap_or(path))
    }
}

struct InMemoryResolver {
    id: String,
    published: bool,
}

impl Resolver for InMemoryResolver {
    fn work(&mut self, controller: &mut dyn ResolverController) {
        if self.published {
            return;
        }
        self.published = true;
        let address = Address {
            network_type: INMEMORY_NETWORK_TYPE,
            address: self.id.clone(),
            ..Default::default()
        };
        let _ = controller.update(ResolverUpdate {
            endpoints: Ok(vec![Endpoint::from_address(address)]),
            ..Default::default()
        });
    }

    fn resolve_now(&mut self) {}
}
