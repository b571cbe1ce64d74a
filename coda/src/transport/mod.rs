//! Transport contracts.
//!
//! The core does not implement an HTTP/2 framer; it consumes transports
//! through the traits in this module. A transport multiplexes streams over
//! one connection and guarantees message-at-a-time delivery: the length
//! prefix is stripped before messages reach the call engine, and applied
//! after messages leave it.
//!
//! Two bindings ship with the crate: [`http2`] (hyper over TCP) and
//! [`crate::inmemory`]. Out-of-tree transports implement these traits and
//! register under their address network type.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::metadata::Metadata;
use crate::rt::SharedRuntime;
use crate::{Code, Status};

pub mod http2;

/// Connects transports to addresses of one network type.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: String,
        runtime: SharedRuntime,
        opts: &TransportOptions,
    ) -> Result<ConnectedTransport, String>;
}

/// An established connection, plus a listener that resolves when the peer
/// goes away.
pub struct ConnectedTransport {
    pub transport: Arc<dyn StreamTransport>,
    pub disconnection_listener: oneshot::Receiver<Result<(), String>>,
}

/// Options applied when establishing a connection.
#[derive(Clone)]
pub struct TransportOptions {
    pub connect_deadline: Option<Instant>,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub tcp_nodelay: bool,
    pub max_recv_message_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_deadline: None,
            keep_alive_interval: None,
            keep_alive_timeout: None,
            tcp_nodelay: true,
            max_recv_message_size: crate::call::DEFAULT_MAX_RECV_MESSAGE_SIZE,
        }
    }
}

/// A live connection on which new streams can be opened.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a stream, sending the leading header block.
    async fn open_stream(&self, head: ClientStreamHead) -> Result<TransportStream, Status>;

    /// A printable description of the remote peer.
    fn peer(&self) -> String;
}

/// The leading header block of a client stream.
pub struct ClientStreamHead {
    pub path: String,
    pub authority: String,
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
}

/// The two directions of an open stream.
pub struct TransportStream {
    pub send: Box<dyn StreamSendHalf>,
    pub recv: Box<dyn StreamRecvHalf>,
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream").finish_non_exhaustive()
    }
}

/// Client-side outbound direction of a stream.
#[async_trait]
pub trait StreamSendHalf: Send {
    /// Sends one message. Completes when the transport has accepted the
    /// bytes; a closed flow-control window stalls this without failing it.
    async fn send_message(&mut self, message: Bytes) -> Result<(), Status>;

    /// Half-closes the outbound direction.
    async fn half_close(&mut self) -> Result<(), Status>;

    /// Resets the stream. Idempotent; also implied by dropping both halves
    /// before the stream completed.
    fn reset(&mut self, code: Code);
}

/// Client-side inbound direction of a stream. Methods are driven in order:
/// initial metadata, then messages until `None`, then trailers.
#[async_trait]
pub trait StreamRecvHalf: Send {
    /// Resolves when the peer's header block arrives. A trailers-only
    /// response yields `None`: no separate header block exists and the
    /// status is reported by `trailers`.
    async fn initial_metadata(&mut self) -> Result<Option<Metadata>, Status>;

    /// Next message, or `None` at end-of-stream.
    async fn message(&mut self) -> Result<Option<Bytes>, Status>;

    /// The final status and trailing metadata. Transport failures are folded
    /// into the returned status.
    async fn trailers(&mut self) -> (Status, Metadata);
}

// ===== server side =====

/// The head data of an accepted inbound stream.
pub struct ServerStreamHead {
    pub path: String,
    pub authority: Option<String>,
    pub metadata: Metadata,
    pub deadline: Option<Instant>,
    pub peer: String,
}

/// An inbound stream handed to the server core.
pub struct ServerStream {
    pub head: ServerStreamHead,
    pub send: Box<dyn ServerSendHalf>,
    pub recv: Box<dyn ServerRecvHalf>,
}

/// Server-side outbound direction of a stream.
#[async_trait]
pub trait ServerSendHalf: Send {
    /// Sends the leading header block. At most once, before any message.
    async fn send_initial_metadata(&mut self, metadata: Metadata) -> Result<(), Status>;

    async fn send_message(&mut self, message: Bytes) -> Result<(), Status>;

    /// Sends the trailers and closes the stream. If no header block was sent
    /// this produces a trailers-only response.
    async fn send_status(&mut self, status: &Status, trailers: Metadata) -> Result<(), Status>;

    fn reset(&mut self, code: Code);
}

/// Server-side inbound direction of a stream.
#[async_trait]
pub trait ServerRecvHalf: Send {
    /// Next message from the client, or `None` once the client half-closed.
    /// A stream reset by the client surfaces as `Err` with `Cancelled`.
    async fn message(&mut self) -> Result<Option<Bytes>, Status>;
}

/// One accepted connection on the server side.
#[async_trait]
pub trait InboundTransport: Send {
    /// The next inbound stream, or `None` when the connection closed.
    async fn accept_stream(&mut self) -> Option<ServerStream>;

    /// Starts a graceful GOAWAY: no new streams are accepted, existing ones
    /// run to completion.
    fn goaway(&self);
}

/// A bound listening endpoint.
#[async_trait]
pub trait Listener: Send {
    /// The next inbound connection, or `None` when the listener closed.
    async fn accept(&mut self) -> Option<Box<dyn InboundTransport>>;

    fn local_addr(&self) -> String;
}

/// Options applied when binding a listening endpoint.
#[derive(Clone)]
pub struct BindOptions {
    pub reuse_port: bool,
    pub max_recv_message_size: usize,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            reuse_port: true,
            max_recv_message_size: crate::call::DEFAULT_MAX_RECV_MESSAGE_SIZE,
        }
    }
}

// ===== registry =====

/// A registry of client transports keyed by the network type of the
/// addresses they can connect.
pub(crate) struct TransportRegistry {
    m: Mutex<HashMap<String, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    fn new() -> Self {
        Self {
            m: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add_transport(&self, network_type: &str, transport: impl Transport + 'static) {
        self.m
            .lock()
            .unwrap()
            .insert(network_type.to_string(), Arc::new(transport));
    }

    pub(crate) fn get_transport(&self, network_type: &str) -> Option<Arc<dyn Transport>> {
        self.m.lock().unwrap().get(network_type).cloned()
    }
}

/// The process-wide transport registry. The TCP transport registers itself
/// here at first use; the in-memory transport via [`crate::inmemory::reg`].
pub(crate) static GLOBAL_TRANSPORT_REGISTRY: LazyLock<TransportRegistry> = LazyLock::new(|| {
    let registry = TransportRegistry::new();
    registry.add_transport(http2::TCP_NETWORK_TYPE, http2::Http2Transport::default());
    registry
});

/// Registers a client transport for addresses of `network_type` in the
/// process-wide registry.
pub fn register_transport(network_type: &str, transport: impl Transport + 'static) {
    GLOBAL_TRANSPORT_REGISTRY.add_transport(network_type, transport);
}
