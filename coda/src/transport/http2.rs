//! The TCP transport binding: gRPC framing over hyper's HTTP/2 client and
//! server connections.
//!
//! Streams carry `content-type: application/grpc` with the standard pseudo
//! headers; messages are length-prefixed by [`crate::codec`]; the status
//! travels in trailers (or in the headers for trailers-only responses);
//! deadlines travel as `grpc-timeout`.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use http::{Method, Request, Response, Uri, Version};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::codec::{encode_frame, FrameDecoder};
use crate::metadata::{decode_timeout, encode_timeout, Metadata};
use crate::rt::SharedRuntime;
use crate::status::infer_status;
use crate::transport::{
    BindOptions, ClientStreamHead, ConnectedTransport, InboundTransport, Listener, ServerRecvHalf,
    ServerSendHalf, ServerStream, ServerStreamHead, StreamRecvHalf, StreamSendHalf,
    StreamTransport, Transport, TransportOptions, TransportStream,
};
use crate::{Code, Status};

pub use crate::client::name_resolution::TCP_NETWORK_TYPE;

const CONTENT_TYPE: &str = "application/grpc";
const USER_AGENT: &str = concat!("coda/", env!("CARGO_PKG_VERSION"));

/// The window of in-flight body frames between the call engine and hyper.
/// hyper only polls frames as HTTP/2 flow control allows, so a small bound
/// here propagates the peer's backpressure to `send_message` completions.
const BODY_WINDOW: usize = 2;

type BodyItem = Result<Frame<Bytes>, Status>;

/// An [`http_body::Body`] fed by the call engine through a channel. An `Err`
/// item resets the underlying HTTP/2 stream.
struct ChannelBody {
    rx: mpsc::Receiver<BodyItem>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

fn channel_body() -> (mpsc::Sender<BodyItem>, ChannelBody) {
    let (tx, rx) = mpsc::channel(BODY_WINDOW);
    (tx, ChannelBody { rx })
}

fn closed_body() -> ChannelBody {
    let (_, rx) = mpsc::channel(1);
    ChannelBody { rx }
}

fn map_hyper_error(err: &hyper::Error) -> Status {
    if err.is_canceled() {
        Status::cancelled("stream reset by peer")
    } else {
        Status::unavailable(format!("transport error: {err}"))
    }
}

// ===== client =====

/// Connects gRPC-over-HTTP/2 transports to TCP addresses.
#[derive(Default)]
pub struct Http2Transport;

#[async_trait]
impl Transport for Http2Transport {
    async fn connect(
        &self,
        address: String,
        _runtime: SharedRuntime,
        opts: &TransportOptions,
    ) -> Result<ConnectedTransport, String> {
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| format!("failed to connect to {address}: {e}"))?;
        if opts.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        let mut builder = hyper::client::conn::http2::Builder::new(TokioExecutor::new());
        if let Some(interval) = opts.keep_alive_interval {
            builder.keep_alive_interval(interval);
            if let Some(timeout) = opts.keep_alive_timeout {
                builder.keep_alive_timeout(timeout);
            }
        }
        let (send_request, connection) = builder
            .handshake::<_, ChannelBody>(TokioIo::new(stream))
            .await
            .map_err(|e| format!("HTTP/2 handshake with {address} failed: {e}"))?;

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let conn_address = address.clone();
        tokio::spawn(async move {
            let result = connection.await;
            if let Err(e) = &result {
                debug!("connection to {conn_address} terminated: {e}");
            }
            let _ = disconnect_tx.send(result.map_err(|e| e.to_string()));
        });

        Ok(ConnectedTransport {
            transport: Arc::new(Http2ClientConnection {
                send_request,
                peer: address,
                max_recv_message_size: opts.max_recv_message_size,
            }),
            disconnection_listener: disconnect_rx,
        })
    }
}

struct Http2ClientConnection {
    send_request: hyper::client::conn::http2::SendRequest<ChannelBody>,
    peer: String,
    max_recv_message_size: usize,
}

#[async_trait]
impl StreamTransport for Http2ClientConnection {
    async fn open_stream(&self, head: ClientStreamHead) -> Result<TransportStream, Status> {
        let uri = Uri::builder()
            .scheme("http")
            .authority(head.authority.as_str())
            .path_and_query(head.path.as_str())
            .build()
            .map_err(|e| Status::internal(format!("invalid request URI: {e}")))?;

        let (body_tx, body) = channel_body();
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .version(Version::HTTP_2)
            .body(body)
            .map_err(|e| Status::internal(format!("failed to build request: {e}")))?;

        let headers = request.headers_mut();
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE));
        headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
        if let Some(timeout) = head.timeout {
            if let Ok(value) = HeaderValue::from_str(&encode_timeout(timeout)) {
                headers.insert("grpc-timeout", value);
            }
        }
        head.metadata.fill_headers(headers);

        let mut send_request = self.send_request.clone();
        send_request
            .ready()
            .await
            .map_err(|e| Status::from_transport_error(&self.peer, e))?;
        let response_future = send_request.send_request(request);

        Ok(TransportStream {
            send: Box::new(Http2SendHalf { tx: Some(body_tx) }),
            recv: Box::new(Http2RecvHalf {
                state: RecvState::Waiting(Box::pin(response_future)),
                decoder: FrameDecoder::new(self.max_recv_message_size),
                http_status: http::StatusCode::OK,
                trailers: None,
                peer: self.peer.clone(),
            }),
        })
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

struct Http2SendHalf {
    tx: Option<mpsc::Sender<BodyItem>>,
}

#[async_trait]
impl StreamSendHalf for Http2SendHalf {
    async fn send_message(&mut self, message: Bytes) -> Result<(), Status> {
        let Some(tx) = &self.tx else {
            return Err(Status::internal("send after half-close"));
        };
        tx.send(Ok(Frame::data(encode_frame(message))))
            .await
            .map_err(|_| Status::unavailable("stream closed"))
    }

    async fn half_close(&mut self) -> Result<(), Status> {
        // Ending the body without trailers closes the request direction.
        match self.tx.take() {
            Some(_) => Ok(()),
            None => Err(Status::internal("already half-closed")),
        }
    }

    fn reset(&mut self, code: Code) {
        if let Some(tx) = self.tx.take() {
            let status = Status::new(code, "stream reset locally");
            tokio::spawn(async move {
                let _ = tx.send(Err(status)).await;
            });
        }
    }
}

type ResponseFuture =
    Pin<Box<dyn Future<Output = Result<Response<Incoming>, hyper::Error>> + Send>>;

enum RecvState {
    Waiting(ResponseFuture),
    Streaming(Incoming),
    Done,
}

struct Http2RecvHalf {
    state: RecvState,
    decoder: FrameDecoder,
    http_status: http::StatusCode,
    trailers: Option<(Status, Metadata)>,
    peer: String,
}

#[async_trait]
impl StreamRecvHalf for Http2RecvHalf {
    async fn initial_metadata(&mut self) -> Result<Option<Metadata>, Status> {
        let RecvState::Waiting(future) = &mut self.state else {
            return Err(Status::internal("initial metadata already received"));
        };
        let response = match future.await {
            Ok(response) => response,
            Err(e) => {
                self.state = RecvState::Done;
                return Err(map_hyper_error(&e));
            }
        };
        let (parts, body) = response.into_parts();
        self.http_status = parts.status;

        if parts.headers.contains_key("grpc-status") {
            // Trailers-only response: the stream carries no body.
            let status = infer_status(Some(&parts.headers), parts.status);
            self.trailers = Some((status, Metadata::from_headers(&parts.headers)));
            self.state = RecvState::Done;
            return Ok(None);
        }

        self.state = RecvState::Streaming(body);
        Ok(Some(Metadata::from_headers(&parts.headers)))
    }

    async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(message) = self.decoder.next_frame()? {
                return Ok(Some(message));
            }
            let RecvState::Streaming(body) = &mut self.state else {
                return Ok(None);
            };
            match body.frame().await {
                Some(Ok(frame)) => {
                    let frame = match frame.into_data() {
                        Ok(data) => {
                            self.decoder.extend(&data);
                            continue;
                        }
                        Err(frame) => frame,
                    };
                    if let Ok(trailer_map) = frame.into_trailers() {
                        let status = infer_status(Some(&trailer_map), self.http_status);
                        self.trailers = Some((status, Metadata::from_headers(&trailer_map)));
                    }
                }
                Some(Err(e)) => {
                    self.state = RecvState::Done;
                    return Err(map_hyper_error(&e));
                }
                None => {
                    self.state = RecvState::Done;
                    if !self.decoder.is_empty() {
                        return Err(Status::internal(format!(
                            "unexpected EOF decoding stream from {}",
                            self.peer
                        )));
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn trailers(&mut self) -> (Status, Metadata) {
        // Drain whatever remains so the trailers frame is observed.
        loop {
            match self.message().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(status) => return (status, Metadata::new()),
            }
        }
        self.trailers
            .take()
            .unwrap_or_else(|| (infer_status(None, self.http_status), Metadata::new()))
    }
}

// ===== server =====

/// Binds a TCP listening endpoint for the server core.
pub(crate) async fn bind(addr: &str, opts: BindOptions) -> Result<Box<dyn Listener>, crate::Error> {
    let addr: SocketAddr = addr.parse()?;
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if opts.reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let listener = TcpListener::from_std(socket.into())?;
    let local_addr = listener.local_addr()?;
    Ok(Box::new(TcpServerListener {
        listener,
        local_addr,
        opts,
    }))
}

struct TcpServerListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    opts: BindOptions,
}

#[async_trait]
impl Listener for TcpServerListener {
    async fn accept(&mut self) -> Option<Box<dyn InboundTransport>> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    return Some(Box::new(Http2Inbound::new(stream, peer, &self.opts)));
                }
                Err(e) => {
                    // Transient accept failures (EMFILE and friends) should
                    // not take the listener down.
                    warn!("accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }
}

async fn wait_for_goaway(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct Http2Inbound {
    stream_rx: mpsc::Receiver<ServerStream>,
    goaway_tx: watch::Sender<bool>,
}

impl Http2Inbound {
    fn new(tcp: TcpStream, peer: SocketAddr, opts: &BindOptions) -> Self {
        let (stream_tx, stream_rx) = mpsc::channel::<ServerStream>(16);
        let goaway_tx = watch::Sender::new(false);
        let mut goaway_rx = goaway_tx.subscribe();
        let max_recv_message_size = opts.max_recv_message_size;

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                let stream_tx = stream_tx.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(
                        handle_request(request, peer, max_recv_message_size, stream_tx).await,
                    )
                }
            });

            let connection = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tcp), service);
            let mut connection = std::pin::pin!(connection);
            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = wait_for_goaway(&mut goaway_rx) => {
                    trace!("sending GOAWAY to {peer}");
                    connection.as_mut().graceful_shutdown();
                    connection.as_mut().await
                }
            };
            if let Err(e) = result {
                debug!("connection from {peer} ended: {e}");
            }
        });

        Self {
            stream_rx,
            goaway_tx,
        }
    }
}

#[async_trait]
impl InboundTransport for Http2Inbound {
    async fn accept_stream(&mut self) -> Option<ServerStream> {
        self.stream_rx.recv().await
    }

    fn goaway(&self) {
        let _ = self.goaway_tx.send(true);
    }
}

/// Turns one inbound HTTP/2 request into a [`ServerStream`] and waits for
/// the call engine to produce the response head.
async fn handle_request(
    request: Request<Incoming>,
    peer: SocketAddr,
    max_recv_message_size: usize,
    stream_tx: mpsc::Sender<ServerStream>,
) -> Response<ChannelBody> {
    let (parts, body) = request.into_parts();

    if parts.method != Method::POST {
        return plain_response(http::StatusCode::METHOD_NOT_ALLOWED);
    }
    let is_grpc = parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(CONTENT_TYPE));
    if !is_grpc {
        return plain_response(http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    let deadline = parts
        .headers
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(decode_timeout)
        .map(|timeout| Instant::now() + timeout);

    let head = ServerStreamHead {
        path: parts.uri.path().to_string(),
        authority: parts.uri.authority().map(|a| a.to_string()),
        metadata: Metadata::from_headers(&parts.headers),
        deadline,
        peer: format!("ipv{}:{peer}", if peer.is_ipv4() { "4" } else { "6" }),
    };

    let (response_tx, response_rx) = oneshot::channel::<Response<ChannelBody>>();
    let stream = ServerStream {
        head,
        send: Box::new(Http2ServerSend {
            response_tx: Some(response_tx),
            body_tx: None,
        }),
        recv: Box::new(Http2ServerRecv {
            body: Some(body),
            decoder: FrameDecoder::new(max_recv_message_size),
        }),
    };

    if stream_tx.send(stream).await.is_err() {
        return grpc_error_response(&Status::unavailable("server is shutting down"));
    }
    match response_rx.await {
        Ok(response) => response,
        // The send half was dropped without producing a response head: the
        // call was torn down before replying.
        Err(_) => grpc_error_response(&Status::cancelled("call was aborted")),
    }
}

fn plain_response(code: http::StatusCode) -> Response<ChannelBody> {
    let mut response = Response::new(closed_body());
    *response.status_mut() = code;
    response
}

fn grpc_error_response(status: &Status) -> Response<ChannelBody> {
    let mut response = Response::new(closed_body());
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static(CONTENT_TYPE));
    status.add_header(response.headers_mut());
    response
}

struct Http2ServerSend {
    response_tx: Option<oneshot::Sender<Response<ChannelBody>>>,
    body_tx: Option<mpsc::Sender<BodyItem>>,
}

#[async_trait]
impl ServerSendHalf for Http2ServerSend {
    async fn send_initial_metadata(&mut self, metadata: Metadata) -> Result<(), Status> {
        let Some(response_tx) = self.response_tx.take() else {
            return Err(Status::internal("initial metadata already sent"));
        };
        let (body_tx, body) = channel_body();
        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static(CONTENT_TYPE));
        metadata.fill_headers(response.headers_mut());
        response_tx
            .send(response)
            .map_err(|_| Status::cancelled("stream closed by client"))?;
        self.body_tx = Some(body_tx);
        Ok(())
    }

    async fn send_message(&mut self, message: Bytes) -> Result<(), Status> {
        let Some(tx) = &self.body_tx else {
            return Err(Status::internal("message sent before initial metadata"));
        };
        tx.send(Ok(Frame::data(encode_frame(message))))
            .await
            .map_err(|_| Status::cancelled("stream closed by client"))
    }

    async fn send_status(&mut self, status: &Status, trailers: Metadata) -> Result<(), Status> {
        if let Some(response_tx) = self.response_tx.take() {
            // Trailers-only: no header block was ever sent.
            let mut response = grpc_error_response(status);
            trailers.fill_headers(response.headers_mut());
            return response_tx
                .send(response)
                .map_err(|_| Status::cancelled("stream closed by client"));
        }
        let Some(tx) = self.body_tx.take() else {
            return Err(Status::internal("status already sent"));
        };
        let mut trailer_map = HeaderMap::new();
        status.add_header(&mut trailer_map);
        trailers.fill_headers(&mut trailer_map);
        tx.send(Ok(Frame::trailers(trailer_map)))
            .await
            .map_err(|_| Status::cancelled("stream closed by client"))
    }

    fn reset(&mut self, code: Code) {
        self.response_tx = None;
        if let Some(tx) = self.body_tx.take() {
            let status = Status::new(code, "stream reset locally");
            tokio::spawn(async move {
                let _ = tx.send(Err(status)).await;
            });
        }
    }
}

struct Http2ServerRecv {
    body: Option<Incoming>,
    decoder: FrameDecoder,
}

#[async_trait]
impl ServerRecvHalf for Http2ServerRecv {
    async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(message) = self.decoder.next_frame()? {
                return Ok(Some(message));
            }
            let Some(body) = &mut self.body else {
                return Ok(None);
            };
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.decoder.extend(&data);
                    }
                    // Request trailers are not a thing in this protocol;
                    // ignore any other frame kind.
                }
                Some(Err(e)) => {
                    self.body = None;
                    return Err(map_hyper_error(&e));
                }
                None => {
                    self.body = None;
                    if !self.decoder.is_empty() {
                        return Err(Status::internal("request ended mid-message"));
                    }
                    return Ok(None);
                }
            }
        }
    }
}
