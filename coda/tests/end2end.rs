//! End-to-end tests over the in-memory transport: full client channel →
//! picker → subchannel → stream → server dispatch round trips, driven
//! through completion queues exactly the way an application would.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use coda::call::{CloseSlot, MessageSlot, MetadataSlot, StatusSlot};
use coda::client::channel::CallOptions;
use coda::client::name_resolution::{manual, Address, Endpoint, ResolverUpdate};
use coda::inmemory;
use coda::metadata::Metadata;
use coda::server::{PayloadHandling, RegisteredMethodId, ServerCallSlot};
use coda::{Batch, Channel, ChannelOptions, Code, CompletionQueue, Next, Server, Status, Tag};

const ECHO_PATH: &str = "/test.Echo/UnaryEcho";

/// Pumps one event from a queue on a blocking thread.
async fn next_event(cq: &CompletionQueue) -> (Tag, bool) {
    let cq = cq.clone();
    tokio::task::spawn_blocking(move || {
        match cq.next(Instant::now() + Duration::from_secs(10)) {
            Next::Event { tag, ok } => (tag, ok),
            other => panic!("expected an event, got {other:?}"),
        }
    })
    .await
    .unwrap()
}

async fn next_raw(cq: &CompletionQueue) -> Next {
    let cq = cq.clone();
    tokio::task::spawn_blocking(move || cq.next(Instant::now() + Duration::from_secs(10)))
        .await
        .unwrap()
}

struct EchoServer {
    server: Server,
    cq: CompletionQueue,
    method: RegisteredMethodId,
    target: String,
    listener_id: String,
}

async fn start_echo_server() -> EchoServer {
    let listener = inmemory::Listener::new();
    let target = listener.target();
    let listener_id = listener.id();
    let cq = CompletionQueue::for_server();
    let mut builder = Server::builder();
    let method = builder.register_method(ECHO_PATH, None, PayloadHandling::None, false);
    builder.attach_completion_queue(&cq);
    builder.add_listener(listener);
    let server = builder.build_and_start().await.unwrap();
    EchoServer {
        server,
        cq,
        method,
        target,
        listener_id,
    }
}

/// Accepts one call and echoes a single request message back with OK.
async fn serve_one_echo(env: &EchoServer, tag_base: u64) {
    let slot = ServerCallSlot::new();
    env.server
        .request_call(env.method, &env.cq, Tag(tag_base), slot.clone())
        .unwrap();
    assert_eq!(next_event(&env.cq).await, (Tag(tag_base), true));
    let sc = slot.take().unwrap();

    let req = MessageSlot::new();
    sc.call
        .start_batch(Batch::new().recv_message(req.clone()), Tag(tag_base + 1))
        .unwrap();
    assert_eq!(next_event(&env.cq).await, (Tag(tag_base + 1), true));
    let request = req.take().expect("expected a request message");

    let mut trailers = Metadata::new();
    trailers.append("x-echo-trailer", "done").unwrap();
    sc.call
        .start_batch(
            Batch::new()
                .send_initial_metadata(Metadata::new())
                .send_message(request)
                .send_status(Status::ok(), trailers),
            Tag(tag_base + 2),
        )
        .unwrap();
    assert_eq!(next_event(&env.cq).await, (Tag(tag_base + 2), true));
}

/// Runs one unary echo RPC and returns (ok, payload, status).
async fn one_echo_rpc(
    channel: &Channel,
    cq: &CompletionQueue,
    tag: u64,
    options: CallOptions,
) -> (bool, Option<bytes::Bytes>, Status) {
    let call = channel.create_call(ECHO_PATH, options, cq.clone());
    let im = MetadataSlot::new();
    let msg = MessageSlot::new();
    let status = StatusSlot::new();
    call.start_batch(
        Batch::new()
            .send_initial_metadata(Metadata::new())
            .send_message("Hello")
            .send_close()
            .recv_initial_metadata(im.clone())
            .recv_message(msg.clone())
            .recv_status(status.clone()),
        Tag(tag),
    )
    .unwrap();
    let (got_tag, ok) = next_event(cq).await;
    assert_eq!(got_tag, Tag(tag));
    let (st, _) = status.take().expect("status must always be delivered");
    (ok, msg.take(), st)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unary_echo() {
    let env = start_echo_server().await;

    let server = async {
        let slot = ServerCallSlot::new();
        env.server
            .request_call(env.method, &env.cq, Tag(100), slot.clone())
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(100), true));
        let sc = slot.take().unwrap();
        assert_eq!(sc.path, ECHO_PATH);
        // The client's custom metadata arrived intact.
        assert_eq!(sc.metadata.get("x-request-id"), Some("req-1"));

        let req = MessageSlot::new();
        sc.call
            .start_batch(Batch::new().recv_message(req.clone()), Tag(101))
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(101), true));
        assert_eq!(req.take().unwrap().as_ref(), b"Hello");

        let mut initial = Metadata::new();
        initial.append("x-server", "echo").unwrap();
        let mut trailers = Metadata::new();
        trailers.append("x-result", "ok").unwrap();
        trailers.append_bin("x-result-bin", [1u8, 2, 3]).unwrap();
        sc.call
            .start_batch(
                Batch::new()
                    .send_initial_metadata(initial)
                    .send_message("Hello")
                    .send_status(Status::ok(), trailers),
                Tag(102),
            )
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(102), true));

        let close = CloseSlot::new();
        sc.call
            .start_batch(Batch::new().recv_close(close.clone()), Tag(103))
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(103), true));
        assert_eq!(close.cancelled(), Some(false));
    };

    let client = async {
        let channel = Channel::new(&env.target, ChannelOptions::default());
        let cq = CompletionQueue::new();
        let call = channel.create_call(ECHO_PATH, CallOptions::default(), cq.clone());

        let mut md = Metadata::new();
        md.append("x-request-id", "req-1").unwrap();
        let im = MetadataSlot::new();
        let msg = MessageSlot::new();
        let status = StatusSlot::new();
        call.start_batch(
            Batch::new()
                .send_initial_metadata(md)
                .send_message("Hello")
                .send_close()
                .recv_initial_metadata(im.clone())
                .recv_message(msg.clone())
                .recv_status(status.clone()),
            Tag(1),
        )
        .unwrap();

        assert_eq!(next_event(&cq).await, (Tag(1), true));
        assert_eq!(im.take().unwrap().get("x-server"), Some("echo"));
        assert_eq!(msg.take().unwrap().as_ref(), b"Hello");
        let (st, trailers) = status.take().unwrap();
        assert!(st.is_ok(), "status: {st}");
        assert_eq!(trailers.get("x-result"), Some("ok"));
        assert_eq!(
            trailers.get_bin("x-result-bin").unwrap().as_ref(),
            &[1u8, 2, 3]
        );
    };

    tokio::join!(server, client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_streaming_three_messages() {
    let env = start_echo_server().await;

    let server = async {
        let slot = ServerCallSlot::new();
        env.server
            .request_call(env.method, &env.cq, Tag(200), slot.clone())
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(200), true));
        let sc = slot.take().unwrap();

        sc.call
            .start_batch(
                Batch::new().send_initial_metadata(Metadata::new()),
                Tag(201),
            )
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(201), true));
        for (i, payload) in [b"one".as_slice(), b"two", b"three"].iter().enumerate() {
            sc.call
                .start_batch(
                    Batch::new().send_message(bytes::Bytes::copy_from_slice(payload)),
                    Tag(202 + i as u64),
                )
                .unwrap();
            assert_eq!(next_event(&env.cq).await, (Tag(202 + i as u64), true));
        }
        sc.call
            .start_batch(
                Batch::new().send_status(Status::ok(), Metadata::new()),
                Tag(205),
            )
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(205), true));
    };

    let client = async {
        let channel = Channel::new(&env.target, ChannelOptions::default());
        let cq = CompletionQueue::new();
        let call = channel.create_call(ECHO_PATH, CallOptions::default(), cq.clone());

        let im = MetadataSlot::new();
        call.start_batch(
            Batch::new()
                .send_initial_metadata(Metadata::new())
                .send_close()
                .recv_initial_metadata(im.clone()),
            Tag(1),
        )
        .unwrap();
        assert_eq!(next_event(&cq).await, (Tag(1), true));

        // Successive recv_message batches: ok, ok, ok, then ok=false past
        // end-of-stream.
        let mut received = Vec::new();
        for i in 0..4 {
            let msg = MessageSlot::new();
            call.start_batch(Batch::new().recv_message(msg.clone()), Tag(2 + i))
                .unwrap();
            let (_, ok) = next_event(&cq).await;
            if i < 3 {
                assert!(ok, "message {i} should be delivered");
                received.push(msg.take().unwrap());
            } else {
                assert!(!ok, "reading past end-of-stream must fail the op");
                assert!(msg.take().is_none());
            }
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].as_ref(), b"one");
        assert_eq!(received[2].as_ref(), b"three");

        let status = StatusSlot::new();
        call.start_batch(Batch::new().recv_status(status.clone()), Tag(9))
            .unwrap();
        assert_eq!(next_event(&cq).await, (Tag(9), true));
        assert!(status.take().unwrap().0.is_ok());
    };

    tokio::join!(server, client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_exceeded() {
    let env = start_echo_server().await;

    // The server accepts the call but never replies.
    let slot = ServerCallSlot::new();
    env.server
        .request_call(env.method, &env.cq, Tag(300), slot.clone())
        .unwrap();

    let channel = Channel::new(&env.target, ChannelOptions::default());
    let cq = CompletionQueue::new();
    let call = channel.create_call(
        ECHO_PATH,
        CallOptions {
            deadline: Some(Instant::now() + Duration::from_millis(500)),
            ..Default::default()
        },
        cq.clone(),
    );

    call.start_batch(
        Batch::new()
            .send_initial_metadata(Metadata::new())
            .send_message("Hello")
            .send_close(),
        Tag(1),
    )
    .unwrap();
    let status = StatusSlot::new();
    call.start_batch(Batch::new().recv_status(status.clone()), Tag(2))
        .unwrap();

    assert_eq!(next_event(&env.cq).await, (Tag(300), true));
    let sc = slot.take().unwrap();
    assert!(sc.deadline.is_some());

    // The trailing batch completes ok=true, carrying DEADLINE_EXCEEDED.
    let mut saw_deadline = false;
    for _ in 0..2 {
        let (tag, ok) = next_event(&cq).await;
        if tag == Tag(2) {
            assert!(ok);
            saw_deadline = true;
        }
    }
    assert!(saw_deadline);
    assert_eq!(status.take().unwrap().0.code(), Code::DeadlineExceeded);

    // The server observes the cancellation.
    let close = CloseSlot::new();
    sc.call
        .start_batch(Batch::new().recv_close(close.clone()), Tag(301))
        .unwrap();
    assert_eq!(next_event(&env.cq).await, (Tag(301), true));
    assert_eq!(close.cancelled(), Some(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_side_cancellation() {
    let env = start_echo_server().await;

    let slot = ServerCallSlot::new();
    env.server
        .request_call(env.method, &env.cq, Tag(400), slot.clone())
        .unwrap();

    let channel = Channel::new(&env.target, ChannelOptions::default());
    let cq = CompletionQueue::new();
    let call = channel.create_call(ECHO_PATH, CallOptions::default(), cq.clone());

    call.start_batch(
        Batch::new().send_initial_metadata(Metadata::new()),
        Tag(1),
    )
    .unwrap();
    let status = StatusSlot::new();
    call.start_batch(Batch::new().recv_status(status.clone()), Tag(2))
        .unwrap();

    assert_eq!(next_event(&env.cq).await, (Tag(400), true));
    let sc = slot.take().unwrap();
    sc.call.cancel(Status::cancelled("server is not interested"));

    // recv_status delivers CANCELLED.
    let mut events = HashMap::new();
    for _ in 0..2 {
        let (tag, ok) = next_event(&cq).await;
        events.insert(tag, ok);
    }
    assert_eq!(events.get(&Tag(2)), Some(&true));
    assert_eq!(status.take().unwrap().0.code(), Code::Cancelled);

    // Any further send on the cancelled call fails.
    let msg_batch = call.start_batch(Batch::new().send_message("late"), Tag(3));
    if msg_batch.is_ok() {
        let (tag, ok) = next_event(&cq).await;
        assert_eq!(tag, Tag(3));
        assert!(!ok);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pick_first_falls_back_to_second_address() {
    let env = start_echo_server().await;
    let handle = manual::register("manual-pf-fallback");
    handle.update(ResolverUpdate {
        endpoints: Ok(vec![
            // A listener id that does not exist: connections fail.
            Endpoint::from_address(Address::new("inmemory", "no-such-listener")),
            Endpoint::from_address(Address::new("inmemory", env.listener_id.clone())),
        ]),
        ..Default::default()
    });

    let channel = Channel::new("manual-pf-fallback:///svc", ChannelOptions::default());
    let cq = CompletionQueue::new();

    let serve = serve_one_echo(&env, 500);
    let rpc = one_echo_rpc(
        &channel,
        &cq,
        1,
        CallOptions {
            wait_for_ready: Some(true),
            ..Default::default()
        },
    );
    let ((), (ok, payload, status)) = tokio::join!(serve, rpc);

    assert!(ok, "RPC should succeed via the second address");
    assert!(status.is_ok(), "status: {status}");
    assert_eq!(payload.unwrap().as_ref(), b"Hello");
}

/// Serves echo RPCs in a loop, bumping `counter` once per served call, until
/// the server shuts down.
fn spawn_echo_loop(env: EchoServer, counter: std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::Ordering;
    tokio::spawn(async move {
        let mut tag = 0u64;
        loop {
            let slot = ServerCallSlot::new();
            if env
                .server
                .request_call(env.method, &env.cq, Tag(tag), slot.clone())
                .is_err()
            {
                return;
            }
            let cq = env.cq.clone();
            let next = tokio::task::spawn_blocking(move || {
                cq.next(Instant::now() + Duration::from_secs(60))
            })
            .await
            .unwrap();
            let ok = matches!(next, Next::Event { ok: true, .. });
            if !ok {
                // Shutdown flushed the tag.
                return;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let sc = slot.take().unwrap();
            let req = MessageSlot::new();
            sc.call
                .start_batch(Batch::new().recv_message(req.clone()), Tag(tag + 1))
                .unwrap();
            assert_eq!(next_event(&env.cq).await, (Tag(tag + 1), true));
            sc.call
                .start_batch(
                    Batch::new()
                        .send_initial_metadata(Metadata::new())
                        .send_message(req.take().unwrap())
                        .send_status(Status::ok(), Metadata::new()),
                    Tag(tag + 2),
                )
                .unwrap();
            assert_eq!(next_event(&env.cq).await, (Tag(tag + 2), true));
            tag += 10;
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn round_robin_distributes_and_survives_backend_loss() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // Three backends, each counting the calls it serves.
    let mut counters = Vec::new();
    let mut addresses = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..3 {
        let env = start_echo_server().await;
        addresses.push(env.listener_id.clone());
        servers.push(env.server.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        counters.push(counter.clone());
        spawn_echo_loop(env, counter);
    }

    let handle = manual::register("manual-rr");
    handle.update(ResolverUpdate {
        endpoints: Ok(addresses
            .iter()
            .map(|id| Endpoint::from_address(Address::new("inmemory", id.clone())))
            .collect()),
        ..Default::default()
    });

    let channel = Channel::new(
        "manual-rr:///svc",
        ChannelOptions {
            default_service_config: Some(
                r#"{"loadBalancingConfig": [{"round_robin": {}}]}"#.to_string(),
            ),
            ..Default::default()
        },
    );
    let cq = CompletionQueue::new();
    let snapshot =
        |counters: &[Arc<AtomicUsize>]| -> Vec<usize> {
            counters.iter().map(|c| c.load(Ordering::SeqCst)).collect()
        };
    let wfr = CallOptions {
        wait_for_ready: Some(true),
        ..Default::default()
    };

    // Warm up until one round of three RPCs lands on three distinct
    // backends, i.e. every subchannel made it into the picker.
    let mut tag = 1u64;
    for attempt in 0.. {
        assert!(attempt < 50, "round_robin never saw all three backends");
        let before = snapshot(&counters);
        for _ in 0..3 {
            let (ok, _, status) = one_echo_rpc(&channel, &cq, tag, wfr.clone()).await;
            assert!(ok && status.is_ok(), "warmup rpc failed: {status}");
            tag += 1;
        }
        let after = snapshot(&counters);
        if before.iter().zip(&after).all(|(b, a)| a > b) {
            break;
        }
    }

    // Six RPCs distribute 2-2-2 across the three backends.
    let before = snapshot(&counters);
    for _ in 0..6 {
        let (ok, _, status) = one_echo_rpc(&channel, &cq, tag, wfr.clone()).await;
        assert!(ok && status.is_ok(), "rpc failed: {status}");
        tag += 1;
    }
    let after = snapshot(&counters);
    let deltas: Vec<usize> = before.iter().zip(&after).map(|(b, a)| a - b).collect();
    assert_eq!(deltas, vec![2, 2, 2], "distribution: {deltas:?}");

    // Take the first backend down; traffic settles on the other two and the
    // channel never drops below READY.
    servers[0].shutdown(None).await;
    let before = snapshot(&counters);
    for _ in 0..6 {
        let (ok, _, status) = one_echo_rpc(&channel, &cq, tag, wfr.clone()).await;
        assert!(ok && status.is_ok(), "rpc after backend loss failed: {status}");
        tag += 1;
    }
    let after = snapshot(&counters);
    assert_eq!(after[0], before[0], "lost backend must not serve traffic");
    assert_eq!(
        (after[1] - before[1]) + (after[2] - before[2]),
        6,
        "survivors carry the load"
    );
    assert_eq!(channel.state(false), coda::client::ConnectivityState::Ready);

    // Unblock the serving loops so runtime teardown does not wait out their
    // queue timeouts.
    for server in &servers[1..] {
        server.shutdown(None).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unimplemented_method() {
    let env = start_echo_server().await;
    let channel = Channel::new(&env.target, ChannelOptions::default());
    let cq = CompletionQueue::new();
    let call = channel.create_call("/test.Echo/NoSuchMethod", CallOptions::default(), cq.clone());

    let status = StatusSlot::new();
    call.start_batch(
        Batch::new()
            .send_initial_metadata(Metadata::new())
            .send_close()
            .recv_status(status.clone()),
        Tag(1),
    )
    .unwrap();
    assert_eq!(next_event(&cq).await, (Tag(1), true));
    let (st, _) = status.take().unwrap();
    assert_eq!(st.code(), Code::Unimplemented);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_on_unavailable() {
    let env = start_echo_server().await;
    let channel = Channel::new(
        &env.target,
        ChannelOptions {
            default_service_config: Some(
                r#"{
                  "methodConfig": [{
                    "name": [{"service": "test.Echo"}],
                    "retryPolicy": {
                      "maxAttempts": 3,
                      "initialBackoff": "0.02s",
                      "maxBackoff": "0.1s",
                      "backoffMultiplier": 2,
                      "retryableStatusCodes": ["UNAVAILABLE"]
                    }
                  }]
                }"#
                .to_string(),
            ),
            ..Default::default()
        },
    );
    let cq = CompletionQueue::new();

    let server = async {
        // First attempt: refused with UNAVAILABLE before any reply message.
        let slot = ServerCallSlot::new();
        env.server
            .request_call(env.method, &env.cq, Tag(600), slot.clone())
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(600), true));
        let sc = slot.take().unwrap();
        sc.call
            .start_batch(
                Batch::new().send_status(
                    Status::unavailable("try again"),
                    Metadata::new(),
                ),
                Tag(601),
            )
            .unwrap();
        assert_eq!(next_event(&env.cq).await, (Tag(601), true));

        // Second attempt: replay arrives and the echo succeeds.
        serve_one_echo(&env, 610).await;
    };

    let rpc = one_echo_rpc(&channel, &cq, 1, CallOptions::default());
    let ((), (ok, payload, status)) = tokio::join!(server, rpc);
    assert!(ok, "retried RPC should succeed, got {status}");
    assert!(status.is_ok());
    assert_eq!(payload.unwrap().as_ref(), b"Hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_shutdown_flushes_pending_tags_and_drains_cq() {
    let env = start_echo_server().await;

    // A tag with no matching inbound stream.
    let slot = ServerCallSlot::new();
    env.server
        .request_call(env.method, &env.cq, Tag(700), slot.clone())
        .unwrap();

    env.server.shutdown(None).await;
    env.server.wait().await;

    assert_eq!(next_event(&env.cq).await, (Tag(700), false));
    assert!(slot.take().is_none());

    env.cq.shutdown();
    assert_eq!(next_raw(&env.cq).await, Next::Shutdown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_shutdown_cancels_in_flight_calls() {
    let env = start_echo_server().await;

    // Accept but never answer.
    let slot = ServerCallSlot::new();
    env.server
        .request_call(env.method, &env.cq, Tag(800), slot.clone())
        .unwrap();

    let channel = Channel::new(&env.target, ChannelOptions::default());
    let cq = CompletionQueue::new();
    let call = channel.create_call(ECHO_PATH, CallOptions::default(), cq.clone());
    let status = StatusSlot::new();
    call.start_batch(
        Batch::new()
            .send_initial_metadata(Metadata::new())
            .recv_status(status.clone()),
        Tag(1),
    )
    .unwrap();

    assert_eq!(next_event(&env.cq).await, (Tag(800), true));
    channel.shutdown();

    let (tag, _) = next_event(&cq).await;
    assert_eq!(tag, Tag(1));
    assert_eq!(status.take().unwrap().0.code(), Code::Cancelled);

    // New calls fail immediately.
    let call = channel.create_call(ECHO_PATH, CallOptions::default(), cq.clone());
    let status = StatusSlot::new();
    call.start_batch(Batch::new().recv_status(status.clone()), Tag(2))
        .unwrap();
    assert_eq!(next_event(&cq).await, (Tag(2), true));
    assert_eq!(status.take().unwrap().0.code(), Code::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preread_payload_delivered_with_request_call() {
    let listener = inmemory::Listener::new();
    let target = listener.target();
    let cq = CompletionQueue::for_server();
    let mut builder = Server::builder();
    let method = builder.register_method(ECHO_PATH, None, PayloadHandling::PreRead, true);
    builder.attach_completion_queue(&cq);
    builder.add_listener(listener);
    let server = builder.build_and_start().await.unwrap();

    let slot = ServerCallSlot::new();
    server.request_call(method, &cq, Tag(900), slot.clone()).unwrap();

    let channel = Channel::new(&target, ChannelOptions::default());
    let client_cq = CompletionQueue::new();
    let rpc = one_echo_rpc(&channel, &client_cq, 1, CallOptions::default());

    let serve = async {
        assert_eq!(next_event(&cq).await, (Tag(900), true));
        let sc = slot.take().unwrap();
        let payload = sc.payload.clone().expect("pre-read payload");
        assert_eq!(payload.as_ref(), b"Hello");
        sc.call
            .start_batch(
                Batch::new()
                    .send_initial_metadata(Metadata::new())
                    .send_message(payload)
                    .send_status(Status::ok(), Metadata::new()),
                Tag(901),
            )
            .unwrap();
        assert_eq!(next_event(&cq).await, (Tag(901), true));
    };

    let ((ok, payload, status), ()) = tokio::join!(rpc, serve);
    assert!(ok && status.is_ok());
    assert_eq!(payload.unwrap().as_ref(), b"Hello");
}
