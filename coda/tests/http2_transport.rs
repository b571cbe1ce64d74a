//! Smoke tests for the TCP binding: a real HTTP/2 exchange over loopback,
//! plus the port-binding semantics.

use std::time::{Duration, Instant};

use coda::call::{MessageSlot, MetadataSlot, StatusSlot};
use coda::client::channel::CallOptions;
use coda::metadata::Metadata;
use coda::server::{PayloadHandling, ServerCallSlot};
use coda::{Batch, Channel, ChannelOptions, CompletionQueue, Next, Server, Status, Tag};

const PATH: &str = "/smoke.Test/Echo";

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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unary_echo_over_tcp() {
    let cq = CompletionQueue::for_server();
    let mut builder = Server::builder();
    let method = builder.register_method(PATH, None, PayloadHandling::None, false);
    builder.attach_completion_queue(&cq);
    builder.add_listening_port("127.0.0.1:0");
    let server = builder.build_and_start().await.unwrap();
    let addr = server.local_addrs()[0].clone();

    let slot = ServerCallSlot::new();
    server.request_call(method, &cq, Tag(10), slot.clone()).unwrap();

    let serve = async {
        assert_eq!(next_event(&cq).await, (Tag(10), true));
        let sc = slot.take().unwrap();
        assert_eq!(sc.path, PATH);
        assert_eq!(sc.metadata.get("x-smoke"), Some("1"));
        assert!(sc.deadline.is_some(), "grpc-timeout should carry over TCP");

        let req = MessageSlot::new();
        sc.call
            .start_batch(Batch::new().recv_message(req.clone()), Tag(11))
            .unwrap();
        assert_eq!(next_event(&cq).await, (Tag(11), true));

        let mut trailers = Metadata::new();
        trailers.append("x-tcp-trailer", "yes").unwrap();
        sc.call
            .start_batch(
                Batch::new()
                    .send_initial_metadata(Metadata::new())
                    .send_message(req.take().unwrap())
                    .send_status(Status::ok(), trailers),
                Tag(12),
            )
            .unwrap();
        assert_eq!(next_event(&cq).await, (Tag(12), true));
    };

    let client = async {
        let channel = Channel::new(&format!("static:///{addr}"), ChannelOptions::default());
        let client_cq = CompletionQueue::new();
        let call = channel.create_call(
            PATH,
            CallOptions {
                deadline: Some(Instant::now() + Duration::from_secs(30)),
                ..Default::default()
            },
            client_cq.clone(),
        );

        let mut md = Metadata::new();
        md.append("x-smoke", "1").unwrap();
        let im = MetadataSlot::new();
        let msg = MessageSlot::new();
        let status = StatusSlot::new();
        call.start_batch(
            Batch::new()
                .send_initial_metadata(md)
                .send_message("over tcp")
                .send_close()
                .recv_initial_metadata(im.clone())
                .recv_message(msg.clone())
                .recv_status(status.clone()),
            Tag(1),
        )
        .unwrap();

        assert_eq!(next_event(&client_cq).await, (Tag(1), true));
        assert_eq!(msg.take().unwrap().as_ref(), b"over tcp");
        let (st, trailers) = status.take().unwrap();
        assert!(st.is_ok(), "status: {st}");
        assert_eq!(trailers.get("x-tcp-trailer"), Some("yes"));
    };

    tokio::join!(serve, client);
    server.shutdown(Some(Instant::now() + Duration::from_secs(2))).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_bind_fails_without_reuse_port() {
    let mut first = Server::builder();
    first.add_listening_port("127.0.0.1:0");
    first.reuse_port(false);
    let first = first.build_and_start().await.unwrap();
    let addr = first.local_addrs()[0].clone();

    let mut second = Server::builder();
    second.add_listening_port(&addr);
    second.reuse_port(false);
    assert!(
        second.build_and_start().await.is_err(),
        "binding a taken port without reuse-port must fail"
    );
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_bind_succeeds_with_reuse_port() {
    let mut first = Server::builder();
    first.add_listening_port("127.0.0.1:0");
    let first = first.build_and_start().await.unwrap();
    let addr = first.local_addrs()[0].clone();

    let mut second = Server::builder();
    second.add_listening_port(&addr);
    assert!(second.build_and_start().await.is_ok());
}
