//! End-to-end round trip over the Unix-domain adapter.

#![cfg(unix)]

mod common;

use bytes::Bytes;
use crossbar::{Endpoint, Exchange, EventLoop, Listener, Qid, RemoteClient, StreamConfig};

use common::{drive_until, init_tracing, Producer, Recorder};

#[test]
fn ipc_roundtrip_and_clean_disconnect() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crossbar.sock");
    let endpoint = Endpoint::parse(&format!("ipc://{}", path.display())).unwrap();

    let mut event_loop = EventLoop::new().unwrap();
    let exchange = Exchange::with_seed(7);
    let _listener = Listener::bind(
        &exchange,
        &endpoint,
        StreamConfig::default(),
        &event_loop.ctx(),
    )
    .unwrap();

    let subscriber = Recorder::new(vec![Qid::literal("/q")]);
    let got = subscriber.got.clone();
    let a = RemoteClient::connect(
        &endpoint,
        Box::new(subscriber),
        StreamConfig::default(),
        &event_loop.ctx(),
    )
    .unwrap();
    drive_until(&mut event_loop, "subscription", || {
        exchange.subscription_count() == 1
    });

    let _b = RemoteClient::connect(
        &endpoint,
        Box::new(Producer::new(vec![(
            Bytes::from_static(b"/q"),
            Bytes::from_static(b"over ipc"),
            true,
        )])),
        StreamConfig::default(),
        &event_loop.ctx(),
    )
    .unwrap();

    drive_until(&mut event_loop, "delivery", || !got.borrow().is_empty());
    assert_eq!(got.borrow()[0].1.as_ref(), b"over ipc");

    // Client-initiated DISCONNECT detaches it from the exchange.
    a.borrow_mut().core().close(&event_loop.ctx());
    drive_until(&mut event_loop, "detach", || {
        exchange.subscription_count() == 0
    });
}

#[test]
fn stale_socket_file_is_replaced() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crossbar.sock");
    std::fs::write(&path, b"stale").unwrap();

    let event_loop = EventLoop::new().unwrap();
    let exchange = Exchange::with_seed(7);
    let listener = Listener::bind_ipc(
        &exchange,
        &path,
        StreamConfig::default(),
        &event_loop.ctx(),
    );
    assert!(listener.is_ok());
}
