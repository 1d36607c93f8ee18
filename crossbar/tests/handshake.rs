//! Handshake failure against a server that replies with the wrong op.

mod common;

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crossbar::{
    EventHandler, EventLoop, Header, LoopCtx, Op, Qid, RemoteClient, StreamConfig,
};
use mio::event::Event;
use mio::Interest;

use common::{drive_until, init_tracing, Recorder};

/// Accepts connections and greets every client with a frame that is not
/// CONNECTED.
struct RogueServer {
    listener: mio::net::TcpListener,
    accepted: Vec<mio::net::TcpStream>,
}

impl EventHandler for RogueServer {
    fn on_ready(&mut self, _event: &Event, _ctx: &LoopCtx<'_>) {
        while let Ok((mut stream, _)) = self.listener.accept() {
            let _ = stream.write_all(&Header::control(Op::Disconnect).encode());
            // Keep the socket open so the client reads our bogus reply
            // rather than an EOF.
            self.accepted.push(stream);
        }
    }
}

#[test]
fn wrong_op_fails_the_handshake() {
    init_tracing();
    let mut event_loop = EventLoop::new().unwrap();

    let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = event_loop.ctx();
    let token = ctx.next_token();
    mio::event::Source::register(&mut listener, ctx.registry, token, Interest::READABLE).unwrap();
    ctx.insert_handler(
        token,
        Rc::new(RefCell::new(RogueServer {
            listener,
            accepted: Vec::new(),
        })),
    );

    let recorder = Recorder::new(vec![Qid::literal("/q")]);
    let errors = recorder.errors.clone();
    let disconnected = recorder.disconnected.clone();
    let connected = recorder.connected.clone();
    let _client = RemoteClient::connect_tcp(
        addr,
        Box::new(recorder),
        StreamConfig::default(),
        &event_loop.ctx(),
    )
    .unwrap();

    drive_until(&mut event_loop, "handshake failure", || {
        !errors.borrow().is_empty() && disconnected.get()
    });

    assert!(!connected.get(), "on_connected must not fire");
    let errors = errors.borrow();
    assert!(
        errors[0].contains("handshake"),
        "unexpected error: {}",
        errors[0]
    );
}
