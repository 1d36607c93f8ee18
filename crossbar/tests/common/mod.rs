//! Shared harness for the end-to-end scenarios.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbar::{ClientCore, ClientEvents, EventLoop, LoopCtx, ProtocolError, Qid};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll the loop until the predicate holds, failing the test after ten
/// seconds.
pub fn drive_until(event_loop: &mut EventLoop, what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        event_loop
            .poll_once(Some(Duration::from_millis(10)))
            .unwrap();
    }
}

/// Subscriber delegate: subscribes on connect, records everything.
pub struct Recorder {
    pub subs: Vec<Qid>,
    pub got: Rc<RefCell<Vec<(Bytes, Bytes)>>>,
    pub connected: Rc<Cell<bool>>,
    pub disconnected: Rc<Cell<bool>>,
    pub errors: Rc<RefCell<Vec<String>>>,
}

impl Recorder {
    pub fn new(subs: Vec<Qid>) -> Self {
        Self {
            subs,
            got: Rc::new(RefCell::new(Vec::new())),
            connected: Rc::new(Cell::new(false)),
            disconnected: Rc::new(Cell::new(false)),
            errors: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl ClientEvents for Recorder {
    fn on_connected(&mut self, client: &mut ClientCore, ctx: &LoopCtx<'_>) {
        self.connected.set(true);
        for qid in &self.subs {
            client.subscribe(qid, ctx).unwrap();
        }
    }

    fn on_disconnected(&mut self, _ctx: &LoopCtx<'_>) {
        self.disconnected.set(true);
    }

    fn on_message(
        &mut self,
        _client: &mut ClientCore,
        _ctx: &LoopCtx<'_>,
        qid: &Bytes,
        message: &Bytes,
    ) {
        self.got.borrow_mut().push((qid.clone(), message.clone()));
    }

    fn on_error(&mut self, err: &ProtocolError, _ctx: &LoopCtx<'_>) {
        self.errors.borrow_mut().push(err.to_string());
    }
}

/// Publisher delegate: fires a fixed plan of sends once connected.
pub struct Producer {
    pub plan: Vec<(Bytes, Bytes, bool)>,
}

impl Producer {
    pub fn new(plan: Vec<(Bytes, Bytes, bool)>) -> Self {
        Self { plan }
    }
}

impl ClientEvents for Producer {
    fn on_connected(&mut self, client: &mut ClientCore, ctx: &LoopCtx<'_>) {
        for (qid, message, multicast) in self.plan.drain(..) {
            client.send(qid, message, multicast, ctx).unwrap();
        }
    }
}
