//! Server-side connection.
//!
//! One `Connection` faces one remote client. Inbound, it runs an explicit
//! parser state machine (await header, await qid, await body) fed by the
//! stream's read-exactly primitive, enforces the CONNECT handshake, and
//! feeds SUBSCRIBE / UNSUBSCRIBE / SEND frames into the exchange.
//! Outbound, it owns the per-connection egress scheduler that turns
//! exchange deliveries into MESSAGE frames.
//!
//! The egress scheduler keeps one FIFO of message bodies per qid (`mq`)
//! and a queue of reactivated qids (`fq`). A qid enters `fq` exactly when
//! its FIFO goes empty -> non-empty and it is not the qid currently being
//! written; the sender pops the most recently reactivated qid, writes one
//! frame, and yields to the event loop before the next one. No qid can
//! monopolise the socket while others hold backlog, and inbound traffic
//! of other connections keeps flowing between frames.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use hashbrown::HashMap;
use mio::event::Event;
use tracing::{debug, trace, warn};

use crossbar_core::config::StreamConfig;
use crossbar_core::error::ExchangeError;
use crossbar_core::exchange::{Exchange, ExchangePeer, PeerKey};
use crossbar_core::qid::Qid;
use crossbar_core::reactor::{EventHandler, LoopCtx, LoopHandle};
use crossbar_core::stream::{Socket, Stream, WriteToken};

use crate::frame::{Header, Op, ProtocolError, HEADER_LEN};

/// Completion token of a MESSAGE body write.
const BODY_FLUSHED: WriteToken = 1;

/// Per-connection egress state for outbound MESSAGE frames.
struct Egress {
    /// One FIFO of pending bodies per qid.
    mq: HashMap<Bytes, VecDeque<Bytes>>,
    /// Reactivated qids; the back is the most recently reactivated.
    fq: Vec<Bytes>,
    /// Qid whose frame is currently being written.
    writing: Option<Bytes>,
    /// A sender turn is scheduled or running.
    sending: bool,
}

impl Egress {
    fn new() -> Self {
        Self {
            mq: HashMap::new(),
            fq: Vec::new(),
            writing: None,
            sending: false,
        }
    }

    /// Queue one body. Returns whether the qid just reactivated.
    fn enqueue(&mut self, qid: Bytes, message: Bytes) {
        let queue = self.mq.entry(qid.clone()).or_default();
        queue.push_back(message);
        if queue.len() == 1 && self.writing.as_ref() != Some(&qid) {
            self.fq.push(qid);
        }
    }

    /// Take the next (qid, body) pair: most recently reactivated qid,
    /// oldest body of that qid.
    fn pop(&mut self) -> Option<(Bytes, Bytes)> {
        let qid = self.fq.pop()?;
        let message = self.mq.get_mut(&qid).and_then(VecDeque::pop_front);
        debug_assert!(message.is_some(), "fq entry without a pending body");
        let message = message?;
        self.writing = Some(qid.clone());
        Some((qid, message))
    }

    /// The in-flight frame reached the socket: requeue its qid if more
    /// bodies are pending, drop the empty FIFO otherwise.
    fn flushed(&mut self) {
        let Some(qid) = self.writing.take() else { return };
        match self.mq.get(&qid) {
            Some(queue) if !queue.is_empty() => self.fq.push(qid),
            _ => {
                self.mq.remove(&qid);
            }
        }
    }

    fn has_work(&self) -> bool {
        !self.fq.is_empty()
    }
}

/// Inbound parser state.
enum RecvState {
    /// Awaiting the CONNECT frame that opens the session.
    Connect,
    /// Awaiting a 4-byte frame header.
    Header,
    /// Awaiting the qid bytes announced by `Header`.
    Qid(Header),
    /// Awaiting the body of a SEND frame.
    Body(Header, Bytes),
}

pub struct Connection {
    exchange: Exchange,
    stream: Stream,
    peer: String,
    state: RecvState,
    /// Exchange key, present once the handshake completed.
    key: Option<PeerKey>,
    egress: Rc<RefCell<Egress>>,
    /// Inbound processing parked until a deferred continuation runs.
    paused: bool,
    detached: bool,
    me: Weak<RefCell<Connection>>,
}

impl Connection {
    /// Wrap an accepted socket and start the handshake.
    pub fn spawn(
        exchange: Exchange,
        socket: Socket,
        peer: String,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> Rc<RefCell<Self>> {
        let token = ctx.next_token();
        let stream = Stream::new(socket, token, cfg);
        let conn = Rc::new_cyclic(|me| {
            RefCell::new(Self {
                exchange,
                stream,
                peer,
                state: RecvState::Connect,
                key: None,
                egress: Rc::new(RefCell::new(Egress::new())),
                paused: false,
                detached: false,
                me: me.clone(),
            })
        });
        ctx.insert_handler(token, conn.clone());
        {
            let mut started = conn.borrow_mut();
            started.drive_inbound(ctx);
            if started.stream.closed() {
                started.teardown(ctx);
            }
        }
        conn
    }

    /// The connection has already torn itself down.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Close the stream and detach from the exchange.
    pub fn close(&mut self, ctx: &LoopCtx<'_>) {
        self.stream.close(ctx.registry);
        self.teardown(ctx);
    }

    fn teardown(&mut self, ctx: &LoopCtx<'_>) {
        if self.detached {
            return;
        }
        self.detached = true;
        ctx.remove_handler(self.stream.token());
        if let Some(key) = self.key.take() {
            self.exchange.disconnect(key);
        }
        debug!(peer = %self.peer, "connection closed");
    }

    /// Consume fulfilled reads until input runs dry, the stream closes,
    /// or a SEND continuation parks us for the next loop iteration.
    fn drive_inbound(&mut self, ctx: &LoopCtx<'_>) {
        while !self.paused && !self.stream.closed() {
            let need = match &self.state {
                RecvState::Connect | RecvState::Header => HEADER_LEN,
                RecvState::Qid(header) => header.qid_len,
                RecvState::Body(header, _) => header.message_len,
            };
            let bytes = if self.stream.reading() {
                self.stream.take_ready()
            } else {
                self.stream.read_exactly(need, ctx.registry)
            };
            let Some(bytes) = bytes else { break };
            if let Err(err) = self.step(bytes, ctx) {
                warn!(peer = %self.peer, %err, "protocol violation, closing");
                self.close(ctx);
            }
        }
    }

    fn step(&mut self, bytes: Bytes, ctx: &LoopCtx<'_>) -> Result<(), ProtocolError> {
        match std::mem::replace(&mut self.state, RecvState::Header) {
            RecvState::Connect => {
                let header = decode_header(&bytes)?;
                if header.op != Op::Connect {
                    return Err(ProtocolError::UnexpectedOp(header.op));
                }
                self.stream.write(
                    Bytes::copy_from_slice(&Header::control(Op::Connected).encode()),
                    None,
                    ctx.registry,
                )?;
                let peer = Rc::new(ConnPeer {
                    egress: Rc::clone(&self.egress),
                    conn: self.me.clone(),
                    handle: ctx.handle(),
                });
                self.key = Some(self.exchange.connect(peer));
                debug!(peer = %self.peer, "session opened");
            }
            RecvState::Header => {
                let header = decode_header(&bytes)?;
                match header.op {
                    Op::Disconnect => {
                        trace!(peer = %self.peer, "client disconnecting");
                        self.close(ctx);
                    }
                    Op::Subscribe | Op::Unsubscribe => {
                        if header.message_len != 0 {
                            return Err(ProtocolError::PayloadOnControl(header.op));
                        }
                        self.state = RecvState::Qid(header);
                    }
                    Op::Send => self.state = RecvState::Qid(header),
                    op => return Err(ProtocolError::UnexpectedOp(op)),
                }
            }
            RecvState::Qid(header) => {
                match header.op {
                    Op::Subscribe | Op::Unsubscribe => {
                        let qid = if header.flag {
                            Qid::pattern(bytes)?
                        } else {
                            Qid::Literal(bytes)
                        };
                        self.apply_subscription(header.op, qid);
                    }
                    Op::Send => {
                        self.state = RecvState::Body(header, bytes);
                        return Ok(());
                    }
                    _ => unreachable!("only qid-carrying ops reach this state"),
                }
            }
            RecvState::Body(header, qid) => {
                self.exchange.dispatch(&qid, &bytes, header.flag);
                // Yield before the next frame: a recv chunk full of small
                // SEND frames must not run the parser unboundedly while
                // other handlers wait.
                self.paused = true;
                let me = self.me.clone();
                ctx.defer(move |ctx| {
                    let Some(conn) = me.upgrade() else { return };
                    let mut conn = conn.borrow_mut();
                    conn.paused = false;
                    if !conn.stream.closed() {
                        conn.drive_inbound(ctx);
                    }
                    if conn.stream.closed() {
                        conn.teardown(ctx);
                    }
                });
            }
        }
        Ok(())
    }

    fn apply_subscription(&mut self, op: Op, qid: Qid) {
        let key = self
            .key
            .expect("subscription frames only parse after the handshake");
        let outcome = match op {
            Op::Subscribe => self.exchange.subscribe(key, qid),
            Op::Unsubscribe => {
                let result = self.exchange.unsubscribe(key, &qid);
                if matches!(result, Err(ExchangeError::NotSubscribed)) {
                    warn!(peer = %self.peer, %qid, "unsubscribe without a subscription");
                    return;
                }
                result
            }
            _ => unreachable!(),
        };
        if let Err(err) = outcome {
            warn!(peer = %self.peer, %err, "subscription change rejected");
        }
    }

    /// One sender turn: write the next frame of the fair queue.
    fn send_next(me: &Weak<RefCell<Connection>>, ctx: &LoopCtx<'_>) {
        let Some(conn) = me.upgrade() else { return };
        let mut conn = conn.borrow_mut();
        if conn.stream.closed() {
            conn.egress.borrow_mut().sending = false;
            return;
        }
        let next = conn.egress.borrow_mut().pop();
        let Some((qid, message)) = next else {
            conn.egress.borrow_mut().sending = false;
            return;
        };
        let header = Header::new(Op::Message, false, qid.len(), message.len());
        let registry = ctx.registry;
        let ok = conn
            .stream
            .write(Bytes::copy_from_slice(&header.encode()), None, registry)
            .is_ok()
            && (qid.is_empty() || conn.stream.write(qid, None, registry).is_ok())
            && conn
                .stream
                .write(message, Some(BODY_FLUSHED), registry)
                .is_ok();
        if ok {
            // The body may have flushed synchronously.
            conn.pump_fired(ctx);
        }
        if conn.stream.closed() {
            conn.teardown(ctx);
        }
    }

    /// React to flushed MESSAGE bodies: advance the fair queue and either
    /// schedule the next sender turn or go idle.
    fn pump_fired(&mut self, ctx: &LoopCtx<'_>) {
        for token in self.stream.take_fired() {
            if token != BODY_FLUSHED {
                continue;
            }
            let mut egress = self.egress.borrow_mut();
            egress.flushed();
            if egress.has_work() {
                let me = self.me.clone();
                ctx.defer(move |ctx| Connection::send_next(&me, ctx));
            } else {
                egress.sending = false;
            }
        }
    }
}

impl EventHandler for Connection {
    fn on_ready(&mut self, event: &Event, ctx: &LoopCtx<'_>) {
        self.stream.handle_ready(event, ctx.registry);
        self.pump_fired(ctx);
        if !self.stream.closed() {
            self.drive_inbound(ctx);
        }
        if self.stream.closed() {
            self.teardown(ctx);
        }
    }
}

/// Delivery handle registered with the exchange.
///
/// Deliberately touches only the egress queues and the loop handle, never
/// the connection itself: deliveries may run while this very connection
/// is mid-dispatch (a client publishing to a qid it subscribes to).
struct ConnPeer {
    egress: Rc<RefCell<Egress>>,
    conn: Weak<RefCell<Connection>>,
    handle: LoopHandle,
}

impl ExchangePeer for ConnPeer {
    fn deliver(&self, qid: &Bytes, message: &Bytes) {
        let mut egress = self.egress.borrow_mut();
        egress.enqueue(qid.clone(), message.clone());
        if !egress.sending {
            egress.sending = true;
            let me = self.conn.clone();
            self.handle.defer(move |ctx| Connection::send_next(&me, ctx));
        }
    }

    fn hangup(&self) {
        let me = self.conn.clone();
        self.handle.defer(move |ctx| {
            if let Some(conn) = me.upgrade() {
                conn.borrow_mut().close(ctx);
            }
        });
    }
}

fn decode_header(bytes: &Bytes) -> Result<Header, ProtocolError> {
    let raw: [u8; HEADER_LEN] = bytes
        .as_ref()
        .try_into()
        .expect("read-exactly returns the requested length");
    Header::decode(raw)
}
