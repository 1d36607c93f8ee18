//! Remote client: the peer-side implementation of the wire protocol.
//!
//! Connects non-blockingly, performs the CONNECT / CONNECTED handshake,
//! and only then reports `on_connected`. Afterwards the only legal
//! server-to-client frame is MESSAGE; anything else is a protocol error
//! and closes the stream.
//!
//! User-initiated sends are serialized through a queue so the header, qid,
//! and body of one frame stay contiguous on the wire; between frames the
//! sender reschedules itself through a deferred callback instead of
//! looping, so a large batch of sends cannot hold the event loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use mio::event::Event;
use tracing::{debug, trace, warn};

use crossbar_core::config::StreamConfig;
use crossbar_core::endpoint::Endpoint;
use crossbar_core::qid::Qid;
use crossbar_core::reactor::{EventHandler, LoopCtx};
use crossbar_core::stream::{Socket, Stream, WriteToken};

use crate::frame::{Header, Op, ProtocolError, HEADER_LEN};

/// Completion token of the DISCONNECT header: close once it flushes.
const DISCONNECT_FLUSHED: WriteToken = 1;

/// Callbacks of a remote client.
///
/// All callbacks receive the client core, so a delegate can subscribe,
/// send, or close from inside them, and the loop context for timers.
pub trait ClientEvents {
    fn on_connected(&mut self, _client: &mut ClientCore, _ctx: &LoopCtx<'_>) {}
    fn on_disconnected(&mut self, _ctx: &LoopCtx<'_>) {}
    fn on_message(
        &mut self,
        _client: &mut ClientCore,
        _ctx: &LoopCtx<'_>,
        _qid: &Bytes,
        _message: &Bytes,
    ) {
    }
    /// A protocol failure (handshake mismatch, unexpected frame). The
    /// stream closes right after this callback.
    fn on_error(&mut self, _err: &ProtocolError, _ctx: &LoopCtx<'_>) {}
}

enum RecvState {
    /// TCP/Unix connect still in flight.
    Connecting,
    /// CONNECT sent, awaiting the CONNECTED reply.
    AwaitConnected,
    Header,
    Qid(Header),
    Body(Header, Bytes),
}

/// Protocol operations of a connected client, usable from delegate
/// callbacks and from setup code.
pub struct ClientCore {
    stream: Stream,
    connected: bool,
    /// User sends awaiting serialization, oldest first.
    sending: VecDeque<(Bytes, Bytes, bool)>,
    me: Weak<RefCell<RemoteClient>>,
}

impl ClientCore {
    /// Queue one message to a literal qid. The frame goes out on this or
    /// a following loop iteration.
    pub fn send(
        &mut self,
        qid: impl Into<Bytes>,
        message: impl Into<Bytes>,
        multicast: bool,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<()> {
        if self.stream.closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection to the exchange is closed",
            ));
        }
        self.sending.push_back((qid.into(), message.into(), multicast));
        if self.sending.len() == 1 {
            self.pump_send(ctx);
        }
        Ok(())
    }

    pub fn subscribe(&mut self, qid: &Qid, ctx: &LoopCtx<'_>) -> io::Result<()> {
        self.write_subscription(Op::Subscribe, qid, ctx)
    }

    pub fn unsubscribe(&mut self, qid: &Qid, ctx: &LoopCtx<'_>) -> io::Result<()> {
        self.write_subscription(Op::Unsubscribe, qid, ctx)
    }

    /// Announce departure and close once the frame has flushed.
    pub fn close(&mut self, ctx: &LoopCtx<'_>) {
        if self.stream.closed() {
            return;
        }
        let header = Header::control(Op::Disconnect);
        let _ = self.stream.write(
            Bytes::copy_from_slice(&header.encode()),
            Some(DISCONNECT_FLUSHED),
            ctx.registry,
        );
        // An unobstructed write flushes synchronously; otherwise the
        // token is picked up on the writable event that drains it.
        for token in self.stream.take_fired() {
            if token == DISCONNECT_FLUSHED {
                self.stream.close(ctx.registry);
            }
        }
        if self.stream.closed() {
            schedule_teardown(&self.me, ctx);
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected && !self.stream.closed()
    }

    fn write_subscription(&mut self, op: Op, qid: &Qid, ctx: &LoopCtx<'_>) -> io::Result<()> {
        let payload = qid.as_bytes().clone();
        let header = Header::new(op, qid.is_pattern(), payload.len(), 0);
        self.stream
            .write(Bytes::copy_from_slice(&header.encode()), None, ctx.registry)?;
        if !payload.is_empty() {
            self.stream.write(payload, None, ctx.registry)?;
        }
        Ok(())
    }

    /// Emit one queued SEND frame; reschedule while work remains.
    fn pump_send(&mut self, ctx: &LoopCtx<'_>) {
        let Some((qid, message, multicast)) = self.sending.pop_front() else {
            return;
        };
        let header = Header::new(Op::Send, multicast, qid.len(), message.len());
        let registry = ctx.registry;
        let ok = self
            .stream
            .write(Bytes::copy_from_slice(&header.encode()), None, registry)
            .is_ok()
            && (qid.is_empty() || self.stream.write(qid, None, registry).is_ok())
            && (message.is_empty() || self.stream.write(message, None, registry).is_ok());
        if ok && !self.sending.is_empty() && !self.stream.closed() {
            let me = self.me.clone();
            ctx.defer(move |ctx| {
                if let Some(client) = me.upgrade() {
                    client.borrow_mut().core.pump_send(ctx);
                }
            });
        }
        if self.stream.closed() {
            schedule_teardown(&self.me, ctx);
        }
    }
}

/// Run the owner's teardown on the next loop iteration. Deferral keeps
/// this callable from inside delegate callbacks, where the client is
/// already mutably borrowed.
fn schedule_teardown(me: &Weak<RefCell<RemoteClient>>, ctx: &LoopCtx<'_>) {
    let me = me.clone();
    ctx.defer(move |ctx| {
        if let Some(client) = me.upgrade() {
            let mut client = client.borrow_mut();
            if client.core.stream.closed() {
                client.teardown(ctx);
            }
        }
    });
}

/// Client-side peer of a remote exchange.
pub struct RemoteClient {
    core: ClientCore,
    state: RecvState,
    delegate: Box<dyn ClientEvents>,
    peer: String,
    detached: bool,
    me: Weak<RefCell<RemoteClient>>,
}

impl RemoteClient {
    /// Open a TCP connection to a remote exchange.
    pub fn connect_tcp(
        addr: SocketAddr,
        delegate: Box<dyn ClientEvents>,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        let stream = mio::net::TcpStream::connect(addr)?;
        Self::spawn(Socket::Tcp(stream), addr.to_string(), delegate, cfg, ctx)
    }

    /// Open a Unix-domain connection to a remote exchange.
    pub fn connect_ipc(
        path: &Path,
        delegate: Box<dyn ClientEvents>,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        let stream = mio::net::UnixStream::connect(path)?;
        Self::spawn(
            Socket::Unix(stream),
            path.display().to_string(),
            delegate,
            cfg,
            ctx,
        )
    }

    /// Connect to whichever flavour the endpoint names.
    pub fn connect(
        endpoint: &Endpoint,
        delegate: Box<dyn ClientEvents>,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        match endpoint {
            Endpoint::Tcp(addr) => Self::connect_tcp(*addr, delegate, cfg, ctx),
            #[cfg(unix)]
            Endpoint::Ipc(path) => Self::connect_ipc(path, delegate, cfg, ctx),
        }
    }

    fn spawn(
        socket: Socket,
        peer: String,
        delegate: Box<dyn ClientEvents>,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        let token = ctx.next_token();
        let stream = Stream::new(socket, token, cfg);
        let client = Rc::new_cyclic(|me| {
            RefCell::new(Self {
                core: ClientCore {
                    stream,
                    connected: false,
                    sending: VecDeque::new(),
                    me: me.clone(),
                },
                state: RecvState::Connecting,
                delegate,
                peer,
                detached: false,
                me: me.clone(),
            })
        });
        ctx.insert_handler(token, client.clone());
        {
            let mut started = client.borrow_mut();
            started.core.stream.await_connect(ctx.registry);
            if started.core.stream.closed() {
                started.teardown(ctx);
            }
        }
        Ok(client)
    }

    /// Borrow the protocol core, e.g. to send from outside a callback.
    pub fn core(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    fn finish_connect(&mut self, ctx: &LoopCtx<'_>) {
        match self.core.stream.finish_connect(ctx.registry) {
            Ok(()) => {
                trace!(peer = %self.peer, "transport connected, sending CONNECT");
                self.state = RecvState::AwaitConnected;
                let header = Header::control(Op::Connect);
                let _ = self.core.stream.write(
                    Bytes::copy_from_slice(&header.encode()),
                    None,
                    ctx.registry,
                );
            }
            Err(err) => {
                warn!(peer = %self.peer, ?err, "connect failed");
            }
        }
    }

    fn drive_inbound(&mut self, ctx: &LoopCtx<'_>) {
        while !self.core.stream.closed() {
            let need = match &self.state {
                RecvState::Connecting => break,
                RecvState::AwaitConnected | RecvState::Header => HEADER_LEN,
                RecvState::Qid(header) => header.qid_len,
                RecvState::Body(header, _) => header.message_len,
            };
            let bytes = if self.core.stream.reading() {
                self.core.stream.take_ready()
            } else {
                self.core.stream.read_exactly(need, ctx.registry)
            };
            let Some(bytes) = bytes else { break };
            if let Err(err) = self.step(bytes, ctx) {
                warn!(peer = %self.peer, %err, "protocol error, closing");
                self.delegate.on_error(&err, ctx);
                self.core.stream.close(ctx.registry);
            }
        }
    }

    fn step(&mut self, bytes: Bytes, ctx: &LoopCtx<'_>) -> Result<(), ProtocolError> {
        match std::mem::replace(&mut self.state, RecvState::Header) {
            RecvState::Connecting => unreachable!("no reads are armed while connecting"),
            RecvState::AwaitConnected => {
                let header = decode_header(&bytes)?;
                if header.op != Op::Connected {
                    return Err(ProtocolError::Handshake(header.op));
                }
                debug!(peer = %self.peer, "session established");
                self.core.connected = true;
                self.delegate.on_connected(&mut self.core, ctx);
            }
            RecvState::Header => {
                let header = decode_header(&bytes)?;
                if header.op != Op::Message {
                    return Err(ProtocolError::UnexpectedOp(header.op));
                }
                self.state = RecvState::Qid(header);
            }
            RecvState::Qid(header) => {
                self.state = RecvState::Body(header, bytes);
            }
            RecvState::Body(_, qid) => {
                self.delegate.on_message(&mut self.core, ctx, &qid, &bytes);
            }
        }
        Ok(())
    }

    fn teardown(&mut self, ctx: &LoopCtx<'_>) {
        if self.detached {
            return;
        }
        self.detached = true;
        ctx.remove_handler(self.core.stream.token());
        self.core.connected = false;
        debug!(peer = %self.peer, "client connection closed");
        self.delegate.on_disconnected(ctx);
    }
}

impl EventHandler for RemoteClient {
    fn on_ready(&mut self, event: &Event, ctx: &LoopCtx<'_>) {
        if matches!(self.state, RecvState::Connecting) {
            if event.is_writable() || event.is_error() {
                self.finish_connect(ctx);
                if !self.core.stream.closed() {
                    self.drive_inbound(ctx);
                }
            }
        } else {
            self.core.stream.handle_ready(event, ctx.registry);
            for token in self.core.stream.take_fired() {
                if token == DISCONNECT_FLUSHED {
                    trace!(peer = %self.peer, "disconnect flushed");
                    self.core.stream.close(ctx.registry);
                }
            }
            if !self.core.stream.closed() {
                self.drive_inbound(ctx);
            }
        }
        if self.core.stream.closed() {
            self.teardown(ctx);
        }
    }
}

fn decode_header(bytes: &Bytes) -> Result<Header, ProtocolError> {
    let raw: [u8; HEADER_LEN] = bytes
        .as_ref()
        .try_into()
        .expect("read-exactly returns the requested length");
    Header::decode(raw)
}
