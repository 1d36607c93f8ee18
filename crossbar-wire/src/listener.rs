//! Socket adapters: expose an exchange over TCP or Unix-domain sockets.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;

use mio::event::{Event, Source};
use mio::{Interest, Token};
use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::{debug, error, warn};

use crossbar_core::config::StreamConfig;
use crossbar_core::endpoint::Endpoint;
use crossbar_core::exchange::Exchange;
use crossbar_core::reactor::{EventHandler, LoopCtx};
use crossbar_core::stream::Socket;

use crate::connection::Connection;

/// Listen backlog for both transport flavours.
const BACKLOG: i32 = 128;

enum AcceptSocket {
    Tcp(mio::net::TcpListener),
    Unix(mio::net::UnixListener),
}

impl AcceptSocket {
    /// Accept one pending connection, yielding the wrapped stream and a
    /// peer label for logs.
    fn accept(&self) -> io::Result<(Socket, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nodelay(true).ok();
                Ok((Socket::Tcp(stream), addr.to_string()))
            }
            Self::Unix(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((Socket::Unix(stream), format!("{addr:?}")))
            }
        }
    }
}

/// A listening socket bound to an exchange.
///
/// Accepted sockets become [`Connection`]s that participate in the
/// exchange on behalf of their remote client.
pub struct Listener {
    exchange: Exchange,
    /// `None` once stopped; dropping it closes the listening socket.
    sock: Option<AcceptSocket>,
    token: Token,
    cfg: StreamConfig,
    started: bool,
}

impl Listener {
    /// Bind a TCP adapter. Use port 0 for an ephemeral port and read it
    /// back with [`Self::local_addr`].
    pub fn bind_tcp(
        exchange: &Exchange,
        addr: SocketAddr,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        // socket2 creates the fd with CLOEXEC.
        let sock = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        sock.listen(BACKLOG)?;
        let listener = mio::net::TcpListener::from_std(sock.into());
        Self::start(exchange, AcceptSocket::Tcp(listener), cfg, ctx)
    }

    /// Bind a Unix-domain adapter, unlinking a stale socket file first.
    pub fn bind_ipc(
        exchange: &Exchange,
        path: &Path,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let sock = socket2::Socket::new(Domain::UNIX, Type::STREAM, None)?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&SockAddr::unix(path)?)?;
        sock.listen(BACKLOG)?;
        let listener = mio::net::UnixListener::from_std(std::os::unix::net::UnixListener::from(
            std::os::fd::OwnedFd::from(sock),
        ));
        Self::start(exchange, AcceptSocket::Unix(listener), cfg, ctx)
    }

    /// Bind whichever flavour the endpoint names.
    pub fn bind(
        exchange: &Exchange,
        endpoint: &Endpoint,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        match endpoint {
            Endpoint::Tcp(addr) => Self::bind_tcp(exchange, *addr, cfg, ctx),
            #[cfg(unix)]
            Endpoint::Ipc(path) => Self::bind_ipc(exchange, path, cfg, ctx),
        }
    }

    fn start(
        exchange: &Exchange,
        mut sock: AcceptSocket,
        cfg: StreamConfig,
        ctx: &LoopCtx<'_>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        let token = ctx.next_token();
        match &mut sock {
            AcceptSocket::Tcp(listener) => {
                listener.register(ctx.registry, token, Interest::READABLE)?;
            }
            AcceptSocket::Unix(listener) => {
                listener.register(ctx.registry, token, Interest::READABLE)?;
            }
        }
        let listener = Rc::new(RefCell::new(Self {
            exchange: exchange.clone(),
            sock: Some(sock),
            token,
            cfg,
            started: true,
        }));
        ctx.insert_handler(token, listener.clone());
        debug!(token = token.0, "adapter listening");
        Ok(listener)
    }

    /// Local address of a TCP adapter.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.sock {
            Some(AcceptSocket::Tcp(listener)) => listener.local_addr(),
            Some(AcceptSocket::Unix(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unix-domain adapter has no tcp address",
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "adapter is stopped",
            )),
        }
    }

    /// Stop accepting and disconnect every client attached to the
    /// exchange.
    pub fn stop(&mut self, ctx: &LoopCtx<'_>) {
        assert!(self.started, "adapter already stopped");
        self.started = false;
        ctx.remove_handler(self.token);
        if let Some(mut sock) = self.sock.take() {
            let result = match &mut sock {
                AcceptSocket::Tcp(listener) => listener.deregister(ctx.registry),
                AcceptSocket::Unix(listener) => listener.deregister(ctx.registry),
            };
            if let Err(err) = result {
                debug!(?err, "adapter deregister");
            }
        }
        self.exchange.disconnect_all();
        debug!(token = self.token.0, "adapter stopped");
    }
}

impl EventHandler for Listener {
    fn on_ready(&mut self, _event: &Event, ctx: &LoopCtx<'_>) {
        loop {
            let Some(sock) = &self.sock else { return };
            match sock.accept() {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted");
                    // A failure here must not take the adapter down; the
                    // connection closes itself and logs on its own paths,
                    // so only the spawn itself is guarded.
                    let conn = Connection::spawn(
                        self.exchange.clone(),
                        socket,
                        peer.clone(),
                        self.cfg,
                        ctx,
                    );
                    if conn.borrow().is_detached() {
                        error!(%peer, "connection setup failed");
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }
}
