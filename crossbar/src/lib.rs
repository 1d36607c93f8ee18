//! # Crossbar
//!
//! An in-process publish/subscribe message exchange together with a
//! stream-socket transport (TCP and Unix-domain), speaking a compact
//! binary framing protocol.
//!
//! Subscribers register interest in a *queue identifier* (qid), either a
//! literal byte string or a pattern anchored at the start of the
//! candidate. Publishers send to a literal qid; the exchange delivers to
//! every matching subscriber (multicast) or to one matching subscriber
//! chosen uniformly at random (unicast). Messages are neither persisted
//! nor acknowledged: a qid with no matching subscriber drops the message.
//!
//! ## Pieces
//!
//! - [`Exchange`]: the routing table.
//! - [`LocalClient`]: an in-process participant.
//! - [`Listener`]: exposes an exchange over `tcp://` or `ipc://`.
//! - [`RemoteClient`]: connects to a remote exchange over either
//!   transport.
//! - [`EventLoop`]: the single-threaded readiness loop everything runs
//!   on.
//!
//! ## Example
//!
//! ```no_run
//! use crossbar::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut event_loop = EventLoop::new()?;
//!     let exchange = Exchange::new();
//!     let endpoint = Endpoint::parse("tcp://127.0.0.1:8000")?;
//!     let _listener = Listener::bind(
//!         &exchange,
//!         &endpoint,
//!         StreamConfig::default(),
//!         &event_loop.ctx(),
//!     )?;
//!     event_loop.run()?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub use crossbar_core::buffer::ChunkBuffer;
pub use crossbar_core::client::{LocalClient, LocalEvents};
pub use crossbar_core::config::StreamConfig;
pub use crossbar_core::endpoint::{Endpoint, EndpointError};
pub use crossbar_core::error::ExchangeError;
pub use crossbar_core::exchange::{Exchange, ExchangePeer, PeerKey};
pub use crossbar_core::qid::{Pattern, PatternError, Qid};
pub use crossbar_core::reactor::{EventHandler, EventLoop, LoopCtx, LoopHandle, TimerId};
pub use crossbar_core::stream::{Socket, Stream, WriteToken};
pub use crossbar_wire::client::{ClientCore, ClientEvents, RemoteClient};
pub use crossbar_wire::frame::{Header, Op, ProtocolError, MAX_MESSAGE_LEN, MAX_QID_LEN};
pub use crossbar_wire::listener::Listener;

pub mod prelude {
    pub use crossbar_core::prelude::*;
    pub use crossbar_wire::prelude::*;
    pub use bytes::Bytes;
}
