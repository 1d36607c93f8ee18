//! Crossbar Wire
//!
//! The stream-socket transport of the crossbar exchange: frame codec,
//! server-side connections with fair-queued egress, TCP / Unix-domain
//! adapters, and the remote client.
//!
//! A session on the wire is `CONNECT CONNECTED (SUBSCRIBE | UNSUBSCRIBE |
//! SEND | MESSAGE)* DISCONNECT?`. CONNECT must be the very first
//! client-to-server frame; MESSAGE flows server-to-client only, SEND
//! client-to-server only.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod connection;
pub mod frame;
pub mod listener;

pub use client::{ClientCore, ClientEvents, RemoteClient};
pub use connection::Connection;
pub use frame::{Header, Op, ProtocolError, MAX_MESSAGE_LEN, MAX_QID_LEN};
pub use listener::Listener;

pub mod prelude {
    pub use crate::client::{ClientCore, ClientEvents, RemoteClient};
    pub use crate::frame::{Header, Op, ProtocolError};
    pub use crate::listener::Listener;
}
