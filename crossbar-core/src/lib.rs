//! Crossbar Core
//!
//! Runtime kernel for the crossbar message exchange:
//! - Routing table with literal and pattern queue identifiers (`exchange`)
//! - In-process participant (`client`)
//! - Single-threaded readiness event loop (`reactor`)
//! - Bounded non-blocking stream with read-exactly semantics (`stream`)
//! - Segmented read buffer (`buffer`)
//! - Transport endpoint addressing (`endpoint`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod qid;
pub mod reactor;
pub mod stream;

pub mod prelude {
    pub use crate::client::{LocalClient, LocalEvents};
    pub use crate::config::StreamConfig;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::ExchangeError;
    pub use crate::exchange::{Exchange, ExchangePeer, PeerKey};
    pub use crate::qid::{Pattern, Qid};
    pub use crate::reactor::{EventHandler, EventLoop, LoopCtx, LoopHandle};
    pub use crate::stream::{Stream, WriteToken};
}
