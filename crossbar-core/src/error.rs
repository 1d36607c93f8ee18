use thiserror::Error;

/// Errors surfaced by exchange and client operations.
///
/// These are programmer-facing conditions, not wire conditions: a remote
/// peer can never trigger `AlreadyConnected`, because the connection layer
/// enforces the handshake order before touching the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The client is not attached to an exchange.
    #[error("client is not connected to an exchange")]
    NotConnected,

    /// `connect` was called on a client that is already attached.
    #[error("client is already connected to an exchange")]
    AlreadyConnected,

    /// Unsubscribe of a qid the client never subscribed to.
    #[error("client holds no subscription for the given qid")]
    NotSubscribed,
}

/// Result alias for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;
