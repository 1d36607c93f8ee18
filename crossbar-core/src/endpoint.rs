//! Transport endpoint addressing.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Address of a listener or of a remote exchange.
///
/// String forms: `tcp://host:port` and `ipc:///path/to/socket`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let addr = addr
                .parse::<SocketAddr>()
                .map_err(|_| EndpointError::InvalidTcpAddress(addr.to_string()))?;
            Ok(Self::Tcp(addr))
        } else if let Some(path) = s.strip_prefix("ipc://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(EndpointError::EmptyIpcPath);
                }
                Ok(Self::Ipc(PathBuf::from(path)))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(EndpointError::IpcUnsupported)
            }
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid endpoint scheme: {0} (expected tcp:// or ipc://)")]
    InvalidScheme(String),

    #[error("invalid tcp address: {0}")]
    InvalidTcpAddress(String),

    #[error("ipc endpoint has an empty path")]
    EmptyIpcPath,

    #[error("ipc transport is not supported on this platform")]
    IpcUnsupported,
}
