use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Lifecycle of a [`ProxyServer`](super::proxy_server::ProxyServer).
///
/// `Created → Bound → Accepting → Stopping → Stopped`; a failed bind goes straight from
/// `Created` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Accepting,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Bound => "bound",
            ServerState::Accepting => "accepting",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Socket metadata of an accepted client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConnection {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub accepted_at: DateTime<Utc>,
}

/// Byte stream the proxy can relay over: plain TCP or either side of a TLS session.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;
