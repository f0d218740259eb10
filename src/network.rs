//! Listening, accepting and relaying.
//!
//! [`proxy_server::ProxyServer`] runs the accept loop of one session,
//! [`connection_handler::ConnectionHandler`] relays a single client to the target and
//! [`worker_pool::WorkerPool`] schedules the handlers.

/// Per-connection relay between client and target.
pub mod connection_handler;
/// Accept loop and server state machine.
pub mod proxy_server;
/// TLS termination towards clients and TLS connections to the target.
pub mod tls;
pub mod types;
/// Task pool with graceful then forced shutdown.
pub mod worker_pool;

pub use connection_handler::{ConnectionHandler, HandlerContext};
pub use proxy_server::ProxyServer;
pub use tls::TlsContext;
pub use types::{ClientConnection, ServerState};
pub use worker_pool::{PoolShutdown, WorkerPool};
