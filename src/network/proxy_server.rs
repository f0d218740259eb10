//! # Proxy Server
//!
//! Owns the listening socket of one session and hands every accepted client to a
//! [`ConnectionHandler`] running on the session's [`WorkerPool`].
//!
//! ```text
//! ┌─────────┐  bind  ┌───────┐       ┌───────────┐  stop()  ┌──────────┐       ┌─────────┐
//! │ Created │──────▶ │ Bound │─────▶ │ Accepting │────────▶ │ Stopping │─────▶ │ Stopped │
//! └─────────┘        └───────┘       └───────────┘          └──────────┘       └─────────┘
//!      │                                                                            ▲
//!      └──────────────────────────── bind failure ──────────────────────────────────┘
//! ```
//!
//! For each accepted socket the [`ConnectionAcceptor`] is called and must return before the
//! handler is submitted, so capture events never refer to a connection nobody knows about.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use uuid::Uuid;

use super::connection_handler::{ConnectionHandler, HandlerContext};
use super::types::{ClientConnection, ServerState};
use super::worker_pool::WorkerPool;
use crate::data_capture::sink::{contained, ConnectionAcceptor};
use crate::error_handling::types::NetworkError;
use crate::error_handling::ErrorCategory;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProxyServer {
    listen_address: String,
    listen_port: u16,
    context: Arc<HandlerContext>,
    acceptor: Option<Arc<dyn ConnectionAcceptor>>,
    pool: Arc<WorkerPool>,
    state: watch::Sender<ServerState>,
    stop: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
}

impl ProxyServer {
    pub fn new(
        listen_address: impl Into<String>,
        listen_port: u16,
        context: Arc<HandlerContext>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            listen_port,
            context,
            acceptor: None,
            pool,
            state: watch::Sender::new(ServerState::Created),
            stop: watch::Sender::new(false),
            local_addr: OnceLock::new(),
        }
    }

    pub fn with_acceptor(mut self, acceptor: Option<Arc<dyn ConnectionAcceptor>>) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Address actually bound, once the server got that far.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServerState::Bound | ServerState::Accepting)
    }

    /// Requests the accept loop to end. Already accepted connections are not touched.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        self.state.send_if_modified(|state| match state {
            ServerState::Created | ServerState::Bound | ServerState::Accepting => {
                *state = ServerState::Stopping;
                true
            }
            ServerState::Stopping | ServerState::Stopped => false,
        });
    }

    /// Binds and accepts until [`stop`](Self::stop) is called.
    ///
    /// A bind failure is reported under [`ErrorCategory::ProxyServer`] and the server goes
    /// straight to [`ServerState::Stopped`]. Other failures never end the loop.
    pub async fn run(&self) {
        let _stopped = StoppedOnExit(&self.state);

        if *self.stop.borrow() {
            debug!("Proxy server stopped before it started");
            return;
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Unable to listen on {}:{}: {}",
                    self.listen_address, self.listen_port, e
                );
                self.context.reporter.report(&e, ErrorCategory::ProxyServer);
                return;
            }
        };

        let bound = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.context
                    .reporter
                    .report(&NetworkError::BindError(e), ErrorCategory::ProxyServer);
                return;
            }
        };
        let _ = self.local_addr.set(bound);
        self.advance(ServerState::Bound);
        info!(
            "Proxy listening on {} -> {}:{}",
            bound, self.context.target_host, self.context.target_port
        );

        self.advance(ServerState::Accepting);
        self.accept_loop(&listener, bound).await;

        drop(listener);
        info!("Proxy on {} no longer accepting connections", bound);
    }

    async fn bind(&self) -> Result<TcpListener, NetworkError> {
        let target = format!("{}:{}", self.listen_address, self.listen_port);
        let addr = lookup_host((self.listen_address.as_str(), self.listen_port))
            .await
            .map_err(|e| NetworkError::AddressResolution(format!("{}: {}", target, e)))?
            .next()
            .ok_or_else(|| NetworkError::AddressResolution(target.clone()))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(NetworkError::BindError)?;

        socket.set_reuseaddr(true).map_err(NetworkError::BindError)?;
        socket.bind(addr).map_err(NetworkError::BindError)?;
        socket.listen(LISTEN_BACKLOG).map_err(NetworkError::BindError)
    }

    async fn accept_loop(&self, listener: &TcpListener, bound: SocketAddr) {
        let mut stop = self.stop.subscribe();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => {
                    debug!("Stop requested, leaving accept loop on {}", bound);
                    break;
                }
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer, bound).await,
                Err(e) => {
                    if !self.accept_failed(e).await {
                        break;
                    }
                }
            }
        }
    }

    /// Handles a failed `accept`; returns whether the loop should keep going.
    async fn accept_failed(&self, error: io::Error) -> bool {
        if *self.stop.borrow() {
            debug!("Accept interrupted by shutdown: {}", error);
            return false;
        }
        self.context
            .reporter
            .report(&NetworkError::AcceptError(error), ErrorCategory::ProxyServer);
        tokio::time::sleep(ACCEPT_BACKOFF).await;
        true
    }

    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr, bound: SocketAddr) {
        let connection_id = Uuid::new_v4();
        let client = ClientConnection {
            peer_addr: peer,
            local_addr: stream.local_addr().unwrap_or(bound),
            accepted_at: Utc::now(),
        };
        info!("[{}] accepted connection from {}", connection_id, peer);

        if let Some(acceptor) = &self.acceptor {
            let verdict = contained("connection accepted", connection_id, || {
                acceptor.on_connection_accepted(connection_id, &client)
            });
            match verdict {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!("[{}] connection from {} refused: {}", connection_id, peer, e);
                    self.context
                        .reporter
                        .report(&e, ErrorCategory::ConnectionHandling);
                    return;
                }
                None => return,
            }
        }

        let handler = ConnectionHandler::new(connection_id, stream, peer, Arc::clone(&self.context));
        if let Err(e) = self.pool.submit(handler.run()).await {
            warn!("[{}] connection from {} dropped: {}", connection_id, peer, e);
        }
    }

    fn advance(&self, next: ServerState) {
        self.state.send_if_modified(|state| {
            if *state == ServerState::Stopping || *state == ServerState::Stopped {
                return false;
            }
            *state = next;
            true
        });
    }
}

struct StoppedOnExit<'a>(&'a watch::Sender<ServerState>);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.0.send_replace(ServerState::Stopped);
    }
}
