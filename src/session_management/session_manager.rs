use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::session::ProxySession;
use crate::certificates::CertificateIssuer;
use crate::configuration::types::ProxyTuning;
use crate::data_capture::forwarder::DrainSettings;
use crate::data_capture::sink::{CaptureSink, ConnectionAcceptor};
use crate::error_handling::types::SessionError;
use crate::error_handling::{ErrorCategory, ErrorReporter};
use crate::network::{HandlerContext, PoolShutdown, ProxyServer, ServerState, TlsContext, WorkerPool};

/// Bounded waits used when a session is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// How long the accept loop gets to notice the stop request before it is aborted.
    pub accept_loop: Duration,
    pub graceful: Duration,
    pub forced: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::from(&ProxyTuning::default())
    }
}

impl From<&ProxyTuning> for ShutdownPolicy {
    fn from(tuning: &ProxyTuning) -> Self {
        Self {
            accept_loop: Duration::from_secs(1),
            graceful: tuning.graceful_shutdown(),
            forced: tuning.forced_shutdown(),
        }
    }
}

struct RunningServer {
    session: Arc<ProxySession>,
    server: Arc<ProxyServer>,
    pool: Arc<WorkerPool>,
    task: JoinHandle<()>,
}

/// Owns the proxy server of the current session, its accept task and its worker pool.
///
/// At most one server runs at a time.
pub struct SessionManager {
    tuning: ProxyTuning,
    issuer: Option<Arc<CertificateIssuer>>,
    reporter: Arc<dyn ErrorReporter>,
    shutdown: ShutdownPolicy,
    running: Mutex<Option<RunningServer>>,
}

impl SessionManager {
    pub fn new(
        tuning: ProxyTuning,
        issuer: Option<Arc<CertificateIssuer>>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let shutdown = ShutdownPolicy::from(&tuning);
        Self {
            tuning,
            issuer,
            reporter,
            shutdown,
            running: Mutex::new(None),
        }
    }

    pub fn with_shutdown_policy(mut self, shutdown: ShutdownPolicy) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Starts serving `session` in the background.
    ///
    /// Returns once the accept task is spawned; bind failures surface through the reporter
    /// and the server state, not here. Fails if a server is already running or the TLS
    /// material for the session cannot be prepared.
    pub fn start_server(
        &self,
        session: Arc<ProxySession>,
        sink: Option<Arc<dyn CaptureSink>>,
        acceptor: Option<Arc<dyn ConnectionAcceptor>>,
    ) -> Result<(), SessionError> {
        let mut running = self.lock();
        if let Some(current) = running.as_ref() {
            if current.server.state() != ServerState::Stopped {
                return Err(SessionError::AlreadyRunning);
            }
            debug!("Discarding stopped server of {}", current.session.display_info());
        }

        let tls = match TlsContext::for_session(&session, &self.tuning, self.issuer.as_deref()) {
            Ok(tls) => tls,
            Err(e) => {
                self.reporter.report(&e, ErrorCategory::Initialization);
                return Err(e);
            }
        };

        let context = HandlerContext::new(
            session.target_host(),
            session.target_port(),
            tls,
            Arc::clone(&self.reporter),
        )
        .with_sink(sink)
        .with_drain(DrainSettings::from(&self.tuning));

        let pool = Arc::new(WorkerPool::new(self.tuning.max_connections));
        let server = Arc::new(
            ProxyServer::new(
                session.local_address(),
                session.local_port(),
                Arc::new(context),
                Arc::clone(&pool),
            )
            .with_acceptor(acceptor),
        );

        session.set_active(true);
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            let session = Arc::clone(&session);
            async move {
                server.run().await;
                // Also covers a failed bind, where stop_server is never called.
                session.set_active(false);
            }
        });

        info!("Proxy server started: {}", session.display_info());

        *running = Some(RunningServer {
            session,
            server,
            pool,
            task,
        });
        Ok(())
    }

    /// Stops the running server, if any, and shuts its worker pool down.
    ///
    /// Connections still relaying after the graceful and forced waits are left running;
    /// the returned [`PoolShutdown`] says whether that happened.
    pub async fn stop_server(&self) -> Option<PoolShutdown> {
        let RunningServer {
            session,
            server,
            pool,
            mut task,
        } = self.lock().take()?;

        info!("Stopping proxy server...");
        server.stop();
        session.set_active(false);

        if timeout(self.shutdown.accept_loop, &mut task).await.is_err() {
            warn!("Accept loop did not stop in time, aborting it");
            task.abort();
        }

        let outcome = pool
            .shutdown(self.shutdown.graceful, self.shutdown.forced)
            .await;
        info!("Proxy server stopped ({:?})", outcome);
        Some(outcome)
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|current| current.server.is_running())
    }

    pub fn server_state(&self) -> Option<ServerState> {
        self.lock().as_ref().map(|current| current.server.state())
    }

    /// Waits until the current server is accepting or has given up.
    ///
    /// Returns the bound address when it is accepting.
    pub async fn wait_until_listening(&self) -> Option<SocketAddr> {
        let (server, mut states) = {
            let running = self.lock();
            let current = running.as_ref()?;
            (Arc::clone(&current.server), current.server.subscribe_state())
        };

        let reached = states
            .wait_for(|state| {
                matches!(
                    state,
                    ServerState::Accepting | ServerState::Stopping | ServerState::Stopped
                )
            })
            .await
            .map(|state| *state);

        match reached {
            Ok(ServerState::Accepting) => server.local_addr(),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningServer>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection_handler::test_support::RecordingReporter;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn manager(reporter: &Arc<RecordingReporter>) -> SessionManager {
        SessionManager::new(ProxyTuning::default(), None, reporter.clone())
    }

    fn session(port: u16, target_port: u16) -> Arc<ProxySession> {
        Arc::new(ProxySession::new("127.0.0.1", port, "127.0.0.1", target_port, false, None).unwrap())
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let _ = env_logger::builder().is_test(true).try_init();
        let reporter = Arc::new(RecordingReporter::default());
        let manager = manager(&reporter);
        let session = session(free_port().await, 9);

        manager.start_server(Arc::clone(&session), None, None).unwrap();
        let addr = manager.wait_until_listening().await.unwrap();
        assert_eq!(addr.port(), session.local_port());
        assert!(manager.is_running());
        assert!(session.is_active());

        let outcome = manager.stop_server().await;
        assert_eq!(outcome, Some(PoolShutdown::Graceful));
        assert!(!manager.is_running());
        assert!(!session.is_active());
        assert!(manager.server_state().is_none());
        assert!(manager.stop_server().await.is_none());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let reporter = Arc::new(RecordingReporter::default());
        let manager = manager(&reporter);

        manager.start_server(session(free_port().await, 9), None, None).unwrap();
        manager.wait_until_listening().await.unwrap();

        let second = manager.start_server(session(free_port().await, 9), None, None);
        assert!(matches!(second, Err(SessionError::AlreadyRunning)));

        manager.stop_server().await;
    }

    #[tokio::test]
    async fn test_bind_failure_allows_restart() {
        let reporter = Arc::new(RecordingReporter::default());
        let manager = manager(&reporter);
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let failed = session(port, 9);
        manager.start_server(Arc::clone(&failed), None, None).unwrap();
        assert!(manager.wait_until_listening().await.is_none());
        assert_eq!(manager.server_state(), Some(ServerState::Stopped));
        timeout(Duration::from_secs(5), async {
            while failed.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(reporter.categories(), vec![ErrorCategory::ProxyServer]);
        assert_eq!(reporter.fatal_count(), 1);

        drop(occupied);
        manager.start_server(session(port, 9), None, None).unwrap();
        assert!(manager.wait_until_listening().await.is_some());
        manager.stop_server().await;
    }

    #[tokio::test]
    async fn test_tls_without_issuer_is_reported() {
        let reporter = Arc::new(RecordingReporter::default());
        let manager = manager(&reporter);
        let tls_session = Arc::new(
            ProxySession::new("127.0.0.1", 18443, "127.0.0.1", 443, true, Some("localhost".to_string()))
                .unwrap(),
        );

        let result = manager.start_server(Arc::clone(&tls_session), None, None);

        assert!(matches!(result, Err(SessionError::CertificateError(_))));
        assert_eq!(reporter.categories(), vec![ErrorCategory::Initialization]);
        assert!(!tls_session.is_active());
        assert!(!manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_stuck_connection_is_bounded() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            // Accepts and then never answers nor closes.
            let (stream, _) = target.accept().await.unwrap();
            let _ = accepted_tx.send(());
            std::future::pending::<()>().await;
            drop(stream);
        });

        let reporter = Arc::new(RecordingReporter::default());
        let manager = manager(&reporter);
        manager
            .start_server(session(free_port().await, target_port), None, None)
            .unwrap();
        let addr = manager.wait_until_listening().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello?").await.unwrap();
        accepted_rx.await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = manager.stop_server().await;

        assert_eq!(outcome, Some(PoolShutdown::Incomplete));
        assert!(started.elapsed() <= Duration::from_secs(16));

        drop(client);
    }
}
