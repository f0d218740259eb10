use log::{debug, error, info, trace};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::tls::TlsContext;
use crate::data_capture::forwarder::{DrainSettings, ForwardOutcome, Forwarder, Teardown};
use crate::data_capture::sink::{CaptureSink, ClosedNotice};
use crate::data_capture::types::Direction;
use crate::error_handling::types::NetworkError;
use crate::error_handling::{ErrorCategory, ErrorReporter};

/// Everything a handler needs that is shared by all connections of one session.
pub struct HandlerContext {
    pub target_host: String,
    pub target_port: u16,
    pub tls: TlsContext,
    pub sink: Option<Arc<dyn CaptureSink>>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub drain: DrainSettings,
}

impl HandlerContext {
    pub fn new(
        target_host: impl Into<String>,
        target_port: u16,
        tls: TlsContext,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            tls,
            sink: None,
            reporter,
            drain: DrainSettings::default(),
        }
    }

    pub fn with_sink(mut self, sink: Option<Arc<dyn CaptureSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_drain(mut self, drain: DrainSettings) -> Self {
        self.drain = drain;
        self
    }
}

/// Relays one accepted client to the target.
///
/// The closed notification is armed on construction, so it fires exactly once whether the
/// handler runs to completion, fails to reach the target or is dropped without ever running.
pub struct ConnectionHandler {
    connection_id: Uuid,
    client: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<HandlerContext>,
    closed: ClosedNotice,
}

impl ConnectionHandler {
    pub fn new(
        connection_id: Uuid,
        client: TcpStream,
        peer_addr: SocketAddr,
        context: Arc<HandlerContext>,
    ) -> Self {
        let closed = ClosedNotice::new(connection_id, context.sink.clone());
        Self {
            connection_id,
            client,
            peer_addr,
            context,
            closed,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Runs until both directions are done. Failures are reported, never returned.
    pub async fn run(self) {
        let ConnectionHandler {
            connection_id,
            client,
            peer_addr,
            context,
            closed,
        } = self;

        relay(connection_id, client, peer_addr, &context).await;

        info!("[{}] connection from {} closed", connection_id, peer_addr);
        closed.fire();
    }
}

async fn relay(connection_id: Uuid, client: TcpStream, peer_addr: SocketAddr, context: &HandlerContext) {
    let client = match context.tls.accept_client(client, peer_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            context.reporter.report(&e, ErrorCategory::ConnectionHandling);
            return;
        }
    };

    let target = match context
        .tls
        .connect_target(&context.target_host, context.target_port)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            context.reporter.report(&e, category_of(&e));
            return;
        }
    };
    info!(
        "[{}] relaying {} <-> {}:{}",
        connection_id, peer_addr, context.target_host, context.target_port
    );

    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);
    let teardown = Teardown::new();

    let mut set = JoinSet::new();
    set.spawn(
        Forwarder::new(
            connection_id,
            Direction::ClientToTarget,
            client_read,
            target_write,
            teardown.clone(),
        )
        .with_sink(context.sink.clone())
        .with_reporter(Some(Arc::clone(&context.reporter)))
        .with_settings(context.drain)
        .run(),
    );
    set.spawn(
        Forwarder::new(
            connection_id,
            Direction::TargetToClient,
            target_read,
            client_write,
            teardown,
        )
        .with_sink(context.sink.clone())
        .with_reporter(Some(Arc::clone(&context.reporter)))
        .with_settings(context.drain)
        .run(),
    );

    while let Some(result) = set.join_next().await {
        match result {
            Ok(outcome) => log_outcome(connection_id, outcome),
            Err(e) => error!("[{}] forwarder task failed: {}", connection_id, e),
        }
    }
}

fn category_of(error: &NetworkError) -> ErrorCategory {
    match error {
        NetworkError::ConnectFailed { .. } => ErrorCategory::NetworkIo,
        _ => ErrorCategory::ConnectionHandling,
    }
}

fn log_outcome(connection_id: Uuid, outcome: ForwardOutcome) {
    match outcome {
        ForwardOutcome::SourceClosed | ForwardOutcome::TornDown => {
            trace!("[{}] forwarder done: {:?}", connection_id, outcome)
        }
        ForwardOutcome::ReadFailed | ForwardOutcome::WriteFailed => {
            debug!("[{}] forwarder stopped on failure: {:?}", connection_id, outcome)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingReporter;
    use super::*;
    use crate::certificates::CertificateIssuer;
    use crate::configuration::types::ProxyTuning;
    use crate::data_capture::sink::test_support::{RecordingSink, SinkEvent};
    use crate::session_management::ProxySession;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn accepted_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (server_side, peer, client)
    }

    fn context(
        port: u16,
        sink: &Arc<RecordingSink>,
        reporter: &Arc<RecordingReporter>,
    ) -> Arc<HandlerContext> {
        let sink: Arc<dyn CaptureSink> = sink.clone();
        Arc::new(
            HandlerContext::new("127.0.0.1", port, TlsContext::plain(), reporter.clone())
                .with_sink(Some(sink))
                .with_drain(DrainSettings {
                    buffer_size: 1024,
                    quiescence: Duration::from_millis(20),
                    ..DrainSettings::default()
                }),
        )
    }

    #[tokio::test]
    async fn test_relay_and_single_close_notification() {
        let _ = env_logger::builder().is_test(true).try_init();
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING");
            stream.write_all(b"PONG").await.unwrap();
            // Keep the socket open until the client hangs up.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let sink = Arc::new(RecordingSink::default());
        let reporter = Arc::new(RecordingReporter::default());
        let (accepted, peer, mut client) = accepted_pair().await;
        let id = Uuid::new_v4();
        let handler = tokio::spawn(
            ConnectionHandler::new(id, accepted, peer, context(target_port, &sink, &reporter)).run(),
        );

        client.write_all(b"PING").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG");

        drop(client);
        handler.await.unwrap();
        echo.await.unwrap();

        assert_eq!(sink.captured(Direction::ClientToTarget), vec![b"PING".to_vec()]);
        assert_eq!(sink.captured(Direction::TargetToClient), vec![b"PONG".to_vec()]);
        assert_eq!(sink.closed_count(), 1);
        assert_eq!(sink.events().last(), Some(&SinkEvent::Closed(id)));
    }

    #[tokio::test]
    async fn test_target_closing_first_closes_client() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
        });

        let sink = Arc::new(RecordingSink::default());
        let reporter = Arc::new(RecordingReporter::default());
        let (accepted, peer, mut client) = accepted_pair().await;
        let handler = tokio::spawn(
            ConnectionHandler::new(
                Uuid::new_v4(),
                accepted,
                peer,
                context(target_port, &sink, &reporter),
            )
            .run(),
        );

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_still_notifies_once() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let sink = Arc::new(RecordingSink::default());
        let reporter = Arc::new(RecordingReporter::default());
        let (accepted, peer, mut client) = accepted_pair().await;
        let id = Uuid::new_v4();

        ConnectionHandler::new(id, accepted, peer, context(dead_port, &sink, &reporter))
            .run()
            .await;

        assert_eq!(sink.events(), vec![SinkEvent::Closed(id)]);
        assert_eq!(reporter.categories(), vec![ErrorCategory::NetworkIo]);

        // The client socket was closed by the handler.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_failed_client_handshake_notifies_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let issuer = CertificateIssuer::from_embedded().unwrap();
        let session =
            ProxySession::new("127.0.0.1", 18443, "127.0.0.1", 9, true, Some("localhost".to_string()))
                .unwrap();
        let tuning = ProxyTuning {
            verify_upstream_certificates: false,
            ..ProxyTuning::default()
        };
        let tls = TlsContext::for_session(&session, &tuning, Some(&issuer)).unwrap();
        assert!(tls.intercepts_clients());

        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn CaptureSink> = sink.clone();
        let reporter = Arc::new(RecordingReporter::default());
        let context = Arc::new(
            HandlerContext::new("127.0.0.1", 9, tls, reporter.clone()).with_sink(Some(dyn_sink)),
        );

        // A plaintext client talking to a TLS-terminating proxy.
        let (accepted, peer, mut client) = accepted_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let id = Uuid::new_v4();

        tokio::time::timeout(
            Duration::from_secs(5),
            ConnectionHandler::new(id, accepted, peer, context).run(),
        )
        .await
        .unwrap();

        assert_eq!(sink.events(), vec![SinkEvent::Closed(id)]);
        assert_eq!(reporter.categories(), vec![ErrorCategory::ConnectionHandling]);
        assert_eq!(reporter.fatal_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handler_notifies_once() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Arc::new(RecordingReporter::default());
        let (accepted, peer, _client) = accepted_pair().await;
        let id = Uuid::new_v4();

        let handler = ConnectionHandler::new(id, accepted, peer, context(1, &sink, &reporter));
        assert_eq!(handler.connection_id(), id);
        drop(handler);

        assert_eq!(sink.events(), vec![SinkEvent::Closed(id)]);
    }
}
