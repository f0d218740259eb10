use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::registry::{ConnectionRegistry, RegistryEvent};
use super::session::ProxySession;
use super::session_manager::SessionManager;
use crate::data_capture::render::DataProcessor;
use crate::data_capture::sink::{contained, CaptureSink, ConnectionAcceptor};
use crate::data_capture::types::{ConnectionInfo, Direction};
use crate::error_handling::types::SessionError;
use crate::error_handling::{ErrorCategory, ErrorReporter};
use crate::network::types::ClientConnection;
use crate::network::{PoolShutdown, ServerState};

/// Turns engine callbacks into registry updates.
pub struct CaptureRecorder {
    registry: Arc<ConnectionRegistry>,
    processor: DataProcessor,
    reporter: Arc<dyn ErrorReporter>,
}

impl CaptureRecorder {
    pub fn new(registry: Arc<ConnectionRegistry>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            registry,
            processor: DataProcessor::new(),
            reporter,
        }
    }
}

impl ConnectionAcceptor for CaptureRecorder {
    fn on_connection_accepted(
        &self,
        connection_id: Uuid,
        client: &ClientConnection,
    ) -> Result<(), SessionError> {
        self.registry.register_connection(connection_id, client);
        debug!("Connection accepted and registered: {}", connection_id);
        Ok(())
    }
}

impl CaptureSink for CaptureRecorder {
    fn on_data_captured(&self, connection_id: Uuid, data: &[u8], direction: Direction) {
        if !self.registry.contains(connection_id) {
            warn!("Received data for unregistered connection: {}", connection_id);
            return;
        }

        let Some(packet) = contained("data processing", connection_id, || {
            self.processor.process(data, direction)
        }) else {
            let failure = SessionError::CallbackFailed(format!(
                "unable to process {} bytes captured on {}",
                data.len(),
                connection_id
            ));
            self.reporter.report(&failure, ErrorCategory::DataProcessing);
            return;
        };

        self.registry.add_packet(connection_id, packet);
        trace!(
            "Data captured for connection {}: {} bytes, direction: {}",
            connection_id,
            data.len(),
            direction
        );
    }

    fn on_connection_closed(&self, connection_id: Uuid) {
        self.registry.close_connection(connection_id);
    }
}

/// Entry point for running proxy sessions and reading what they captured.
pub struct ProxyService {
    manager: SessionManager,
    registry: Arc<ConnectionRegistry>,
    recorder: Arc<CaptureRecorder>,
    current: Mutex<Option<Arc<ProxySession>>>,
}

impl ProxyService {
    pub fn new(manager: SessionManager, reporter: Arc<dyn ErrorReporter>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let recorder = Arc::new(CaptureRecorder::new(Arc::clone(&registry), reporter));
        Self {
            manager,
            registry,
            recorder,
            current: Mutex::new(None),
        }
    }

    /// Starts `session`, clearing the connections of any previous one.
    pub fn start_proxy_session(&self, session: ProxySession) -> Result<Arc<ProxySession>, SessionError> {
        let mut current = self.current();
        let serving = self
            .manager
            .server_state()
            .is_some_and(|state| state != ServerState::Stopped);
        if serving && current.as_ref().is_some_and(|s| s.is_active()) {
            return Err(SessionError::AlreadyActive);
        }

        self.registry.clear();

        let session = Arc::new(session);
        let sink: Arc<dyn CaptureSink> = self.recorder.clone();
        let acceptor: Arc<dyn ConnectionAcceptor> = self.recorder.clone();
        self.manager
            .start_server(Arc::clone(&session), Some(sink), Some(acceptor))?;

        *current = Some(Arc::clone(&session));
        info!("Proxy session started: {}", session.display_info());
        Ok(session)
    }

    /// Stops the current session. Captured connections stay available until the next start.
    pub async fn stop_proxy_session(&self) -> Option<PoolShutdown> {
        let session = self.current().clone()?;
        let outcome = self.manager.stop_server().await;
        session.set_active(false);
        info!("Proxy session stopped");
        outcome
    }

    pub fn is_session_active(&self) -> bool {
        self.current().as_ref().is_some_and(|s| s.is_active()) && self.manager.is_running()
    }

    pub fn current_session(&self) -> Option<Arc<ProxySession>> {
        self.current().clone()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    pub fn connection_data(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        self.registry.get(connection_id)
    }

    pub fn active_connection_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<ProxySession>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
