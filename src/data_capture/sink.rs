//! Callbacks the engine invokes while relaying traffic.

use crate::error_handling::types::SessionError;
use crate::network::types::ClientConnection;
use log::{error, trace};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

use super::types::Direction;

/// Receives consolidated capture events and connection teardown.
///
/// Implementations are called from forwarder tasks and must not block for long.
pub trait CaptureSink: Send + Sync {
    fn on_data_captured(&self, connection_id: Uuid, data: &[u8], direction: Direction);

    fn on_connection_closed(&self, connection_id: Uuid);
}

/// Told about every accepted client before its handler is scheduled.
///
/// Returning an error drops the connection without relaying anything.
pub trait ConnectionAcceptor: Send + Sync {
    fn on_connection_accepted(
        &self,
        connection_id: Uuid,
        client: &ClientConnection,
    ) -> Result<(), SessionError>;
}

/// Runs a collaborator callback, turning a panic into a logged `None`.
pub(crate) fn contained<R>(what: &str, connection_id: Uuid, callback: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(
                "[{}] {} callback panicked: {}",
                connection_id,
                what,
                panic_message(payload.as_ref())
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Fires `on_connection_closed` exactly once: explicitly through [`ClosedNotice::fire`],
/// or on drop if the owner never got that far.
pub(crate) struct ClosedNotice {
    connection_id: Uuid,
    sink: Option<Arc<dyn CaptureSink>>,
}

impl ClosedNotice {
    pub(crate) fn new(connection_id: Uuid, sink: Option<Arc<dyn CaptureSink>>) -> Self {
        Self {
            connection_id,
            sink,
        }
    }

    pub(crate) fn fire(mut self) {
        self.notify();
    }

    fn notify(&mut self) {
        if let Some(sink) = self.sink.take() {
            trace!("[{}] notifying connection closed", self.connection_id);
            let id = self.connection_id;
            contained("connection closed", id, || sink.on_connection_closed(id));
        }
    }
}

impl Drop for ClosedNotice {
    fn drop(&mut self) {
        self.notify();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum SinkEvent {
        Data(Uuid, Direction, Vec<u8>),
        Closed(Uuid),
    }

    /// Sink that remembers everything it was told.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<SinkEvent>>,
        closed: Notify,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn captured(&self, direction: Direction) -> Vec<Vec<u8>> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SinkEvent::Data(_, d, bytes) if d == direction => Some(bytes),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn closed_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, SinkEvent::Closed(_)))
                .count()
        }

        pub(crate) async fn wait_closed(&self) {
            loop {
                let notified = self.closed.notified();
                if self.closed_count() > 0 {
                    return;
                }
                notified.await;
            }
        }
    }

    impl CaptureSink for RecordingSink {
        fn on_data_captured(&self, connection_id: Uuid, data: &[u8], direction: Direction) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Data(connection_id, direction, data.to_vec()));
        }

        fn on_connection_closed(&self, connection_id: Uuid) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Closed(connection_id));
            self.closed.notify_waiters();
        }
    }
}
