//! One-directional byte pump with burst consolidation.
//!
//! Every chunk read from the source is written to the destination right away. Captured bytes
//! however are held back until the source has been quiet for the drain quiescence interval, so
//! a message the sender wrote in several pieces is reported as a single capture event:
//!
//! ```text
//!  read ──▶ write+flush ──▶ accumulate ──▶ more within quiescence? ──yes──┐
//!   ▲                                              │ no                     │
//!   │                                              ▼                        │
//!   └──────────────────────────── emit one capture event ◀─────────────────┘
//! ```
//!
//! End of stream, read or write failures, and teardown of the opposite direction all flush
//! whatever is still accumulated before the forwarder shuts its destination down and exits.

use crate::configuration::types::{
    ProxyTuning, DEFAULT_BUFFER_SIZE, DEFAULT_DRAIN_QUIESCENCE_MS, DEFAULT_MAX_PACKET_SIZE,
};
use crate::error_handling::{ErrorCategory, ErrorReporter};
use log::{debug, trace};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use super::sink::{contained, CaptureSink};
use super::types::Direction;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const PREVIEW_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    pub buffer_size: usize,
    /// Silence on the source after which a burst counts as complete.
    pub quiescence: Duration,
    /// Accumulated bytes at which a burst is captured even though the source is still busy.
    pub max_packet: usize,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            quiescence: Duration::from_millis(DEFAULT_DRAIN_QUIESCENCE_MS),
            max_packet: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl From<&ProxyTuning> for DrainSettings {
    fn from(tuning: &ProxyTuning) -> Self {
        Self {
            buffer_size: tuning.buffer_size.max(1),
            quiescence: tuning.drain_quiescence(),
            max_packet: tuning.max_packet_size.max(1),
        }
    }
}

/// Why a forwarder stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    SourceClosed,
    ReadFailed,
    WriteFailed,
    /// The opposite direction of the same connection went away.
    TornDown,
}

/// Shared stop signal for the two forwarders of one connection.
#[derive(Debug, Clone)]
pub struct Teardown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Teardown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn signalled(&mut self) {
        let _ = self.rx.wait_for(|down| *down).await;
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

enum Step {
    Data(usize),
    Idle,
    Eof,
    Failed(io::Error),
    TornDown,
}

pub struct Forwarder<R, W> {
    connection_id: Uuid,
    direction: Direction,
    source: R,
    destination: W,
    sink: Option<Arc<dyn CaptureSink>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    settings: DrainSettings,
    teardown: Teardown,
}

impl<R, W> Forwarder<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        connection_id: Uuid,
        direction: Direction,
        source: R,
        destination: W,
        teardown: Teardown,
    ) -> Self {
        Self {
            connection_id,
            direction,
            source,
            destination,
            sink: None,
            reporter: None,
            settings: DrainSettings::default(),
            teardown,
        }
    }

    pub fn with_sink(mut self, sink: Option<Arc<dyn CaptureSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_reporter(mut self, reporter: Option<Arc<dyn ErrorReporter>>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_settings(mut self, settings: DrainSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Pumps until the source ends, an I/O error occurs or the connection is torn down.
    ///
    /// Never fails: whatever stopped the pump is returned as a [`ForwardOutcome`]. Both streams
    /// are shut down and dropped before this returns, and the teardown signal is raised.
    pub async fn run(mut self) -> ForwardOutcome {
        let mut buf = vec![0u8; self.settings.buffer_size.max(1)];
        let mut pending: Vec<u8> = Vec::new();

        trace!("[{}] {} forwarder started", self.connection_id, self.direction.arrow());

        let outcome = 'relay: loop {
            match self.next_chunk(&mut buf, None).await {
                Step::Data(n) => {
                    if let Err(e) = self.forward(&buf[..n], &mut pending).await {
                        break 'relay self.write_failed(&e);
                    }
                }
                Step::Idle => continue,
                Step::Eof => break 'relay ForwardOutcome::SourceClosed,
                Step::Failed(e) => {
                    self.report_failure("read", &e);
                    break 'relay ForwardOutcome::ReadFailed;
                }
                Step::TornDown => break 'relay ForwardOutcome::TornDown,
            }

            // Drain whatever keeps arriving until the source goes quiet or the packet is full.
            while pending.len() < self.settings.max_packet {
                match self.next_chunk(&mut buf, Some(self.settings.quiescence)).await {
                    Step::Data(n) => {
                        if let Err(e) = self.forward(&buf[..n], &mut pending).await {
                            break 'relay self.write_failed(&e);
                        }
                    }
                    Step::Idle => break,
                    Step::Eof => break 'relay ForwardOutcome::SourceClosed,
                    Step::Failed(e) => {
                        self.report_failure("read", &e);
                        break 'relay ForwardOutcome::ReadFailed;
                    }
                    Step::TornDown => break 'relay ForwardOutcome::TornDown,
                }
            }

            self.emit(&mut pending);
        };

        self.emit(&mut pending);
        debug!(
            "[{}] {} forwarder finished: {:?}",
            self.connection_id,
            self.direction.arrow(),
            outcome
        );
        self.close().await;

        outcome
    }

    async fn next_chunk(&mut self, buf: &mut [u8], wait: Option<Duration>) -> Step {
        let source = &mut self.source;
        let teardown = &mut self.teardown;

        let read = async {
            tokio::select! {
                biased;
                _ = teardown.signalled() => Step::TornDown,
                result = source.read(buf) => match result {
                    Ok(0) => Step::Eof,
                    Ok(n) => Step::Data(n),
                    Err(e) => Step::Failed(e),
                },
            }
        };

        match wait {
            None => read.await,
            Some(limit) => timeout(limit, read).await.unwrap_or(Step::Idle),
        }
    }

    async fn forward(&mut self, chunk: &[u8], pending: &mut Vec<u8>) -> io::Result<()> {
        let destination = &mut self.destination;
        let teardown = &mut self.teardown;

        tokio::select! {
            biased;
            _ = teardown.signalled() => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection torn down during write",
                ));
            }
            result = async {
                destination.write_all(chunk).await?;
                destination.flush().await
            } => result?,
        }

        pending.extend_from_slice(chunk);
        Ok(())
    }

    fn emit(&self, pending: &mut Vec<u8>) {
        if pending.is_empty() {
            return;
        }

        let packet = std::mem::take(pending);
        let preview = &packet[..packet.len().min(PREVIEW_LEN)];
        trace!(
            "[{}] captured {} {} bytes: {}{}",
            self.connection_id,
            self.direction.arrow(),
            packet.len(),
            String::from_utf8_lossy(preview),
            if packet.len() > PREVIEW_LEN { " ..." } else { "" }
        );

        if let Some(sink) = &self.sink {
            let id = self.connection_id;
            contained("data captured", id, || {
                sink.on_data_captured(id, &packet, self.direction)
            });
        }
    }

    fn write_failed(&self, error: &io::Error) -> ForwardOutcome {
        if self.teardown.is_signalled() {
            return ForwardOutcome::TornDown;
        }
        self.report_failure("write", error);
        ForwardOutcome::WriteFailed
    }

    fn report_failure(&self, operation: &str, error: &io::Error) {
        debug!(
            "[{}] {} {} failed: {}",
            self.connection_id,
            self.direction.arrow(),
            operation,
            error
        );
        if let Some(reporter) = &self.reporter {
            reporter.report(error, ErrorCategory::NetworkIo);
        }
    }

    async fn close(mut self) {
        self.teardown.signal();

        match timeout(CLOSE_TIMEOUT, self.destination.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("[{}] shutdown of destination failed: {}", self.connection_id, e),
            Err(_) => trace!("[{}] shutdown of destination timed out", self.connection_id),
        }
    }
}
