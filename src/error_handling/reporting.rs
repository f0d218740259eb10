//! Failure reporting between the proxy engine and whoever runs it.
//!
//! The engine hands every contained failure to an [`ErrorReporter`] together with an
//! [`ErrorCategory`]. It never decides on its own to terminate the process: classification
//! into [`ErrorSeverity`] and any reaction to a fatal failure belong to the reporter.

use chrono::{DateTime, Utc};
use log::{error, warn};
use std::error::Error;
use std::fmt;
use std::io;
use tokio::sync::mpsc::UnboundedSender;

const MAX_SIMPLE_MESSAGE: usize = 200;

/// Subsystem a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Initialization,
    ProxyServer,
    ConnectionHandling,
    DataProcessing,
    NetworkIo,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Initialization => "INITIALIZATION",
            ErrorCategory::ProxyServer => "PROXY_SERVER",
            ErrorCategory::ConnectionHandling => "CONNECTION_HANDLING",
            ErrorCategory::DataProcessing => "DATA_PROCESSING",
            ErrorCategory::NetworkIo => "NETWORK_IO",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The session (or the whole process) cannot continue.
    Fatal,
    Recoverable,
}

/// Sink for failures the engine contained.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, failure: &(dyn Error + Send + Sync + 'static), category: ErrorCategory);
}

/// Fully classified failure, ready to be shown to an operator.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    category: ErrorCategory,
    severity: ErrorSeverity,
    user_message: String,
    technical_details: String,
    timestamp: DateTime<Utc>,
}

impl ErrorContext {
    /// Builds a context, rejecting blank messages.
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        user_message: impl Into<String>,
        technical_details: impl Into<String>,
    ) -> Result<Self, String> {
        let user_message = user_message.into();
        let technical_details = technical_details.into();

        if user_message.trim().is_empty() {
            return Err("user message is required".to_string());
        }
        if technical_details.trim().is_empty() {
            return Err("technical details are required".to_string());
        }

        Ok(Self {
            category,
            severity,
            user_message,
            technical_details,
            timestamp: Utc::now(),
        })
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn technical_details(&self) -> &str {
        &self.technical_details
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Turns a `(failure, category)` pair into an [`ErrorContext`].
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(failure: &(dyn Error + Send + Sync + 'static), category: ErrorCategory) -> ErrorContext {
        let severity = Self::severity(failure, category);
        let user_message = Self::user_message(failure, category);
        let technical_details = Self::technical_details(failure);

        match ErrorContext::new(category, severity, user_message, technical_details) {
            Ok(context) => context,
            Err(_) => ErrorContext {
                category,
                severity,
                user_message: format!("An unexpected {} error occurred", category),
                technical_details: "(no details)".to_string(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn severity(failure: &(dyn Error + Send + Sync + 'static), category: ErrorCategory) -> ErrorSeverity {
        match category {
            ErrorCategory::Initialization => ErrorSeverity::Fatal,
            ErrorCategory::ProxyServer => {
                if bind_failure_kind(failure).is_some() {
                    ErrorSeverity::Fatal
                } else {
                    ErrorSeverity::Recoverable
                }
            }
            ErrorCategory::ConnectionHandling
            | ErrorCategory::DataProcessing
            | ErrorCategory::NetworkIo => ErrorSeverity::Recoverable,
        }
    }

    pub fn user_message(failure: &(dyn Error + Send + Sync + 'static), category: ErrorCategory) -> String {
        match bind_failure_kind(failure) {
            Some(io::ErrorKind::AddrInUse) => {
                return "Failed to start proxy server. The port is already in use by another \
                        application. Please choose a different port or stop the other application."
                    .to_string();
            }
            Some(io::ErrorKind::PermissionDenied) => {
                return "Failed to start proxy server. Permission denied. You may need \
                        administrator privileges to bind to this port."
                    .to_string();
            }
            _ => {}
        }

        let simple = simple_message(failure);
        match category {
            ErrorCategory::Initialization => "Failed to initialize the application. Please check \
                                              the logs for details and restart."
                .to_string(),
            ErrorCategory::ProxyServer => {
                format!("An error occurred while running the proxy server: {}", simple)
            }
            ErrorCategory::ConnectionHandling => format!(
                "A connection error occurred: {}. The proxy will continue running.",
                simple
            ),
            ErrorCategory::DataProcessing => format!(
                "An error occurred while processing data: {}. Some data may not be displayed correctly.",
                simple
            ),
            ErrorCategory::NetworkIo => format!("A network error occurred: {}", simple),
        }
    }

    pub fn technical_details(failure: &(dyn Error + Send + Sync + 'static)) -> String {
        let mut details = format!("Error: {:?}\nMessage: {}", failure, failure);
        let mut cause = failure.source();
        while let Some(inner) = cause {
            details.push_str(&format!("\nCaused by: {}", inner));
            cause = inner.source();
        }
        details
    }
}

/// Kind of the socket error behind a failed bind, if this failure is one.
fn bind_failure_kind(failure: &(dyn Error + Send + Sync + 'static)) -> Option<io::ErrorKind> {
    let mut current: Option<&(dyn Error + 'static)> = Some(failure);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            match io_err.kind() {
                kind @ (io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied) => {
                    return Some(kind)
                }
                _ => {}
            }
        }
        current = err.source();
    }
    None
}

fn simple_message(failure: &(dyn Error + Send + Sync + 'static)) -> String {
    let message = failure.to_string();
    if message.trim().is_empty() {
        return "unknown error".to_string();
    }
    if message.chars().count() > MAX_SIMPLE_MESSAGE {
        let truncated: String = message.chars().take(MAX_SIMPLE_MESSAGE - 3).collect();
        return format!("{}...", truncated);
    }
    message
}

/// Default reporter: classifies and logs, optionally handing fatal failures to a channel.
#[derive(Default)]
pub struct LogReporter {
    fatal_tx: Option<UnboundedSender<ErrorContext>>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self { fatal_tx: None }
    }

    /// Fatal contexts are additionally sent on `fatal_tx`.
    pub fn with_fatal_channel(fatal_tx: UnboundedSender<ErrorContext>) -> Self {
        Self {
            fatal_tx: Some(fatal_tx),
        }
    }
}

impl ErrorReporter for LogReporter {
    fn report(&self, failure: &(dyn Error + Send + Sync + 'static), category: ErrorCategory) {
        let context = ErrorClassifier::classify(failure, category);

        match context.severity() {
            ErrorSeverity::Fatal => {
                error!("[{}] {}", category, context.user_message());
                error!("[{}] {}", category, context.technical_details());
                if let Some(tx) = &self.fatal_tx {
                    if tx.send(context).is_err() {
                        warn!("[{}] fatal failure could not be forwarded", category);
                    }
                }
            }
            ErrorSeverity::Recoverable => {
                warn!("[{}] {}", category, context.user_message());
            }
        }
    }
}
