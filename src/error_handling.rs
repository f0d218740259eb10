pub mod reporting;
pub mod types;

pub use reporting::{ErrorCategory, ErrorClassifier, ErrorContext, ErrorReporter, ErrorSeverity, LogReporter};
