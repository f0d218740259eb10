//! Session management core module.
//!
//! A session is one run of the proxy: a [`ProxySession`] describes it, the
//! [`SessionManager`] runs its server and worker pool, and the [`ConnectionRegistry`] keeps
//! every connection it accepted together with the captured traffic. [`ProxyService`] ties the
//! three together for front-ends.

/// Facade used by front-ends, plus the capture recorder feeding the registry.
pub mod proxy_service;
/// Thread-safe store of connections and their captured packets.
pub mod registry;
/// Session configuration.
pub mod session;
/// Lifecycle of the proxy server of the current session.
pub mod session_manager;

pub use proxy_service::{CaptureRecorder, ProxyService};
pub use registry::{ConnectionRegistry, RegistryEvent};
pub use session::ProxySession;
pub use session_manager::{SessionManager, ShutdownPolicy};
