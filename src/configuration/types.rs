use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_DRAIN_QUIESCENCE_MS: u64 = 50;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;
pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
pub const DEFAULT_FORCED_SHUTDOWN_SECS: u64 = 5;
pub const DEFAULT_CERTIFICATE_VALIDITY_DAYS: u32 = 30;

/// Where to listen and where to relay to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni_host: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: 0,
            target_host: String::new(),
            target_port: 0,
            tls: false,
            sni_host: None,
        }
    }
}

/// Engine tuning knobs; every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyTuning {
    pub buffer_size: usize,
    pub drain_quiescence_ms: u64,
    /// A burst longer than this is captured in several packets.
    pub max_packet_size: usize,
    pub graceful_shutdown_secs: u64,
    pub forced_shutdown_secs: u64,
    /// 0 means no limit on concurrently running connection handlers.
    pub max_connections: usize,
    pub certificate_validity_days: u32,
    pub intercept_client_tls: bool,
    pub verify_upstream_certificates: bool,
}

impl Default for ProxyTuning {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_quiescence_ms: DEFAULT_DRAIN_QUIESCENCE_MS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            graceful_shutdown_secs: DEFAULT_GRACEFUL_SHUTDOWN_SECS,
            forced_shutdown_secs: DEFAULT_FORCED_SHUTDOWN_SECS,
            max_connections: 0,
            certificate_validity_days: DEFAULT_CERTIFICATE_VALIDITY_DAYS,
            intercept_client_tls: true,
            verify_upstream_certificates: true,
        }
    }
}

impl ProxyTuning {
    pub fn drain_quiescence(&self) -> Duration {
        Duration::from_millis(self.drain_quiescence_ms)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    pub fn forced_shutdown(&self) -> Duration {
        Duration::from_secs(self.forced_shutdown_secs)
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}
