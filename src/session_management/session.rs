use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::configuration::types::SessionConfig;
use crate::error_handling::types::ConfigError;

/// Configuration of one proxy run: where to listen and where to relay to.
///
/// Everything but the `active` flag is fixed at construction.
#[derive(Debug)]
pub struct ProxySession {
    local_address: String,
    local_port: u16,
    target_host: String,
    target_port: u16,
    tls: bool,
    sni_host: Option<String>,
    created_at: DateTime<Utc>,
    active: AtomicBool,
}

impl ProxySession {
    /// Ports must be non-zero, and an SNI host is required exactly when TLS is enabled.
    pub fn new(
        local_address: impl Into<String>,
        local_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
        tls: bool,
        sni_host: Option<String>,
    ) -> Result<Self, ConfigError> {
        let local_address = local_address.into();
        let target_host = target_host.into();

        if local_address.trim().is_empty() {
            return Err(ConfigError::BadIPFormatting(
                "local address must not be empty".to_string(),
            ));
        }
        if target_host.trim().is_empty() {
            return Err(ConfigError::BadIPFormatting(
                "target host must not be empty".to_string(),
            ));
        }
        if local_port == 0 || target_port == 0 {
            return Err(ConfigError::BadPortsRange(format!(
                "ports must be between 1 and 65535 (got {} and {})",
                local_port, target_port
            )));
        }

        let sni_host = sni_host.filter(|host| !host.trim().is_empty());
        match (tls, &sni_host) {
            (true, None) => return Err(ConfigError::MissingSniHost),
            (false, Some(host)) => {
                return Err(ConfigError::NotInRange(format!(
                    "SNI host '{}' given for a session without TLS",
                    host
                )))
            }
            _ => {}
        }

        Ok(Self {
            local_address,
            local_port,
            target_host,
            target_port,
            tls,
            sni_host,
            created_at: Utc::now(),
            active: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
        let sni_host = if config.tls {
            config.sni_host.clone()
        } else {
            None
        };

        Self::new(
            config.listen_address.clone(),
            config.listen_port,
            config.target_host.clone(),
            config.target_port,
            config.tls,
            sni_host,
        )
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls
    }

    pub fn sni_host(&self) -> Option<&str> {
        self.sni_host.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// `local:port → target:port`, with a TLS marker when relevant.
    pub fn display_info(&self) -> String {
        let mut info = format!(
            "{}:{} → {}:{}",
            self.local_address, self.local_port, self.target_host, self.target_port
        );
        if let Some(sni) = &self.sni_host {
            info.push_str(&format!(" (TLS, SNI {})", sni));
        }
        info
    }
}

impl fmt::Display for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProxySession[{} - {}]",
            self.display_info(),
            if self.is_active() { "ACTIVE" } else { "STOPPED" }
        )
    }
}
