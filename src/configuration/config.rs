use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Complete runtime configuration.
///
/// Read from a TOML file with a mandatory `[session]` table and an optional `[proxy]` table:
///
/// ```toml
/// [session]
/// listen_address = "127.0.0.1"
/// listen_port = 18080
/// target_host = "example.org"
/// target_port = 443
/// tls = true
/// sni_host = "example.org"
///
/// [proxy]
/// drain_quiescence_ms = 50
/// max_connections = 64
/// ```
///
/// Command-line flags parsed into [`CliArgs`] take precedence over file values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub proxy: ProxyTuning,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    /// Builds the configuration from parsed command-line arguments, loading the file they
    /// point to first when there is one.
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        args.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.listen_address.trim().is_empty()
            || session.listen_address.chars().any(char::is_whitespace)
        {
            return Err(ConfigError::BadIPFormatting(format!(
                "invalid listen address '{}'",
                session.listen_address
            )));
        }
        if session.listen_port == 0 {
            return Err(ConfigError::BadPortsRange(
                "listen_port must be between 1 and 65535".to_string(),
            ));
        }
        if session.target_host.trim().is_empty() {
            return Err(ConfigError::BadIPFormatting(
                "target_host must not be empty".to_string(),
            ));
        }
        if session.target_port == 0 {
            return Err(ConfigError::BadPortsRange(
                "target_port must be between 1 and 65535".to_string(),
            ));
        }
        if session.tls
            && session
                .sni_host
                .as_deref()
                .map_or(true, |host| host.trim().is_empty())
        {
            return Err(ConfigError::MissingSniHost);
        }

        if self.proxy.buffer_size == 0 {
            return Err(ConfigError::NotInRange(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.proxy.certificate_validity_days == 0 {
            return Err(ConfigError::NotInRange(
                "certificate_validity_days must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Command-line interface of the `tcptap` binary.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "tcptap")]
#[command(version)]
#[command(about = "Intercepting TCP/TLS proxy that captures traffic in both directions")]
pub struct CliArgs {
    /// TOML configuration file
    #[arg(short, long, env = "TCPTAP_CONFIG")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "TCPTAP_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    #[arg(long, env = "TCPTAP_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    #[arg(long, env = "TCPTAP_TARGET_HOST")]
    pub target_host: Option<String>,

    #[arg(long, env = "TCPTAP_TARGET_PORT")]
    pub target_port: Option<u16>,

    /// Connect to the target over TLS
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub tls: bool,

    /// Host name sent as SNI and used for the interception certificate
    #[arg(long, env = "TCPTAP_SNI_HOST")]
    pub sni_host: Option<String>,

    /// Accept plaintext clients and connect to the target over TLS
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub no_intercept: bool,

    /// Accept any certificate presented by the target
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub insecure_upstream: bool,

    /// Print captured packets as JSON lines on stdout
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

impl CliArgs {
    fn apply_to(&self, config: &mut Config) {
        let session = &mut config.session;

        if let Some(address) = &self.listen_address {
            session.listen_address = address.clone();
        }
        if let Some(port) = self.listen_port {
            session.listen_port = port;
        }
        if let Some(host) = &self.target_host {
            session.target_host = host.clone();
        }
        if let Some(port) = self.target_port {
            session.target_port = port;
        }
        if self.tls {
            session.tls = true;
        }
        if let Some(sni) = &self.sni_host {
            session.sni_host = Some(sni.clone());
        }
        if self.no_intercept {
            config.proxy.intercept_client_tls = false;
        }
        if self.insecure_upstream {
            config.proxy.verify_upstream_certificates = false;
        }
    }
}
