use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(String),
    BadIPFormatting(String),
    BadPortsRange(String),
    MissingSniHost,
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::BadPortsRange(e) => write!(f, "Port range error: {}", e),
            ConfigError::MissingSniHost => {
                write!(f, "An SNI host name is required when TLS is enabled")
            }
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug)]
pub enum NetworkError {
    /// The listening socket could not be created or bound.
    BindError(io::Error),
    AcceptError(io::Error),
    AddressResolution(String),
    ConnectFailed { target: String, source: io::Error },
    TlsHandshake { peer: String, source: io::Error },
    InvalidServerName(String),
    TlsConfig(String),
}

impl NetworkError {
    /// Underlying socket error, when there is one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            NetworkError::BindError(e) | NetworkError::AcceptError(e) => Some(e),
            NetworkError::ConnectFailed { source, .. }
            | NetworkError::TlsHandshake { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::BindError(e) => write!(f, "Network bind error: {}", e),
            NetworkError::AcceptError(e) => write!(f, "Accept failed: {}", e),
            NetworkError::AddressResolution(e) => write!(f, "Unable to resolve address: {}", e),
            NetworkError::ConnectFailed { target, source } => {
                write!(f, "Connection to {} failed: {}", target, source)
            }
            NetworkError::TlsHandshake { peer, source } => {
                write!(f, "TLS handshake with {} failed: {}", peer, source)
            }
            NetworkError::InvalidServerName(e) => write!(f, "Invalid TLS server name: {}", e),
            NetworkError::TlsConfig(e) => write!(f, "TLS configuration error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.io_error() {
            Some(e) => Some(e),
            None => None,
        }
    }
}

#[derive(Debug)]
pub enum CertificateError {
    MissingMaterial(String),
    MalformedMaterial(String),
    Generation(String),
    Verification(String),
    KeyStore(String),
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateError::MissingMaterial(e) => write!(f, "CA material not found: {}", e),
            CertificateError::MalformedMaterial(e) => write!(f, "Malformed CA material: {}", e),
            CertificateError::Generation(e) => write!(f, "Certificate generation failed: {}", e),
            CertificateError::Verification(e) => {
                write!(f, "Certificate verification failed: {}", e)
            }
            CertificateError::KeyStore(e) => write!(f, "Key store error: {}", e),
        }
    }
}

impl std::error::Error for CertificateError {}

impl From<rcgen::Error> for CertificateError {
    fn from(err: rcgen::Error) -> Self {
        CertificateError::Generation(err.to_string())
    }
}

#[derive(Debug)]
pub enum SessionError {
    AlreadyActive,
    AlreadyRunning,
    InvalidSession(ConfigError),
    NetworkError(NetworkError),
    CertificateError(CertificateError),
    CallbackFailed(String),
    PoolClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyActive => write!(f, "A proxy session is already active"),
            SessionError::AlreadyRunning => write!(f, "A proxy server is already running"),
            SessionError::InvalidSession(e) => write!(f, "Invalid session: {}", e),
            SessionError::NetworkError(e) => write!(f, "Network error: {}", e),
            SessionError::CertificateError(e) => write!(f, "Certificate error: {}", e),
            SessionError::CallbackFailed(e) => write!(f, "Callback failed: {}", e),
            SessionError::PoolClosed => write!(f, "Worker pool no longer accepts tasks"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        SessionError::InvalidSession(err)
    }
}

impl From<NetworkError> for SessionError {
    fn from(err: NetworkError) -> Self {
        SessionError::NetworkError(err)
    }
}

impl From<CertificateError> for SessionError {
    fn from(err: CertificateError) -> Self {
        SessionError::CertificateError(err)
    }
}
