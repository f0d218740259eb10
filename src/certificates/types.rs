use crate::error_handling::types::CertificateError;
use std::fmt;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Alias under which the issued key and chain are stored.
pub const KEY_ALIAS: &str = "server";
/// Placeholder password protecting the in-memory store.
pub const KEY_STORE_PASSWORD: &str = "changeit";

/// In-memory key store holding a single private key entry.
pub struct KeyStore {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl KeyStore {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    pub fn alias(&self) -> &'static str {
        KEY_ALIAS
    }

    pub fn password(&self) -> &'static str {
        KEY_STORE_PASSWORD
    }

    /// Looks the entry up the way a password-protected store would.
    pub fn entry(
        &self,
        alias: &str,
        password: &str,
    ) -> Option<(&[CertificateDer<'static>], &PrivateKeyDer<'static>)> {
        if alias == KEY_ALIAS && password == KEY_STORE_PASSWORD {
            Some((&self.chain, &self.key))
        } else {
            None
        }
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// TLS server context presenting the stored chain.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CertificateError> {
        let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| CertificateError::KeyStore(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| CertificateError::KeyStore(e.to_string()))?;

        Ok(Arc::new(config))
    }
}

impl Clone for KeyStore {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("alias", &KEY_ALIAS)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// A freshly issued leaf certificate with its key.
pub struct IssuedCertificate {
    pub hostname: String,
    pub certificate: CertificateDer<'static>,
    pub certificate_pem: String,
    pub private_key: PrivateKeyDer<'static>,
    pub key_store: KeyStore,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("hostname", &self.hostname)
            .field("key_store", &self.key_store)
            .finish_non_exhaustive()
    }
}
