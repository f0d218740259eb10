use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::types::BoxedStream;
use crate::certificates::CertificateIssuer;
use crate::configuration::types::ProxyTuning;
use crate::error_handling::types::{CertificateError, ConfigError, NetworkError, SessionError};
use crate::session_management::session::ProxySession;

#[derive(Clone)]
struct Upstream {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// TLS material of one session: how to terminate clients and how to reach the target.
#[derive(Clone, Default)]
pub struct TlsContext {
    acceptor: Option<TlsAcceptor>,
    upstream: Option<Upstream>,
}

impl TlsContext {
    /// Plain TCP on both sides.
    pub fn plain() -> Self {
        Self::default()
    }

    /// Builds the context a session needs.
    ///
    /// For TLS sessions the target is reached with SNI set to the session's SNI host. Unless
    /// interception is disabled, a leaf certificate for that host is issued once here and
    /// presented to every client of the session.
    pub fn for_session(
        session: &ProxySession,
        tuning: &ProxyTuning,
        issuer: Option<&CertificateIssuer>,
    ) -> Result<Self, SessionError> {
        if !session.tls_enabled() {
            return Ok(Self::plain());
        }

        let sni_host = session
            .sni_host()
            .ok_or(SessionError::InvalidSession(ConfigError::MissingSniHost))?;

        let server_name = ServerName::try_from(sni_host.to_string())
            .map_err(|_| NetworkError::InvalidServerName(sni_host.to_string()))?;
        let client_config = client_config(tuning.verify_upstream_certificates)?;
        let upstream = Upstream {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        };

        let acceptor = if tuning.intercept_client_tls {
            let issuer = issuer.ok_or_else(|| {
                CertificateError::MissingMaterial("no certificate issuer available".to_string())
            })?;
            let issued = issuer.issue(sni_host, tuning.certificate_validity_days)?;
            info!("Intercepting client TLS as '{}'", sni_host);
            Some(TlsAcceptor::from(issued.key_store.server_config()?))
        } else {
            None
        };

        Ok(Self {
            acceptor,
            upstream: Some(upstream),
        })
    }

    pub fn intercepts_clients(&self) -> bool {
        self.acceptor.is_some()
    }

    pub fn upstream_tls(&self) -> bool {
        self.upstream.is_some()
    }

    /// Terminates the client's TLS session when interception is on; passes the socket
    /// through otherwise.
    pub async fn accept_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<BoxedStream, NetworkError> {
        match &self.acceptor {
            None => Ok(Box::new(stream)),
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|source| NetworkError::TlsHandshake {
                        peer: peer.to_string(),
                        source,
                    })?;
                debug!("TLS session with client {} established", peer);
                Ok(Box::new(tls))
            }
        }
    }

    /// Opens the target connection, completing the TLS handshake first when required.
    pub async fn connect_target(&self, host: &str, port: u16) -> Result<BoxedStream, NetworkError> {
        let target = format!("{}:{}", host, port);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| NetworkError::ConnectFailed {
                target: target.clone(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Unable to disable Nagle on {}: {}", target, e);
        }

        match &self.upstream {
            None => Ok(Box::new(stream)),
            Some(upstream) => {
                let tls = upstream
                    .connector
                    .connect(upstream.server_name.clone(), stream)
                    .await
                    .map_err(|source| NetworkError::TlsHandshake {
                        peer: target.clone(),
                        source,
                    })?;
                debug!("TLS session with target {} established", target);
                Ok(Box::new(tls))
            }
        }
    }
}

/// Client configuration for target connections.
///
/// Verifies against the Mozilla root store, or accepts any certificate when `verify` is false.
pub fn client_config(verify: bool) -> Result<ClientConfig, NetworkError> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetworkError::TlsConfig(e.to_string()))?;

    let config = if verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        warn!("Upstream certificate verification is DISABLED");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    };

    Ok(config)
}

/// Skips chain and name validation but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        debug!(
            "Accepting unverified certificate for {:?} ({} bytes, {} intermediates)",
            server_name,
            end_entity.len(),
            intermediates.len()
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tls_session(sni: &str) -> ProxySession {
        ProxySession::new("127.0.0.1", 18443, "127.0.0.1", 443, true, Some(sni.to_string())).unwrap()
    }

    #[test]
    fn test_plain_session_has_no_tls() {
        let session = ProxySession::new("127.0.0.1", 18080, "example.org", 80, false, None).unwrap();
        let context = TlsContext::for_session(&session, &ProxyTuning::default(), None).unwrap();

        assert!(!context.intercepts_clients());
        assert!(!context.upstream_tls());
    }

    #[test]
    fn test_interception_requires_issuer() {
        let result = TlsContext::for_session(&tls_session("localhost"), &ProxyTuning::default(), None);
        assert!(matches!(result, Err(SessionError::CertificateError(_))));

        let tuning = ProxyTuning {
            intercept_client_tls: false,
            ..ProxyTuning::default()
        };
        let context = TlsContext::for_session(&tls_session("localhost"), &tuning, None).unwrap();
        assert!(!context.intercepts_clients());
        assert!(context.upstream_tls());
    }

    #[test]
    fn test_client_configs_build() {
        assert!(client_config(true).is_ok());
        assert!(client_config(false).is_ok());
    }

    #[tokio::test]
    async fn test_intercepted_handshake_with_sni() {
        let _ = env_logger::builder().is_test(true).try_init();
        let issuer = CertificateIssuer::from_embedded().unwrap();

        // The proxy side terminates TLS with the issued certificate.
        let server_context = TlsContext::for_session(
            &tls_session("localhost"),
            &ProxyTuning {
                verify_upstream_certificates: false,
                ..ProxyTuning::default()
            },
            Some(&issuer),
        )
        .unwrap();
        assert!(server_context.intercepts_clients());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut tls = server_context.accept_client(stream, peer).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(b"PONG").await.unwrap();
            tls.flush().await.unwrap();
            buf
        });

        // A client that only trusts the interception CA must accept the proxy.
        let mut roots = RootCertStore::empty();
        roots.add(issuer.ca_certificate().clone()).unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut client = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();

        client.write_all(b"PING").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();

        assert_eq!(&reply, b"PONG");
        assert_eq!(&server.await.unwrap(), b"PING");
    }

    #[tokio::test]
    async fn test_connect_target_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TlsContext::plain().connect_target("127.0.0.1", port).await;
        assert!(matches!(result, Err(NetworkError::ConnectFailed { .. })));
    }
}
