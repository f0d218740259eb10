//! Leaf certificate issuance for TLS interception.
//!
//! The CA certificate and key ship inside the binary (`resources/ca/`). Each call to
//! [`CertificateIssuer::issue`] generates a new RSA key and a leaf certificate for the requested
//! host, signed by that CA and checked against the CA public key before it is handed out.

use log::{debug, info};
use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rust_embed::RustEmbed;
use std::net::IpAddr;
use ::time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use x509_parser::prelude::*;

use super::types::{IssuedCertificate, KeyStore};
use crate::error_handling::types::CertificateError;

pub const CA_CERT_FILE: &str = "cacert.pem";
pub const CA_KEY_FILE: &str = "cakey.pem";

/// Backdating applied to `not_before` to tolerate clock skew between peers.
const NOT_BEFORE_OFFSET_SECS: i64 = 60;
const SERIAL_LEN: usize = 16;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/resources/ca/"]
struct CaMaterial;

pub struct CertificateIssuer {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
}

impl CertificateIssuer {
    /// Loads the CA shipped with the binary.
    pub fn from_embedded() -> Result<Self, CertificateError> {
        let cert_pem = embedded_text(CA_CERT_FILE)?;
        let key_pem = embedded_text(CA_KEY_FILE)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertificateError> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| CertificateError::MalformedMaterial(format!("CA key: {}", e)))?;

        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| {
                CertificateError::MalformedMaterial("no certificate in CA PEM".to_string())
            })?
            .map_err(|e| CertificateError::MalformedMaterial(format!("CA certificate: {}", e)))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CertificateError::MalformedMaterial(format!("CA certificate: {}", e)))?;

        let (_, ca) = parse_x509_certificate(&ca_cert_der)
            .map_err(|e| CertificateError::MalformedMaterial(format!("CA certificate: {}", e)))?;
        info!("Loaded interception CA '{}'", ca.subject());

        Ok(Self {
            issuer,
            ca_cert_der,
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    pub fn ca_certificate(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// PEM of the CA, for installing into client trust stores.
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issues a leaf certificate for `hostname`, valid for `validity_days` days.
    pub fn issue(
        &self,
        hostname: &str,
        validity_days: u32,
    ) -> Result<IssuedCertificate, CertificateError> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(CertificateError::Generation(
                "hostname must not be empty".to_string(),
            ));
        }
        if validity_days == 0 {
            return Err(CertificateError::Generation(
                "validity must be at least one day".to_string(),
            ));
        }

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)?;
        let params = leaf_params(hostname, validity_days)?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;

        let certificate = cert.der().clone();
        self.verify(&certificate)?;

        let private_key = PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into();
        let key_store = KeyStore::new(
            vec![certificate.clone(), self.ca_cert_der.clone()],
            PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        );

        debug!("Issued certificate for {} ({} days)", hostname, validity_days);

        Ok(IssuedCertificate {
            hostname: hostname.to_string(),
            certificate,
            certificate_pem: cert.pem(),
            private_key,
            key_store,
        })
    }

    /// Checks that `certificate` was signed by this CA.
    pub fn verify(&self, certificate: &CertificateDer<'_>) -> Result<(), CertificateError> {
        let (_, ca) = parse_x509_certificate(&self.ca_cert_der)
            .map_err(|e| CertificateError::Verification(e.to_string()))?;
        let (_, leaf) = parse_x509_certificate(certificate)
            .map_err(|e| CertificateError::Verification(e.to_string()))?;

        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|e| CertificateError::Verification(e.to_string()))
    }
}

fn embedded_text(name: &str) -> Result<String, CertificateError> {
    let file = CaMaterial::get(name)
        .ok_or_else(|| CertificateError::MissingMaterial(name.to_string()))?;
    String::from_utf8(file.data.into_owned())
        .map_err(|_| CertificateError::MalformedMaterial(format!("{} is not valid PEM text", name)))
}

fn leaf_params(hostname: &str, validity_days: u32) -> Result<CertificateParams, CertificateError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    let dns_name = hostname
        .try_into()
        .map_err(|_| CertificateError::Generation(format!("invalid host name: {}", hostname)))?;
    params.subject_alt_names = match hostname.parse::<IpAddr>() {
        Ok(ip) => vec![SanType::IpAddress(ip), SanType::DnsName(dns_name)],
        Err(_) => vec![SanType::DnsName(dns_name)],
    };

    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + Duration::days(i64::from(validity_days));

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    Ok(params)
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    rand::thread_rng().fill(&mut bytes);
    // positive, without a leading zero octet
    bytes[0] = (bytes[0] & 0x7F) | 0x01;
    SerialNumber::from(bytes.to_vec())
}
