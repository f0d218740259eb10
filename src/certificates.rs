pub mod issuer;
pub mod types;

pub use issuer::CertificateIssuer;
pub use types::{IssuedCertificate, KeyStore};
