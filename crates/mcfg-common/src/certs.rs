//! Inspection of PEM certificate bundles
//!
//! The kubelet CA bundle rotates by appending a new signer. When that change
//! is spliced through a paused pool, the newest certificate in the bundle is
//! reported so operators can see which rotation is pending.

use thiserror::Error;
use x509_parser::prelude::*;

/// Errors from bundle parsing
#[derive(Debug, Error)]
pub enum CertError {
    /// The data is not valid PEM
    #[error("invalid PEM data: {0}")]
    Pem(String),
    /// A PEM block did not contain a parseable X.509 certificate
    #[error("invalid certificate: {0}")]
    Certificate(String),
}

/// Validity window and subject of one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    /// Subject distinguished name
    pub subject: String,
    /// Start of validity (Unix seconds)
    pub not_before: i64,
    /// End of validity (Unix seconds)
    pub not_after: i64,
}

impl CertificateSummary {
    /// `not_after` as an RFC 3339 timestamp
    pub fn expiry_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp(self.not_after, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| self.not_after.to_string())
    }
}

/// Parse every `CERTIFICATE` block of a PEM bundle.
///
/// Blocks with other tags are skipped.
pub fn parse_bundle(pem_data: &[u8]) -> Result<Vec<CertificateSummary>, CertError> {
    let blocks = ::pem::parse_many(pem_data).map_err(|e| CertError::Pem(e.to_string()))?;

    blocks
        .iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| summarize(block.contents()))
        .collect()
}

fn summarize(der: &[u8]) -> Result<CertificateSummary, CertError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| CertError::Certificate(e.to_string()))?;
    Ok(CertificateSummary {
        subject: cert.subject().to_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

/// The certificate in the bundle that became valid most recently.
///
/// Returns `Ok(None)` for a bundle without certificates.
pub fn newest_certificate(pem_data: &[u8]) -> Result<Option<CertificateSummary>, CertError> {
    Ok(parse_bundle(pem_data)?
        .into_iter()
        .max_by_key(|c| c.not_before))
}
