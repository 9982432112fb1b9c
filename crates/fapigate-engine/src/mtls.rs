//! Transport certificate checks against a participant directory.
//!
//! TLS terminates ahead of the gateway; what arrives here is the forwarded
//! certificate metadata. The gate checks presence, validity window, the
//! configured deny-list, and directory status. Unknown is not trusted: a
//! certificate the directory cannot vouch for is rejected, and a directory
//! outage rejects rather than admits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use fapigate_core::store::StoreError;
use fapigate_core::GatewayError;

use crate::config::MtlsConfig;

/// Client certificate metadata forwarded by the TLS terminator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertificate {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Lowercase hex SHA-256 over the DER certificate
    pub fingerprint_sha256: String,
    /// Validity window start
    pub not_before: DateTime<Utc>,
    /// Validity window end
    pub not_after: DateTime<Utc>,
}

impl ClientCertificate {
    /// Fingerprint a DER-encoded certificate the way the directory keys it
    pub fn fingerprint_of(der: &[u8]) -> String {
        hex::encode(Sha256::digest(der))
    }

    /// Whether the validity window covers the given instant
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at < self.not_after
    }
}

/// Directory verdict for a certificate fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    /// Enrolled and in good standing
    Trusted,
    /// Explicitly revoked
    Revoked,
    /// Not present in the directory
    Unknown,
}

/// Lookup into the participant certificate directory
#[async_trait]
pub trait CertificateDirectory: Send + Sync + std::fmt::Debug {
    /// Resolve the status of a certificate fingerprint
    async fn status(&self, fingerprint: &str) -> Result<CertificateStatus, StoreError>;
}

/// In-memory certificate directory for tests and development
#[derive(Debug, Default)]
pub struct MemoryCertificateDirectory {
    entries: DashMap<String, CertificateStatus>,
}

impl MemoryCertificateDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a fingerprint as trusted
    pub fn trust(&self, fingerprint: impl Into<String>) {
        self.entries
            .insert(fingerprint.into(), CertificateStatus::Trusted);
    }

    /// Mark a fingerprint as revoked
    pub fn revoke(&self, fingerprint: impl Into<String>) {
        self.entries
            .insert(fingerprint.into(), CertificateStatus::Revoked);
    }
}

#[async_trait]
impl CertificateDirectory for MemoryCertificateDirectory {
    async fn status(&self, fingerprint: &str) -> Result<CertificateStatus, StoreError> {
        Ok(self
            .entries
            .get(fingerprint)
            .map(|e| *e.value())
            .unwrap_or(CertificateStatus::Unknown))
    }
}

/// Applies the transport certificate policy for the gate
#[derive(Debug)]
pub struct CertificateVerifier {
    config: MtlsConfig,
    directory: Arc<dyn CertificateDirectory>,
}

impl CertificateVerifier {
    /// Build a verifier over the participant directory
    pub fn new(config: MtlsConfig, directory: Arc<dyn CertificateDirectory>) -> Self {
        Self { config, directory }
    }

    /// Check the forwarded certificate against policy and directory
    pub async fn check(
        &self,
        certificate: Option<&ClientCertificate>,
    ) -> Result<(), GatewayError> {
        let cert = match certificate {
            Some(cert) => cert,
            None if self.config.require_certificate => {
                return Err(GatewayError::unauthorized(
                    "certificate_required",
                    "request arrived without a client certificate",
                ));
            }
            None => return Ok(()),
        };

        // Deny-list wins over anything the directory says
        if self
            .config
            .denied_fingerprints
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&cert.fingerprint_sha256))
        {
            tracing::warn!(
                fingerprint = %cert.fingerprint_sha256,
                subject = %cert.subject,
                "denied certificate presented"
            );
            return Err(GatewayError::forbidden(
                "certificate_denied",
                "certificate is on the deny list",
            ));
        }

        if !cert.is_valid_at(Utc::now()) {
            return Err(GatewayError::unauthorized(
                "certificate_expired",
                "certificate validity window does not cover the request time",
            ));
        }

        let status = self
            .directory
            .status(&cert.fingerprint_sha256)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "certificate directory unreachable");
                GatewayError::dependency_unavailable(format!("certificate directory: {e}"))
            })?;

        match status {
            CertificateStatus::Trusted => Ok(()),
            CertificateStatus::Revoked => {
                tracing::warn!(
                    fingerprint = %cert.fingerprint_sha256,
                    subject = %cert.subject,
                    "revoked certificate presented"
                );
                Err(GatewayError::forbidden(
                    "certificate_revoked",
                    "certificate has been revoked",
                ))
            }
            CertificateStatus::Unknown => Err(GatewayError::unauthorized(
                "certificate_unknown",
                "certificate is not enrolled in the participant directory",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn cert(fingerprint: &str) -> ClientCertificate {
        ClientCertificate {
            subject: "CN=tpp-001".to_string(),
            issuer: "CN=directory-ca".to_string(),
            fingerprint_sha256: fingerprint.to_string(),
            not_before: Utc::now() - ChronoDuration::days(1),
            not_after: Utc::now() + ChronoDuration::days(364),
        }
    }

    fn verifier(config: MtlsConfig) -> (CertificateVerifier, Arc<MemoryCertificateDirectory>) {
        let directory = Arc::new(MemoryCertificateDirectory::new());
        (
            CertificateVerifier::new(config, directory.clone()),
            directory,
        )
    }

    #[tokio::test]
    async fn test_trusted_certificate_admitted() {
        let (verifier, directory) = verifier(MtlsConfig::default());
        directory.trust("aa11");

        verifier.check(Some(&cert("aa11"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_certificate_rejected_when_required() {
        let (verifier, _) = verifier(MtlsConfig::default());
        let err = verifier.check(None).await.unwrap_err();
        assert_eq!(err.error_code(), "certificate_required");
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn test_unknown_certificate_rejected() {
        let (verifier, _) = verifier(MtlsConfig::default());
        let err = verifier.check(Some(&cert("bb22"))).await.unwrap_err();
        assert_eq!(err.error_code(), "certificate_unknown");
    }

    #[tokio::test]
    async fn test_revoked_certificate_rejected() {
        let (verifier, directory) = verifier(MtlsConfig::default());
        directory.revoke("cc33");

        let err = verifier.check(Some(&cert("cc33"))).await.unwrap_err();
        assert_eq!(err.error_code(), "certificate_revoked");
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn test_deny_list_beats_directory_trust() {
        let config = MtlsConfig {
            require_certificate: true,
            denied_fingerprints: vec!["DD44".to_string()],
        };
        let (verifier, directory) = verifier(config);
        directory.trust("dd44");

        // Deny-list comparison is case-insensitive on the hex form
        let err = verifier.check(Some(&cert("dd44"))).await.unwrap_err();
        assert_eq!(err.error_code(), "certificate_denied");
    }

    #[tokio::test]
    async fn test_expired_certificate_rejected() {
        let (verifier, directory) = verifier(MtlsConfig::default());
        directory.trust("ee55");

        let mut expired = cert("ee55");
        expired.not_after = Utc::now() - ChronoDuration::days(1);
        let err = verifier.check(Some(&expired)).await.unwrap_err();
        assert_eq!(err.error_code(), "certificate_expired");
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = ClientCertificate::fingerprint_of(b"der-bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
