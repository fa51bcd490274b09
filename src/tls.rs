//! Certificate lifecycle collaborator
//!
//! The controller only decides *when* a node's certificate should be checked;
//! a [`CertRenewer`] decides what renewal means for each [`CertMode`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::{debug, info};

use crate::api::CertMode;
use crate::config::CertConfig;
use crate::error::{Error, Result};

/// Lifetime of locally issued certificates
const SELF_SIGNED_VALIDITY_DAYS: i64 = 90;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenewOutcome {
    /// Nothing to do for this mode
    Skipped,
    /// Existing certificate is valid past the renewal window
    Valid { expires_at: i64 },
    /// A new certificate was written
    Issued { expires_at: i64 },
}

#[async_trait]
pub trait CertRenewer: Send + Sync {
    async fn renew(&self, mode: CertMode, domain: &str) -> Result<RenewOutcome>;
}

/// Issues self-signed certificates into a local directory
///
/// ACME modes need an external provider and fail with
/// [`Error::CertificateError`].
pub struct LocalCertRenewer {
    dir: PathBuf,
    renew_before: Duration,
}

impl LocalCertRenewer {
    pub fn new(config: &CertConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            renew_before: Duration::days(config.renew_before_days),
        }
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.crt", domain))
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.key", domain))
    }

    async fn renew_self_signed(&self, domain: &str) -> Result<RenewOutcome> {
        let cert_path = self.cert_path(domain);
        let threshold = (Utc::now() + self.renew_before).timestamp();

        match read_expiry(&cert_path).await {
            Ok(expires_at) if expires_at > threshold => {
                debug!("Certificate for {} valid until {}", domain, expires_at);
                return Ok(RenewOutcome::Valid { expires_at });
            }
            Ok(_) => info!("Certificate for {} is inside the renewal window", domain),
            Err(e) => debug!("No usable certificate for {}: {}", domain, e),
        }

        let issued = issue_self_signed(domain)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.key_path(domain), issued.key_pem.as_bytes()).await?;
        tokio::fs::write(&cert_path, issued.cert_pem.as_bytes()).await?;
        info!(
            "Issued self-signed certificate for {} at {}",
            domain,
            cert_path.display()
        );
        Ok(RenewOutcome::Issued {
            expires_at: issued.expires_at,
        })
    }
}

#[async_trait]
impl CertRenewer for LocalCertRenewer {
    async fn renew(&self, mode: CertMode, domain: &str) -> Result<RenewOutcome> {
        if !mode.is_renewable() {
            return Ok(RenewOutcome::Skipped);
        }
        if domain.is_empty() {
            return Err(Error::CertificateError(format!(
                "cert mode {} requires a certificate domain",
                mode.as_str()
            )));
        }
        match mode {
            CertMode::SelfSigned => self.renew_self_signed(domain).await,
            CertMode::Http | CertMode::Dns | CertMode::Tls => Err(Error::CertificateError(
                format!("no ACME provider configured for {} mode", mode.as_str()),
            )),
            CertMode::None | CertMode::File => Ok(RenewOutcome::Skipped),
        }
    }
}

struct IssuedCert {
    cert_pem: String,
    key_pem: String,
    expires_at: i64,
}

fn cert_error(e: impl std::fmt::Display) -> Error {
    Error::CertificateError(e.to_string())
}

fn issue_self_signed(domain: &str) -> Result<IssuedCert> {
    let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(cert_error)?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, domain);

    let not_after = Utc::now() + Duration::days(SELF_SIGNED_VALIDITY_DAYS);
    let date = not_after.date_naive();
    params.not_after = rcgen::date_time_ymd(date.year(), date.month() as u8, date.day() as u8);

    let key = KeyPair::generate().map_err(cert_error)?;
    let cert = params.self_signed(&key).map_err(cert_error)?;
    let cert_pem = cert.pem();
    let expires_at = parse_expiry(cert_pem.as_bytes())?;

    Ok(IssuedCert {
        cert_pem,
        key_pem: key.serialize_pem(),
        expires_at,
    })
}

/// Unix timestamp of a PEM certificate's `notAfter`
pub fn parse_expiry(pem: &[u8]) -> Result<i64> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem).map_err(cert_error)?;
    let cert = pem.parse_x509().map_err(cert_error)?;
    Ok(cert.validity().not_after.timestamp())
}

async fn read_expiry(path: &Path) -> Result<i64> {
    let pem = tokio::fs::read(path).await?;
    parse_expiry(&pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renewer(dir: &Path, renew_before_days: i64) -> LocalCertRenewer {
        LocalCertRenewer::new(&CertConfig {
            dir: dir.to_path_buf(),
            renew_before_days,
        })
    }

    #[tokio::test]
    async fn test_self_signed_issued_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let renewer = renewer(dir.path(), 30);

        let first = renewer
            .renew(CertMode::SelfSigned, "node.example.com")
            .await
            .unwrap();
        let expires_at = match first {
            RenewOutcome::Issued { expires_at } => expires_at,
            other => panic!("expected issuance, got {:?}", other),
        };
        assert!(expires_at > Utc::now().timestamp());
        assert!(renewer.cert_path("node.example.com").exists());
        assert!(renewer.key_path("node.example.com").exists());

        let second = renewer
            .renew(CertMode::SelfSigned, "node.example.com")
            .await
            .unwrap();
        assert_eq!(second, RenewOutcome::Valid { expires_at });
    }

    #[tokio::test]
    async fn test_certificate_inside_window_is_reissued() {
        let dir = tempfile::tempdir().unwrap();
        // Window longer than the certificate lifetime forces reissue
        let renewer = renewer(dir.path(), 365);
        renewer
            .renew(CertMode::SelfSigned, "node.example.com")
            .await
            .unwrap();
        let again = renewer
            .renew(CertMode::SelfSigned, "node.example.com")
            .await
            .unwrap();
        assert!(matches!(again, RenewOutcome::Issued { .. }));
    }

    #[tokio::test]
    async fn test_acme_modes_need_a_provider() {
        let dir = tempfile::tempdir().unwrap();
        let renewer = renewer(dir.path(), 30);
        let err = renewer
            .renew(CertMode::Dns, "node.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CertificateError(_)));
    }

    #[tokio::test]
    async fn test_non_renewable_modes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let renewer = renewer(dir.path(), 30);
        assert_eq!(
            renewer.renew(CertMode::File, "").await.unwrap(),
            RenewOutcome::Skipped
        );
        assert!(renewer.renew(CertMode::SelfSigned, "").await.is_err());
    }
}
