//! Client certificate model and X.509 inspection.
//!
//! The private key is zeroized when the certificate is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use fiscalgate_common::{CertificateError, Error, MtlsError, Result};

/// Encoding of the certificate material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateFormat {
    /// PEM certificate plus PEM (PKCS#8 or SEC1) private key.
    Pem,
    /// PKCS#12 bundle.
    Pkcs12,
}

/// Client certificate and its private key.
///
/// At most one certificate is stored at a time.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Certificate {
    /// Certificate chain.
    pub certificate: String,
    /// Private key.
    pub private_key: String,
    #[zeroize(skip)]
    pub format: CertificateFormat,
}

impl Certificate {
    /// Create a PEM certificate.
    pub fn pem(certificate: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
            format: CertificateFormat::Pem,
        }
    }

    /// Certificate and key concatenated into one PEM buffer, the form
    /// accepted by `reqwest::Identity::from_pem`.
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.certificate.len() + self.private_key.len() + 1);
        buf.extend_from_slice(self.certificate.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(self.private_key.as_bytes());
        buf
    }

    /// Parse the leaf certificate.
    ///
    /// # Errors
    /// - `MtlsError::NotSupported` for PKCS#12 material
    /// - `CertificateError::Invalid` if the PEM cannot be parsed
    pub fn inspect(&self) -> Result<CertificateInfo> {
        if self.format == CertificateFormat::Pkcs12 {
            return Err(MtlsError::NotSupported("PKCS#12 certificates".to_string()).into());
        }
        CertificateInfo::from_pem(&self.certificate)
    }

    /// Check that the material is usable at `now`.
    ///
    /// # Errors
    /// - Everything [`Certificate::inspect`] returns
    /// - `CertificateError::Invalid` if no private key is present
    /// - `CertificateError::Expired` if `now` is past `not_after`
    pub fn validate(&self, now: DateTime<Utc>) -> Result<CertificateInfo> {
        let info = self.inspect()?;

        if !self.private_key.contains("PRIVATE KEY-----") {
            return Err(CertificateError::Invalid("missing PEM private key".to_string()).into());
        }
        if info.is_expired_at(now) {
            return Err(CertificateError::Expired(info.not_after.to_rfc3339()).into());
        }

        Ok(info)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("format", &self.format)
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Fields extracted from the leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    /// Subject common name.
    pub subject: Option<String>,
    /// Serial number, colon-separated hex.
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    /// Parse the first certificate of a PEM chain.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| CertificateError::Invalid(format!("PEM parse error: {}", e)))?;
        let x509 = pem
            .parse_x509()
            .map_err(|e| CertificateError::Invalid(format!("X509 parse error: {}", e)))?;

        let subject = x509
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|s| s.to_string());
        let validity = x509.validity();

        Ok(Self {
            subject,
            serial: x509.raw_serial_as_string(),
            not_before: asn1_to_utc(validity.not_before.timestamp())?,
            not_after: asn1_to_utc(validity.not_after.timestamp())?,
        })
    }

    /// Whether the certificate is past its validity period at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

fn asn1_to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        Error::from(CertificateError::Invalid(format!(
            "validity timestamp out of range: {}",
            timestamp
        )))
    })
}
