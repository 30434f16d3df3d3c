//! Persistent certificate store.

use std::sync::Arc;
use tracing::{debug, info, warn};

use fiscalgate_common::{system_clock, CertificateError, Error, Result, SharedClock};
use fiscalgate_storage::SecureStorage;

use crate::certificate::{Certificate, CertificateInfo};

/// Storage key holding the serialized certificate.
pub const DEFAULT_CERTIFICATE_KEY: &str = "mtls_certificate";

/// Holds at most one client certificate in secure storage.
///
/// Certificate bytes survive process restarts; the live transport
/// configuration does not, which is why the resolver reloads from here.
pub struct CertificateStore {
    storage: Arc<dyn SecureStorage>,
    key: String,
    clock: SharedClock,
}

impl CertificateStore {
    /// Create a store under [`DEFAULT_CERTIFICATE_KEY`].
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self {
            storage,
            key: DEFAULT_CERTIFICATE_KEY.to_string(),
            clock: system_clock(),
        }
    }

    /// Use a different storage key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Use a different clock for expiry checks.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Load the stored certificate, if any.
    ///
    /// # Errors
    /// - `CertificateError::Storage` if storage cannot be read
    /// - `CertificateError::Invalid` if the stored record is corrupt
    pub async fn load(&self) -> Result<Option<Certificate>> {
        let raw = self
            .storage
            .get(&self.key)
            .await
            .map_err(|e| CertificateError::Storage(e.to_string()))?;

        match raw {
            Some(json) => {
                let certificate: Certificate = serde_json::from_str(&json)
                    .map_err(|e| CertificateError::Invalid(format!("stored record: {}", e)))?;
                Ok(Some(certificate))
            }
            None => Ok(None),
        }
    }

    /// Whether a certificate is stored. Storage errors count as absent.
    pub async fn has_certificate(&self) -> bool {
        match self.storage.get(&self.key).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                warn!("Failed to read certificate storage: {}", e);
                false
            }
        }
    }

    /// Validate and store a certificate, superseding the previous one.
    ///
    /// # Preconditions
    /// - The certificate is PEM, parseable and not expired
    ///
    /// # Postconditions
    /// - On success the new certificate overwrites the previous one
    /// - On any error the previous certificate is left in place
    ///
    /// # Errors
    /// - Validation errors from [`Certificate::validate`]
    /// - `CertificateError::Storage` if the write fails
    pub async fn store(&self, certificate: &Certificate) -> Result<CertificateInfo> {
        let info = certificate.validate(self.clock.now())?;

        let json = serde_json::to_string(certificate)?;
        self.storage
            .set(&self.key, &json)
            .await
            .map_err(|e| Error::from(CertificateError::Storage(e.to_string())))?;

        info!(
            subject = info.subject.as_deref().unwrap_or("-"),
            not_after = %info.not_after,
            "Stored client certificate"
        );
        Ok(info)
    }

    /// Remove the stored certificate.
    pub async fn remove(&self) -> Result<()> {
        self.storage
            .remove(&self.key)
            .await
            .map_err(|e| CertificateError::Storage(e.to_string()))?;
        debug!("Removed client certificate");
        Ok(())
    }
}
