//! Per-call authentication channel selection.
//!
//! The resolver decides between bearer token and mutual TLS for every call,
//! keeps the in-memory mTLS transport in step with the certificate persisted
//! in secure storage, and re-issues failed mTLS calls over the token channel
//! when that is allowed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use fiscalgate_common::{
    ApiResponse, AuthMode, Error, HttpMethod, MtlsError, RequestConfig, Result, Role,
};
use fiscalgate_storage::GlobPattern;

use crate::certificate::{Certificate, CertificateInfo};
use crate::session::SessionProvider;
use crate::store::CertificateStore;
use crate::transport::{MtlsTransport, TokenTransport};

/// Role and endpoint policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Roles that always use the bearer token.
    pub token_only_roles: Vec<Role>,
    /// Roles that always use mTLS and never fall back.
    pub mtls_only_roles: Vec<Role>,
    /// Path patterns (`*` wildcard) that require mTLS.
    pub protected_patterns: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_only_roles: vec![Role::Supplier],
            mtls_only_roles: Vec::new(),
            protected_patterns: vec![
                "/mf1/receipts".to_string(),
                "/mf1/receipts/*".to_string(),
            ],
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// The principal's role forces a channel.
    RoleOverride,
    /// The caller asked for a channel.
    Explicit,
    /// The endpoint is a protected resource.
    ProtectedEndpoint,
    /// Nothing forced a channel.
    Default,
}

/// Outcome of [`AuthModeResolver::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDecision {
    pub mode: AuthMode,
    pub reason: DecisionReason,
    /// Whether a failed mTLS attempt may be re-issued with the token.
    pub fallback_allowed: bool,
}

/// Certificate state as seen by storage and the live transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub stored: bool,
    pub transport_configured: bool,
    pub subject: Option<String>,
    pub serial: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
}

/// Chooses the authentication channel and executes calls on it.
pub struct AuthModeResolver {
    config: AuthConfig,
    protected: Vec<GlobPattern>,
    store: CertificateStore,
    mtls: Arc<dyn MtlsTransport>,
    token: Arc<dyn TokenTransport>,
    session: Arc<dyn SessionProvider>,
}

impl AuthModeResolver {
    /// Create a resolver.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if a protected pattern cannot be compiled
    pub fn new(
        config: AuthConfig,
        store: CertificateStore,
        mtls: Arc<dyn MtlsTransport>,
        token: Arc<dyn TokenTransport>,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        let protected = config
            .protected_patterns
            .iter()
            .map(|p| GlobPattern::new(p))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            protected,
            store,
            mtls,
            token,
            session,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Whether `url` names a protected resource. Query strings are ignored.
    pub fn is_protected(&self, url: &str) -> bool {
        let path = request_path(url);
        self.protected.iter().any(|p| p.matches(path))
    }

    /// Decide the channel for a call.
    ///
    /// Role overrides win over an explicit mode, which wins over the
    /// protected-endpoint table.
    pub async fn resolve(
        &self,
        url: &str,
        method: HttpMethod,
        explicit: Option<AuthMode>,
    ) -> AuthDecision {
        let role = self.session.role().await;

        if let Some(role) = role {
            if self.config.token_only_roles.contains(&role) {
                return AuthDecision {
                    mode: AuthMode::Token,
                    reason: DecisionReason::RoleOverride,
                    fallback_allowed: false,
                };
            }
            if self.config.mtls_only_roles.contains(&role) {
                return AuthDecision {
                    mode: AuthMode::Mtls,
                    reason: DecisionReason::RoleOverride,
                    fallback_allowed: false,
                };
            }
        }

        let (mode, reason) = match explicit {
            Some(mode) => (mode, DecisionReason::Explicit),
            None if self.is_protected(url) => (AuthMode::Mtls, DecisionReason::ProtectedEndpoint),
            None => (AuthMode::Auto, DecisionReason::Default),
        };

        debug!(%method, url, %mode, ?reason, "Resolved auth mode");
        AuthDecision {
            mode,
            reason,
            fallback_allowed: mode != AuthMode::Token,
        }
    }

    /// Whether the live mTLS transport can be used right now.
    ///
    /// A stored certificate is not enough: the transport is probed, and if
    /// the probe fails the certificate is reloaded from storage, the
    /// transport reconfigured and the probe repeated once.
    pub async fn is_mtls_ready(&self) -> bool {
        let certificate = match self.store.load().await {
            Ok(Some(certificate)) => certificate,
            Ok(None) => return false,
            Err(e) => {
                warn!("Cannot read stored certificate: {}", e);
                return false;
            }
        };

        if self.mtls.has_certificate().await && self.mtls.test_connection().await {
            return true;
        }

        info!("mTLS transport not verified, reconfiguring from storage");
        if let Err(e) = self.mtls.remove_certificate().await {
            debug!("Failed to clear mTLS transport: {}", e);
        }
        if let Err(e) = self.mtls.configure_certificate(&certificate).await {
            warn!("Failed to reconfigure mTLS transport: {}", e);
            return false;
        }

        let ready = self.mtls.test_connection().await;
        if !ready {
            warn!("mTLS probe failed after reconfiguration");
        }
        ready
    }

    /// Execute a call on the resolved channel.
    ///
    /// A failed mTLS attempt is re-issued once over the token channel when
    /// the decision allows it, the request did not opt out and the failure
    /// does not indicate that the server processed the call.
    ///
    /// # Errors
    /// - `MtlsError::CertificateNotFound` if mTLS is required and nothing is stored
    /// - Whatever the final channel returned
    pub async fn execute(&self, request: &RequestConfig) -> Result<ApiResponse> {
        let decision = self
            .resolve(&request.url, request.method, request.auth_mode)
            .await;

        match decision.mode {
            AuthMode::Token => self.execute_token(request).await,
            AuthMode::Mtls => {
                let result = self.execute_mtls(request).await;
                self.with_fallback(request, &decision, result).await
            }
            AuthMode::Auto => {
                if self.is_mtls_ready().await {
                    let result = self.mtls.request(request).await;
                    self.with_fallback(request, &decision, result).await
                } else {
                    debug!(url = %request.url, "mTLS not ready, using token");
                    self.execute_token(request).await
                }
            }
        }
    }

    async fn execute_mtls(&self, request: &RequestConfig) -> Result<ApiResponse> {
        if !self.is_mtls_ready().await {
            if !self.store.has_certificate().await {
                return Err(MtlsError::CertificateNotFound.into());
            }
            return Err(MtlsError::Configuration("mTLS transport not ready".to_string()).into());
        }
        self.mtls.request(request).await
    }

    async fn execute_token(&self, request: &RequestConfig) -> Result<ApiResponse> {
        let token = self.session.access_token().await;
        self.token.request(request, token.as_deref()).await
    }

    async fn with_fallback(
        &self,
        request: &RequestConfig,
        decision: &AuthDecision,
        result: Result<ApiResponse>,
    ) -> Result<ApiResponse> {
        match result {
            Ok(response) => Ok(response),
            Err(e) if decision.fallback_allowed && !request.no_fallback && may_resend(request, &e) => {
                warn!(url = %request.url, "mTLS call failed ({}), retrying with token", e);
                self.execute_token(request).await
            }
            Err(e) => Err(e),
        }
    }

    /// Store a new certificate and apply it to the live transport.
    ///
    /// # Postconditions
    /// - The new certificate replaces the previous one in storage, then in
    ///   the transport
    /// - A rejected certificate or failed write leaves storage and transport
    ///   untouched
    ///
    /// # Errors
    /// - Validation and storage errors from [`CertificateStore::store`]
    /// - Transport configuration errors
    pub async fn store_certificate(&self, certificate: &Certificate) -> Result<CertificateInfo> {
        let info = self.store.store(certificate).await?;
        if let Err(e) = self.mtls.remove_certificate().await {
            debug!("Failed to clear mTLS transport: {}", e);
        }
        self.mtls.configure_certificate(certificate).await?;
        Ok(info)
    }

    /// Remove the certificate from storage and transport.
    pub async fn remove_certificate(&self) -> Result<()> {
        self.mtls.remove_certificate().await?;
        self.store.remove().await
    }

    /// Report what storage and the transport hold.
    pub async fn certificate_status(&self) -> Result<CertificateStatus> {
        let stored = self.store.load().await?;
        let info = match &stored {
            Some(certificate) => certificate.inspect().ok(),
            None => None,
        };

        Ok(CertificateStatus {
            stored: stored.is_some(),
            transport_configured: self.mtls.has_certificate().await,
            subject: info.as_ref().and_then(|i| i.subject.clone()),
            serial: info.as_ref().map(|i| i.serial.clone()),
            not_after: info.map(|i| i.not_after),
        })
    }
}

/// Whether a call that failed over mTLS may be issued again over the token
/// channel. Reads may also be re-sent after timeouts and dropped
/// connections; writes only when the server never saw them.
fn may_resend(request: &RequestConfig, err: &Error) -> bool {
    err.allows_token_fallback() || (!request.method.is_mutating() && err.is_connectivity())
}

/// Path component of a URL or path-plus-query string.
fn request_path(url: &str) -> &str {
    let without_origin = match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => url,
    };
    without_origin
        .split(['?', '#'])
        .next()
        .unwrap_or(without_origin)
}
