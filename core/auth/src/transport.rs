//! HTTP transports for the two authentication channels.

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use fiscalgate_common::{ApiResponse, Error, HttpMethod, MtlsError, RequestConfig, Result};

use crate::certificate::{Certificate, CertificateFormat};

/// Port of the mTLS endpoint on the API host.
pub const DEFAULT_MTLS_PORT: u16 = 444;
/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capabilities of the mTLS implementation on this platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub platform: String,
    pub mtls_supported: bool,
    pub certificate_formats: Vec<CertificateFormat>,
}

/// Transport presenting a client certificate.
///
/// Configuration lives in memory only and must be re-applied after a restart.
#[async_trait]
pub trait MtlsTransport: Send + Sync {
    /// Configure the transport with a client certificate, replacing any
    /// previous one.
    ///
    /// # Errors
    /// - `MtlsError::NotSupported` for formats the platform cannot load
    /// - `MtlsError::Configuration` if the identity is rejected
    async fn configure_certificate(&self, certificate: &Certificate) -> Result<()>;

    /// Drop the configured certificate.
    async fn remove_certificate(&self) -> Result<()>;

    /// Whether a certificate is currently configured.
    async fn has_certificate(&self) -> bool;

    /// Lightweight probe confirming the configured certificate is usable.
    async fn test_connection(&self) -> bool;

    /// Send a call over the mTLS endpoint.
    async fn request(&self, request: &RequestConfig) -> Result<ApiResponse>;

    /// Base URL of the mTLS endpoint.
    fn base_url(&self) -> String;

    fn platform_info(&self) -> PlatformInfo;
}

/// Transport carrying a bearer token on the default endpoint.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    /// Send a call, adding `Authorization: Bearer <token>` when a token is given.
    async fn request(&self, request: &RequestConfig, token: Option<&str>) -> Result<ApiResponse>;

    /// Base URL of the default endpoint.
    fn base_url(&self) -> String;
}

/// Same host as `api_base_url` with the port replaced by `port`.
pub fn mtls_base_url(api_base_url: &str, port: u16) -> Result<String> {
    let mut url = Url::parse(api_base_url)
        .map_err(|e| Error::InvalidInput(format!("Invalid API base URL: {}", e)))?;
    url.set_port(Some(port))
        .map_err(|_| Error::InvalidInput(format!("Cannot set port on {}", api_base_url)))?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), path)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

/// Translate a reqwest failure into the error taxonomy.
///
/// Connect-phase failures (including connect timeouts) become
/// `Error::Network`; anything that broke once the request was on the wire
/// becomes `Error::Timeout` or `Error::Interrupted`.
pub fn translate_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_connect() {
        Error::Network(err.to_string())
    } else if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else if err.is_builder() {
        Error::InvalidInput(err.to_string())
    } else if err.is_decode() {
        Error::Serialization(err.to_string())
    } else {
        Error::Interrupted(err.to_string())
    }
}

async fn send(
    client: &Client,
    base_url: &str,
    request: &RequestConfig,
    token: Option<&str>,
    default_timeout: Duration,
) -> Result<ApiResponse> {
    let url = join_url(base_url, &request.url);
    debug!(method = %request.method, url = %url, "Sending request");

    let mut builder = client
        .request(to_reqwest_method(request.method), &url)
        .timeout(request.timeout.unwrap_or(default_timeout));

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let response = builder.send().await.map_err(translate_reqwest_error)?;
    handle_response(response).await
}

/// Decode a response: JSON on success, a typed error otherwise.
async fn handle_response(response: reqwest::Response) -> Result<ApiResponse> {
    let status = response.status();
    let body = response.text().await.map_err(translate_reqwest_error)?;

    if !status.is_success() {
        return Err(Error::from_status(status.as_u16(), body));
    }

    let data = if body.trim().is_empty() || status == StatusCode::NO_CONTENT {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&body)?
    };
    Ok(ApiResponse::new(status.as_u16(), data))
}

/// Bearer-token transport backed by reqwest.
pub struct ReqwestTokenTransport {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl ReqwestTokenTransport {
    /// Create a transport for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("fiscalgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the default per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TokenTransport for ReqwestTokenTransport {
    async fn request(&self, request: &RequestConfig, token: Option<&str>) -> Result<ApiResponse> {
        send(&self.http, &self.base_url, request, token, self.timeout).await
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }
}

/// mTLS transport backed by reqwest with a rustls client identity.
///
/// The configured client is held in memory; a fresh instance starts
/// unconfigured.
pub struct ReqwestMtlsTransport {
    client: RwLock<Option<Client>>,
    base_url: String,
    probe_path: String,
    timeout: Duration,
}

impl ReqwestMtlsTransport {
    /// Create a transport for the mTLS port of `api_base_url`.
    pub fn new(api_base_url: &str, port: u16) -> Result<Self> {
        Ok(Self {
            client: RwLock::new(None),
            base_url: mtls_base_url(api_base_url, port)?,
            probe_path: "/".to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Path requested by [`MtlsTransport::test_connection`].
    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    /// Set the default per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_client(&self, certificate: &Certificate) -> Result<Client> {
        if certificate.format != CertificateFormat::Pem {
            return Err(MtlsError::NotSupported(format!(
                "{:?} certificates",
                certificate.format
            ))
            .into());
        }

        let identity = reqwest::Identity::from_pem(&certificate.identity_pem())
            .map_err(|e| MtlsError::Configuration(format!("Failed to create identity: {}", e)))?;

        Client::builder()
            .identity(identity)
            .timeout(self.timeout)
            .build()
            .map_err(|e| {
                Error::from(MtlsError::Configuration(format!(
                    "Failed to build mTLS client: {}",
                    e
                )))
            })
    }
}

#[async_trait]
impl MtlsTransport for ReqwestMtlsTransport {
    async fn configure_certificate(&self, certificate: &Certificate) -> Result<()> {
        let client = self.build_client(certificate)?;
        *self.client.write().await = Some(client);
        info!(base_url = %self.base_url, "mTLS transport configured");
        Ok(())
    }

    async fn remove_certificate(&self) -> Result<()> {
        *self.client.write().await = None;
        Ok(())
    }

    async fn has_certificate(&self) -> bool {
        self.client.read().await.is_some()
    }

    async fn test_connection(&self) -> bool {
        let client = match self.client.read().await.clone() {
            Some(client) => client,
            None => return false,
        };

        // Any HTTP answer proves the handshake succeeded.
        match client
            .get(join_url(&self.base_url, &self.probe_path))
            .send()
            .await
        {
            Ok(response) => {
                debug!(status = response.status().as_u16(), "mTLS probe answered");
                true
            }
            Err(e) => {
                debug!("mTLS probe failed: {}", e);
                false
            }
        }
    }

    async fn request(&self, request: &RequestConfig) -> Result<ApiResponse> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(MtlsError::CertificateNotFound)?;
        send(&client, &self.base_url, request, None, self.timeout).await
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            platform: std::env::consts::OS.to_string(),
            mtls_supported: true,
            certificate_formats: vec![CertificateFormat::Pem],
        }
    }
}
