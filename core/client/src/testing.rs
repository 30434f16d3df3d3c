//! Scripted transports for client tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use fiscalgate_auth::{Certificate, CertificateFormat, MtlsTransport, PlatformInfo, TokenTransport};
use fiscalgate_common::{ApiResponse, Error, HttpMethod, MtlsError, RequestConfig, Result};

#[derive(Debug, Clone)]
pub enum Reply {
    Json(serde_json::Value),
    Unreachable,
    Status(u16),
}

/// One call seen by [`ScriptedTokenTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: HttpMethod,
    pub url: String,
    pub token: Option<String>,
}

/// Token transport answering per URL; unscripted URLs echo the URL back.
#[derive(Default)]
pub struct ScriptedTokenTransport {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTokenTransport {
    pub fn reply(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TokenTransport for ScriptedTokenTransport {
    async fn request(&self, request: &RequestConfig, token: Option<&str>) -> Result<ApiResponse> {
        self.calls.lock().unwrap().push(Call {
            method: request.method,
            url: request.url.clone(),
            token: token.map(str::to_string),
        });
        let reply = self.replies.lock().unwrap().get(&request.url).cloned();
        match reply {
            None => Ok(ApiResponse::new(200, serde_json::json!({ "url": request.url }))),
            Some(Reply::Json(data)) => Ok(ApiResponse::new(200, data)),
            Some(Reply::Unreachable) => Err(Error::Network("connection refused".to_string())),
            Some(Reply::Status(status)) => Err(Error::from_status(status, "rejected")),
        }
    }

    fn base_url(&self) -> String {
        "https://api.test".to_string()
    }
}

/// mTLS transport that is never usable.
#[derive(Default)]
pub struct UnavailableMtlsTransport;

#[async_trait]
impl MtlsTransport for UnavailableMtlsTransport {
    async fn configure_certificate(&self, _certificate: &Certificate) -> Result<()> {
        Err(MtlsError::NotSupported("no mTLS in tests".to_string()).into())
    }

    async fn remove_certificate(&self) -> Result<()> {
        Ok(())
    }

    async fn has_certificate(&self) -> bool {
        false
    }

    async fn test_connection(&self) -> bool {
        false
    }

    async fn request(&self, _request: &RequestConfig) -> Result<ApiResponse> {
        Err(MtlsError::CertificateNotFound.into())
    }

    fn base_url(&self) -> String {
        "https://api.test:444".to_string()
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            platform: "test".to_string(),
            mtls_supported: false,
            certificate_formats: vec![CertificateFormat::Pem],
        }
    }
}
