//! Test fixtures: generated certificates and scripted transports.

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, KeyPair};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use fiscalgate_common::{ApiResponse, Error, MtlsError, RequestConfig, Result};

use crate::certificate::Certificate;
use crate::transport::{MtlsTransport, PlatformInfo, TokenTransport};

/// Self-signed certificate valid for the next few years.
pub fn test_certificate(common_name: &str) -> Certificate {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    Certificate::pem(cert.pem(), key.serialize_pem())
}

/// Self-signed certificate that expired in 2001.
pub fn expired_certificate() -> Certificate {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.not_before = rcgen::date_time_ymd(2000, 1, 1);
    params.not_after = rcgen::date_time_ymd(2001, 1, 1);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    Certificate::pem(cert.pem(), key.serialize_pem())
}

/// Scripted outcome of a transport call.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Ok,
    NetworkError,
    Timeout,
    Status(u16),
}

impl Outcome {
    fn into_result(self, channel: &str) -> Result<ApiResponse> {
        match self {
            Outcome::Ok => Ok(ApiResponse::new(
                200,
                serde_json::json!({ "channel": channel }),
            )),
            Outcome::NetworkError => Err(Error::Network("connection refused".to_string())),
            Outcome::Timeout => Err(Error::Timeout("no response within 30s".to_string())),
            Outcome::Status(status) => Err(Error::from_status(status, "scripted")),
        }
    }
}

/// In-memory mTLS transport. Its configuration is lost when it is dropped,
/// which is how tests model a process restart.
pub struct FakeMtlsTransport {
    configured: AtomicBool,
    reachable: AtomicBool,
    outcome: Mutex<Outcome>,
    pub configure_calls: AtomicUsize,
    pub request_calls: AtomicUsize,
}

impl FakeMtlsTransport {
    pub fn new() -> Self {
        Self {
            configured: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            outcome: Mutex::new(Outcome::Ok),
            configure_calls: AtomicUsize::new(0),
            request_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }

    pub fn configures(&self) -> usize {
        self.configure_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MtlsTransport for FakeMtlsTransport {
    async fn configure_certificate(&self, _certificate: &Certificate) -> Result<()> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_certificate(&self) -> Result<()> {
        self.configured.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_certificate(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    async fn test_connection(&self) -> bool {
        self.configured.load(Ordering::SeqCst) && self.reachable.load(Ordering::SeqCst)
    }

    async fn request(&self, _request: &RequestConfig) -> Result<ApiResponse> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        if !self.configured.load(Ordering::SeqCst) {
            return Err(MtlsError::CertificateNotFound.into());
        }
        let outcome = *self.outcome.lock().unwrap();
        outcome.into_result("mtls")
    }

    fn base_url(&self) -> String {
        "https://api.test:444".to_string()
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            platform: "test".to_string(),
            mtls_supported: true,
            certificate_formats: vec![crate::certificate::CertificateFormat::Pem],
        }
    }
}

/// In-memory bearer transport recording the tokens it was given.
pub struct FakeTokenTransport {
    outcome: Mutex<Outcome>,
    pub tokens: Mutex<Vec<Option<String>>>,
}

impl FakeTokenTransport {
    pub fn new() -> Self {
        Self {
            outcome: Mutex::new(Outcome::Ok),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn requests(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}

#[async_trait]
impl TokenTransport for FakeTokenTransport {
    async fn request(&self, _request: &RequestConfig, token: Option<&str>) -> Result<ApiResponse> {
        self.tokens.lock().unwrap().push(token.map(|t| t.to_string()));
        let outcome = *self.outcome.lock().unwrap();
        outcome.into_result("token")
    }

    fn base_url(&self) -> String {
        "https://api.test".to_string()
    }
}
