//! Common types used throughout fiscalgate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// HTTP method of an outgoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Whether repeating the call leaves the server unchanged.
    pub fn is_idempotent_read(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head)
    }

    /// Whether the call mutates server state.
    pub fn is_mutating(&self) -> bool {
        !self.is_idempotent_read()
    }

    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::InvalidInput(format!("Unknown HTTP method: {}", other))),
        }
    }
}

/// Authentication channel for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` on the default endpoint.
    Token,
    /// Client certificate on the mTLS endpoint.
    Mtls,
    /// Use mTLS when it is ready, otherwise the token.
    Auto,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Token => f.write_str("token"),
            AuthMode::Mtls => f.write_str("mtls"),
            AuthMode::Auto => f.write_str("auto"),
        }
    }
}

/// Role of the authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Supplier,
    Merchant,
    Cashier,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().trim_start_matches("role_") {
            "supplier" => Ok(Role::Supplier),
            "merchant" => Ok(Role::Merchant),
            "cashier" => Ok(Role::Cashier),
            other => Err(Error::InvalidInput(format!("Unknown role: {}", other))),
        }
    }
}

/// One logical outgoing call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Path plus query, relative to the API base (e.g. `/mf1/receipts?page=2`).
    pub url: String,
    pub method: HttpMethod,
    /// JSON body for mutating calls.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Extra headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Per-call timeout overriding the client default.
    #[serde(default, with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    /// Explicit channel requested by the caller.
    #[serde(default)]
    pub auth_mode: Option<AuthMode>,
    /// Never retry a failed mTLS call over the token channel.
    #[serde(default)]
    pub no_fallback: bool,
}

impl RequestConfig {
    /// Create a request with no body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            headers: Vec::new(),
            timeout: None,
            auth_mode: None,
            no_fallback: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(HttpMethod::Put, url).with_body(body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Set the JSON body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request a specific authentication channel.
    pub fn with_auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = Some(mode);
        self
    }

    /// Disable mTLS-to-token fallback.
    pub fn without_fallback(mut self) -> Self {
        self.no_fallback = true;
        self
    }
}

/// Decoded response of a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub data: serde_json::Value,
}

impl ApiResponse {
    pub fn new(status: u16, data: serde_json::Value) -> Self {
        Self { status, data }
    }
}

/// Serde helpers storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde helpers storing an `Option<Duration>` as integer milliseconds.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
