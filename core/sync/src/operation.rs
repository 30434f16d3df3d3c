//! Queued mutating operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use fiscalgate_common::{Error, HttpMethod, RequestConfig, Result};

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    /// Mutation kind of an HTTP method; `None` for reads.
    pub fn for_method(method: HttpMethod) -> Option<Self> {
        match method {
            HttpMethod::Post => Some(OperationType::Create),
            HttpMethod::Put | HttpMethod::Patch => Some(OperationType::Update),
            HttpMethod::Delete => Some(OperationType::Delete),
            HttpMethod::Get | HttpMethod::Head => None,
        }
    }
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting to be sent.
    Pending,
    /// Handed to the executor; at most one execution per entry.
    Processing,
    /// Accepted by the server.
    Completed,
    /// Out of retries or rejected; kept until retried or removed.
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown status: {}", other))),
        }
    }
}

/// Drain priority. Higher values drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::InvalidInput(format!("Unknown priority: {}", other))),
        }
    }
}

/// One mutation recorded while the server could not be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Resource name, e.g. `receipts`.
    pub resource: String,
    /// Request path plus query.
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    #[serde(default)]
    pub error: Option<String>,
    /// Earliest time of the next attempt; `None` means now.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedOperation {
    /// Create a pending operation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op_type: OperationType,
        resource: impl Into<String>,
        endpoint: impl Into<String>,
        method: HttpMethod,
        payload: Option<serde_json::Value>,
        priority: Priority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            op_type,
            resource: resource.into(),
            endpoint: endpoint.into(),
            method,
            payload,
            status: OperationStatus::Pending,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            max_retries,
            priority,
            error: None,
            next_attempt_at: None,
        }
    }

    /// Whether the operation may be handed out at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Whether another automatic attempt is allowed.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Mark as handed to the executor.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Processing;
        self.updated_at = now;
    }

    /// Mark as accepted by the server.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Completed;
        self.error = None;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// Record a failed attempt.
    ///
    /// With `retry_at` the operation goes back to pending until then;
    /// without it the operation is failed. `retry_count` never exceeds
    /// `max_retries`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.error = Some(error.into());
        self.updated_at = now;
        match retry_at {
            Some(at) => {
                self.status = OperationStatus::Pending;
                self.next_attempt_at = Some(at);
            }
            None => {
                self.status = OperationStatus::Failed;
                self.next_attempt_at = None;
            }
        }
    }

    /// Put a failed operation back in line with a fresh retry budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Pending;
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// The HTTP call this operation replays.
    pub fn to_request(&self) -> RequestConfig {
        let mut request = RequestConfig::new(self.method, self.endpoint.clone());
        request.body = self.payload.clone();
        request
    }
}

/// Resource name of a request path: the first segment after an `mfN`
/// version prefix, or the first segment otherwise.
pub fn resource_of(endpoint: &str) -> String {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match segments.next() {
        Some(first) if first.starts_with("mf") && first[2..].chars().all(|c| c.is_ascii_digit()) => {
            segments.next().unwrap_or(first).to_string()
        }
        Some(first) => first.to_string(),
        None => String::new(),
    }
}
