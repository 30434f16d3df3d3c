//! Common utilities and types shared across fiscalgate modules.
//!
//! This module provides the error taxonomy, request/response types and the
//! clock abstraction used by every other crate.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CertificateError, Error, MtlsError, Result};
pub use types::{ApiResponse, AuthMode, HttpMethod, RequestConfig, Role};
