//! Authentication channel selection for fiscalgate.
//!
//! Every outgoing call is authenticated either with a client certificate
//! over mutual TLS or with a bearer token. This crate provides:
//! - The certificate model, X.509 inspection and persistent store
//! - mTLS and bearer transports built on reqwest
//! - [`AuthModeResolver`], which picks the channel per call, keeps the mTLS
//!   transport configured from storage and falls back to the token channel

pub mod certificate;
pub mod resolver;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use certificate::{Certificate, CertificateFormat, CertificateInfo};
pub use resolver::{AuthConfig, AuthDecision, AuthModeResolver, CertificateStatus, DecisionReason};
pub use session::{SessionProvider, StaticSession};
pub use store::{CertificateStore, DEFAULT_CERTIFICATE_KEY};
pub use transport::{
    MtlsTransport, PlatformInfo, ReqwestMtlsTransport, ReqwestTokenTransport, TokenTransport,
};
