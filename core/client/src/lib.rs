//! Fiscalgate client
//!
//! Resilient request engine for the fiscal-receipt API. Each call is
//! authenticated over mTLS or with a bearer token, reads are served from
//! the network or the response cache depending on the endpoint and the
//! link, and writes that cannot reach the server are queued durably and
//! replayed once connectivity returns.
//!
//! ```no_run
//! use fiscalgate_client::{ClientConfig, FiscalClient};
//! use fiscalgate_common::RequestConfig;
//! use fiscalgate_sync::SyncMode;
//!
//! # async fn example() -> fiscalgate_common::Result<()> {
//! let client = FiscalClient::builder(ClientConfig::new("https://api.example.com"))
//!     .build()
//!     .await?;
//! let _tasks = client.start(SyncMode::OnReconnect);
//! let merchants = client.request(RequestConfig::get("/mf1/merchants")).await?;
//! # let _ = merchants;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{BackgroundTasks, FiscalClient, FiscalClientBuilder};
pub use config::{ClientConfig, DEFAULT_MTLS_PORT};
pub use dispatcher::{Dispatched, ReplayExecutor, RequestDispatcher, Response};
