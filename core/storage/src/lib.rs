//! Adapter contracts consumed by the fiscalgate core.
//!
//! The request engine never touches a platform API directly. It depends on
//! three abstract collaborators, each with in-process implementations here:
//!
//! - [`SecureStorage`]: string key-value persistence for certificates and the
//!   offline queue ([`MemorySecureStorage`], [`FileSecureStorage`])
//! - [`CacheAdapter`]: response cache keyed by normalized request URL
//!   ([`MemoryCacheAdapter`])
//! - [`NetworkMonitor`]: reachability signal and link information
//!   ([`ManualNetworkMonitor`], [`ProbeNetworkMonitor`])

pub mod cache;
pub mod glob;
pub mod local;
pub mod memory;
pub mod network;
pub mod probe;
pub mod secure;

pub use cache::{CacheAdapter, CacheSource, CacheSyncStatus, CachedItem};
pub use glob::GlobPattern;
pub use local::FileSecureStorage;
pub use memory::{MemoryCacheAdapter, MemorySecureStorage};
pub use network::{ManualNetworkMonitor, NetworkInfo, NetworkMonitor};
pub use probe::ProbeNetworkMonitor;
pub use secure::SecureStorage;
