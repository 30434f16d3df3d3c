//! Fiscalgate offline sync
//!
//! Durable replay of mutations made while the server was unreachable:
//! - Persisted priority queue with crash recovery
//! - Batched drain with bounded concurrency and exponential backoff
//! - Online / Offline / Emergency operating mode
//! - Background scheduling on reconnect, due retries and intervals

pub mod manager;
pub mod offline;
pub mod operation;
pub mod queue;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{OperationExecutor, SyncConfig, SyncEvent, SyncManager, SyncReport};
pub use offline::{
    BufferedWrite, OfflineConfig, OfflineEvent, OfflineMode, OfflineModeStateMachine, OfflineState,
};
pub use operation::{resource_of, OperationStatus, OperationType, Priority, QueuedOperation};
pub use queue::{OfflineOperationQueue, QueueConfig, QueueStats, DEFAULT_QUEUE_KEY};
pub use retry::RetryConfig;
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
