//! Secure key-value storage contract.

use async_trait::async_trait;

use fiscalgate_common::Result;

/// String key-value persistence used for certificates and queue state.
///
/// Implementations decide where bytes live (keychain, encrypted file,
/// browser storage). Values are opaque strings, usually JSON documents
/// rewritten wholesale on every update.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Read a value.
    ///
    /// # Returns
    /// `None` when the key has never been written or was removed.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    ///
    /// # Postconditions
    /// - A subsequent `get` for `key` returns `value`, also across restarts
    ///   for persistent implementations
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
