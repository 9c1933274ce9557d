//! Raw key-value backend contract
//!
//! Backends store opaque bytes with a per-key revision. Typed access,
//! envelopes and expiry live one layer up in [`super::Repo`].

use async_trait::async_trait;
use bytes::Bytes;
use tally_common::Result;

/// A stored value together with its revision
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub key: String,
    pub value: Bytes,
    /// Monotonic per-bucket revision of the last write to this key
    pub revision: u64,
}

/// Durable key-value substrate
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Bucket name, for logging
    fn bucket(&self) -> &str;

    /// Current entry for a key, `None` if absent or deleted
    async fn entry(&self, key: &str) -> Result<Option<RawEntry>>;

    /// Unconditional write, returns the new revision
    async fn put(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Write only if the key does not exist (`StoreError::AlreadyExists` otherwise)
    async fn create(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Write only if the stored revision equals `revision` (`StoreError::Conflict` otherwise)
    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Live keys matching a wildcard pattern (`>` for all), in no particular order
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Live entries matching a wildcard pattern, read in a single pass
    async fn entries(&self, pattern: &str) -> Result<Vec<RawEntry>>;
}
