//! Typed repository over a key-value backend
//!
//! Provides envelope-based storage with:
//! - Lazy expiry (expired reads delete the entry in the background)
//! - Wildcard enumeration (`keys`/`list`/`entries`) that fails with
//!   `StoreError::NoKeysFound` when nothing matches
//! - Optimistic read-modify-write via [`Repo::upsert`]

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tally_common::{Result, StoreError, TallyError};
use tracing::{debug, instrument, warn};

use super::backend::KvBackend;
use super::envelope::Envelope;

/// A key together with its decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub key: String,
    pub value: T,
}

/// A decoded value and the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

enum Slot<T> {
    Vacant,
    Expired { revision: u64 },
    Occupied(Versioned<T>),
}

/// Typed repository
pub struct Repo<T> {
    backend: Arc<dyn KvBackend>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repo<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            _marker: PhantomData,
        }
    }
}

fn sanitise_key(key: &str) -> String {
    key.replace(':', "-")
}

fn encode<T: Serialize>(value: &T, expires_at: Option<DateTime<Utc>>) -> Result<Bytes> {
    let envelope = Envelope {
        data: value,
        expires_at,
    };
    let bytes = serde_json::to_vec(&envelope)
        .map_err(|e| StoreError::Serialization(format!("failed to marshal value: {}", e)))?;
    Ok(Bytes::from(bytes))
}

impl<T> Repo<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            _marker: PhantomData,
        }
    }

    pub fn bucket(&self) -> &str {
        self.backend.bucket()
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Envelope<T>> {
        serde_json::from_slice(bytes).map_err(|e| {
            StoreError::Serialization(format!("failed to unmarshal {}: {}", key, e)).into()
        })
    }

    /// Drop an expired entry in the background, unless it was rewritten meanwhile
    fn expire_lazily(&self, key: String, revision: u64) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            match backend.entry(&key).await {
                Ok(Some(current)) if current.revision == revision => {
                    if let Err(e) = backend.delete(&key).await {
                        warn!(key = %key, error = %e, "Unable to drop expired key");
                    } else {
                        debug!(key = %key, "Dropped expired key");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Unable to re-read expired key"),
            }
        });
    }

    async fn slot(&self, key: &str) -> Result<Slot<T>> {
        let Some(raw) = self.backend.entry(key).await? else {
            return Ok(Slot::Vacant);
        };

        let envelope = Self::decode(key, &raw.value)?;
        if envelope.is_expired() {
            self.expire_lazily(key.to_string(), raw.revision);
            return Ok(Slot::Expired {
                revision: raw.revision,
            });
        }

        Ok(Slot::Occupied(Versioned {
            value: envelope.data,
            revision: raw.revision,
        }))
    }

    /// Fetch a value; `KeyNotFound` when absent, `Expired` when past its deadline
    #[instrument(skip(self), fields(bucket = %self.bucket()))]
    pub async fn get(&self, key: &str) -> Result<T> {
        let key = sanitise_key(key);
        match self.slot(&key).await? {
            Slot::Occupied(v) => Ok(v.value),
            Slot::Expired { .. } => Err(StoreError::Expired(key).into()),
            Slot::Vacant => Err(StoreError::KeyNotFound(key).into()),
        }
    }

    /// Fetch a value with its revision, `None` when absent or expired
    pub async fn find(&self, key: &str) -> Result<Option<Versioned<T>>> {
        match self.slot(&sanitise_key(key)).await? {
            Slot::Occupied(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &T) -> Result<u64> {
        let bytes = encode(value, None)?;
        self.backend.put(&sanitise_key(key), bytes).await
    }

    pub async fn set_with_expiry(&self, key: &str, value: &T, ttl: Duration) -> Result<u64> {
        let deadline = Envelope::expiring((), ttl)?.expires_at;
        let bytes = encode(value, deadline)?;
        self.backend.put(&sanitise_key(key), bytes).await
    }

    /// Write only if nothing live is stored under `key`
    pub async fn create(&self, key: &str, value: &T) -> Result<u64> {
        let key = sanitise_key(key);
        let bytes = encode(value, None)?;
        match self.slot(&key).await? {
            Slot::Expired { revision } => self.backend.update(&key, bytes, revision).await,
            _ => self.backend.create(&key, bytes).await,
        }
    }

    /// Write only if the stored revision still equals `revision`
    pub async fn update(&self, key: &str, value: &T, revision: u64) -> Result<u64> {
        let bytes = encode(value, None)?;
        self.backend
            .update(&sanitise_key(key), bytes, revision)
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(&sanitise_key(key)).await
    }

    /// Keys matching a wildcard pattern (`>` for all)
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = self.backend.keys(pattern).await?;
        if keys.is_empty() {
            return Err(StoreError::NoKeysFound(pattern.to_string()).into());
        }

        keys.sort();
        Ok(keys)
    }

    /// Live entries matching a wildcard pattern
    #[instrument(skip(self), fields(bucket = %self.bucket()))]
    pub async fn entries(&self, pattern: &str) -> Result<Vec<Entry<T>>> {
        let mut entries = Vec::new();
        for raw in self.backend.entries(pattern).await? {
            let envelope = Self::decode(&raw.key, &raw.value)?;
            if envelope.is_expired() {
                self.expire_lazily(raw.key, raw.revision);
                continue;
            }
            entries.push(Entry {
                key: raw.key,
                value: envelope.data,
            });
        }

        if entries.is_empty() {
            return Err(StoreError::NoKeysFound(pattern.to_string()).into());
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Live values matching a wildcard pattern
    pub async fn list(&self, pattern: &str) -> Result<Vec<T>> {
        Ok(self
            .entries(pattern)
            .await?
            .into_iter()
            .map(|e| e.value)
            .collect())
    }

    /// Read-modify-write with optimistic concurrency.
    ///
    /// `apply` receives the current value (`None` when absent or expired) and
    /// returns the value to store. The write is conditional on the revision
    /// that was read; on conflict the read and `apply` are repeated, up to
    /// `max_attempts` times.
    pub async fn upsert<F>(&self, key: &str, max_attempts: usize, mut apply: F) -> Result<T>
    where
        F: FnMut(Option<T>) -> Result<T> + Send,
    {
        let key = sanitise_key(key);
        let mut last_revision = 0;

        for attempt in 1..=max_attempts.max(1) {
            let (current, revision) = match self.slot(&key).await? {
                Slot::Vacant => (None, None),
                Slot::Expired { revision } => (None, Some(revision)),
                Slot::Occupied(v) => (Some(v.value), Some(v.revision)),
            };

            let next = apply(current)?;
            let bytes = encode(&next, None)?;

            let written = match revision {
                Some(rev) => self.backend.update(&key, bytes, rev).await,
                None => self.backend.create(&key, bytes).await,
            };

            match written {
                Ok(_) => return Ok(next),
                Err(TallyError::Store(StoreError::Conflict { .. }))
                | Err(TallyError::Store(StoreError::AlreadyExists(_))) => {
                    last_revision = revision.unwrap_or_default();
                    debug!(key = %key, attempt, "Concurrent write detected, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Conflict {
            key,
            expected: last_revision,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvBackend;

    fn repo() -> Repo<u64> {
        Repo::new(Arc::new(MemoryKvBackend::new("test")))
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let err = repo().get("a.b").await.unwrap_err();
        assert!(matches!(err, TallyError::Store(StoreError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let repo = repo();
        repo.set("a.b", &7).await.unwrap();
        assert_eq!(repo.get("a.b").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_keys_are_sanitised() {
        let repo = repo();
        repo.set("a:b", &1).await.unwrap();
        assert_eq!(repo.keys(">").await.unwrap(), vec!["a-b".to_string()]);
        assert_eq!(repo.get("a:b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_reports_expired_and_is_dropped() {
        let backend = Arc::new(MemoryKvBackend::new("test"));
        let repo: Repo<u64> = Repo::new(backend.clone());
        repo.set_with_expiry("a", &1, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = repo.get("a").await.unwrap_err();
        assert!(matches!(err, TallyError::Store(StoreError::Expired(_))));
        assert!(err.is_not_found());

        // Background deletion
        for _ in 0..50 {
            if backend.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_unexpired_entry_is_readable() {
        let repo = repo();
        repo.set_with_expiry("a", &3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(repo.get("a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_list_without_matches_fails() {
        let repo = repo();
        let err = repo.list(">").await.unwrap_err();
        assert!(err.is_no_keys());

        repo.set("x.1", &1).await.unwrap();
        let err = repo.entries("y.>").await.unwrap_err();
        assert!(err.is_no_keys());
    }

    #[tokio::test]
    async fn test_entries_filter_by_pattern() {
        let repo = repo();
        repo.set("api.sum.m1.c1", &1).await.unwrap();
        repo.set("api.sum.m1.c2", &2).await.unwrap();
        repo.set("api.avg.m2.c1", &3).await.unwrap();

        let entries = repo.entries("api.sum.>").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "api.sum.m1.c1");
        assert_eq!(entries[1].value, 2);

        let all = repo.list(">").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_entries_skip_expired() {
        let repo = repo();
        repo.set("api.sum.m1.c1", &1).await.unwrap();
        repo.set_with_expiry("api.sum.m1.c2", &2, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let entries = repo.entries("api.sum.>").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "api.sum.m1.c1");
    }

    #[tokio::test]
    async fn test_create_only_once() {
        let repo = repo();
        repo.create("k", &1).await.unwrap();
        let err = repo.create("k", &2).await.unwrap_err();
        assert!(matches!(err, TallyError::Store(StoreError::AlreadyExists(_))));
        assert_eq!(repo.get("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let repo = repo();
        let v = repo
            .upsert("k", 3, |cur| Ok(cur.unwrap_or(0) + 1))
            .await
            .unwrap();
        assert_eq!(v, 1);
        let v = repo
            .upsert("k", 3, |cur| Ok(cur.unwrap_or(0) + 1))
            .await
            .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn test_upsert_propagates_apply_error() {
        let repo = repo();
        let err = repo
            .upsert("k", 3, |_| Err(TallyError::Internal("boom".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::Internal(_)));
        assert!(repo.find("k").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_do_not_lose_updates() {
        let repo = repo();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    repo.upsert("counter", 1000, |cur| Ok(cur.unwrap_or(0) + 1))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(repo.get("counter").await.unwrap(), 200);
    }
}
