//! In-memory key-value backend
//!
//! Uses DashMap for concurrent access and a bucket-wide revision counter, so
//! compare-and-set behaves like the JetStream bucket it stands in for.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tally_common::{subject, Result, StoreError};

use super::backend::{KvBackend, RawEntry};

/// In-memory backend implementation
pub struct MemoryKvBackend {
    bucket: String,
    entries: DashMap<String, (Bytes, u64)>,
    revision: AtomicU64,
}

impl MemoryKvBackend {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            entries: DashMap::new(),
            revision: AtomicU64::new(0),
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn entry(&self, key: &str) -> Result<Option<RawEntry>> {
        Ok(self.entries.get(key).map(|e| {
            let (value, revision) = e.value();
            RawEntry {
                key: key.to_string(),
                value: value.clone(),
                revision: *revision,
            }
        }))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        let revision = self.next_revision();
        self.entries.insert(key.to_string(), (value, revision));
        Ok(revision)
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(key.to_string()).into()),
            Entry::Vacant(slot) => {
                let revision = self.next_revision();
                slot.insert((value, revision));
                Ok(revision)
            }
        }
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64> {
        match self.entries.get_mut(key) {
            Some(mut current) if current.1 == revision => {
                let next = self.next_revision();
                *current = (value, next);
                Ok(next)
            }
            _ => Err(StoreError::Conflict {
                key: key.to_string(),
                expected: revision,
            }
            .into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| subject::matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn entries(&self, pattern: &str) -> Result<Vec<RawEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| subject::matches(pattern, e.key()))
            .map(|e| {
                let (value, revision) = e.value();
                RawEntry {
                    key: e.key().clone(),
                    value: value.clone(),
                    revision: *revision,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::TallyError;

    #[tokio::test]
    async fn test_put_and_entry() {
        let kv = MemoryKvBackend::new("test");
        let rev = kv.put("a", Bytes::from_static(b"1")).await.unwrap();

        let entry = kv.entry("a").await.unwrap().unwrap();
        assert_eq!(entry.value, Bytes::from_static(b"1"));
        assert_eq!(entry.revision, rev);
        assert!(kv.entry("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let kv = MemoryKvBackend::new("test");
        kv.create("a", Bytes::from_static(b"1")).await.unwrap();

        let err = kv.create("a", Bytes::from_static(b"2")).await.unwrap_err();
        assert!(matches!(err, TallyError::Store(StoreError::AlreadyExists(_))));
        assert_eq!(kv.entry("a").await.unwrap().unwrap().value, Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_update_checks_revision() {
        let kv = MemoryKvBackend::new("test");
        let rev = kv.create("a", Bytes::from_static(b"1")).await.unwrap();

        let next = kv.update("a", Bytes::from_static(b"2"), rev).await.unwrap();
        assert!(next > rev);

        let err = kv.update("a", Bytes::from_static(b"3"), rev).await.unwrap_err();
        assert!(matches!(err, TallyError::Store(StoreError::Conflict { .. })));
        assert_eq!(kv.entry("a").await.unwrap().unwrap().value, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_delete() {
        let kv = MemoryKvBackend::new("test");
        kv.put("a", Bytes::from_static(b"1")).await.unwrap();
        kv.delete("a").await.unwrap();
        assert!(kv.is_empty());
        assert!(kv.keys(">").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pattern_scans() {
        let kv = MemoryKvBackend::new("test");
        kv.put("api.sum.m1.c1", Bytes::from_static(b"1")).await.unwrap();
        kv.put("api.sum.m1.c2", Bytes::from_static(b"2")).await.unwrap();
        kv.put("api.avg.m2.c1", Bytes::from_static(b"3")).await.unwrap();

        let mut keys = kv.keys("api.sum.>").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["api.sum.m1.c1", "api.sum.m1.c2"]);

        let entries = kv.entries("api.*.m2.c1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, Bytes::from_static(b"3"));
        assert!(kv.entries("login.>").await.unwrap().is_empty());
    }
}
