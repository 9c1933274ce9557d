//! JetStream key-value backend
//!
//! Wraps a NATS KV bucket. Revisions are the bucket's stream sequences, so
//! conditional updates are enforced server-side. Pattern scans run as one
//! ordered consumer over the matching subjects, last value per key.

use async_nats::jetstream::{
    self,
    consumer::{push, DeliverPolicy, ReplayPolicy},
    kv,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tally_common::{Result, StoreError};
use tracing::{debug, info, instrument};

use super::backend::{KvBackend, RawEntry};

const KV_OPERATION: &str = "KV-Operation";

/// NATS KV bucket backend
pub struct NatsKvBackend {
    client: async_nats::Client,
    store: kv::Store,
    bucket: String,
}

fn backend_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl NatsKvBackend {
    /// Open a bucket, creating it when it does not exist yet
    #[instrument(skip(client))]
    pub async fn open(client: &async_nats::Client, bucket: &str) -> Result<Self> {
        let context = jetstream::new(client.clone());
        let store = match context.get_key_value(bucket).await {
            Ok(store) => store,
            Err(err) => {
                debug!(bucket, error = %err, "Bucket lookup failed, creating it");
                let store = context
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(backend_err)?;
                info!(bucket, "Created key-value bucket");
                store
            }
        };

        Ok(Self {
            client: client.clone(),
            store,
            bucket: bucket.to_string(),
        })
    }

    /// Latest live entry of every key matching `pattern`
    async fn scan(&self, pattern: &str, headers_only: bool) -> Result<Vec<RawEntry>> {
        let consumer = self
            .store
            .stream
            .create_consumer(push::OrderedConfig {
                deliver_subject: self.client.new_inbox(),
                description: Some("tally kv scan".to_string()),
                filter_subject: format!("{}{}", self.store.prefix, pattern),
                headers_only,
                replay_policy: ReplayPolicy::Instant,
                deliver_policy: DeliverPolicy::LastPerSubject,
                ..Default::default()
            })
            .await
            .map_err(backend_err)?;

        let mut entries = Vec::new();
        if consumer.cached_info().num_pending == 0 {
            return Ok(entries);
        }

        let mut messages = consumer.messages().await.map_err(backend_err)?;
        while let Some(message) = messages.next().await {
            let message = message.map_err(backend_err)?;
            let (revision, pending) = {
                let info = message.info().map_err(backend_err)?;
                (info.stream_sequence, info.pending)
            };

            let removed = message
                .headers
                .as_ref()
                .and_then(|headers| headers.get(KV_OPERATION))
                .map(|op| matches!(op.as_str(), "DEL" | "PURGE"))
                .unwrap_or(false);

            if !removed {
                if let Some(key) = message.subject.as_str().strip_prefix(&self.store.prefix) {
                    entries.push(RawEntry {
                        key: key.to_string(),
                        value: message.payload.clone(),
                        revision,
                    });
                }
            }

            if pending == 0 {
                break;
            }
        }

        debug!(pattern, found = entries.len(), "Scanned bucket");
        Ok(entries)
    }
}

#[async_trait]
impl KvBackend for NatsKvBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn entry(&self, key: &str) -> Result<Option<RawEntry>> {
        let entry = self.store.entry(key).await.map_err(backend_err)?;
        Ok(entry
            .filter(|e| matches!(e.operation, kv::Operation::Put))
            .map(|e| RawEntry {
                key: e.key,
                value: e.value,
                revision: e.revision,
            }))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        Ok(self.store.put(key, value).await.map_err(backend_err)?)
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        // Expected last revision 0: the subject holds no message at all
        let err = match self.store.update(key, value.clone(), 0).await {
            Ok(revision) => return Ok(revision),
            Err(err) => err,
        };

        // The server reports a wrong-last-sequence failure; tell it apart
        // from transport errors by looking at what is stored now.
        match self.store.entry(key).await.map_err(backend_err)? {
            Some(current) if matches!(current.operation, kv::Operation::Put) => {
                Err(StoreError::AlreadyExists(key.to_string()).into())
            }
            // A delete marker still carries the subject's last sequence
            Some(marker) => match self.store.update(key, value, marker.revision).await {
                Ok(revision) => Ok(revision),
                Err(_) => Err(StoreError::AlreadyExists(key.to_string()).into()),
            },
            None => Err(backend_err(err).into()),
        }
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64> {
        match self.store.update(key, value, revision).await {
            Ok(next) => Ok(next),
            Err(err) => match self.entry(key).await? {
                Some(current) if current.revision != revision => Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: revision,
                }
                .into()),
                None => Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: revision,
                }
                .into()),
                Some(_) => Err(backend_err(err).into()),
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await.map_err(backend_err)?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.scan(pattern, true).await?;
        Ok(entries.into_iter().map(|e| e.key).collect())
    }

    async fn entries(&self, pattern: &str) -> Result<Vec<RawEntry>> {
        self.scan(pattern, false).await
    }
}
