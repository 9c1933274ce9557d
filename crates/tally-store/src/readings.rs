//! Reading store
//!
//! Persists aggregate readings under their derived keys. Updates go through
//! [`ReadingStore::apply`], a compare-and-set loop, so concurrent deliveries
//! targeting the same key never overwrite each other.

use std::sync::Arc;
use tally_common::{Reading, Result, TallyError, DEFAULT_MAX_UPDATE_ATTEMPTS};
use tracing::instrument;

use crate::kv::{Entry, KvBackend, Repo};

#[derive(Clone)]
pub struct ReadingStore {
    repo: Repo<Reading>,
    max_update_attempts: usize,
}

impl ReadingStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            repo: Repo::new(backend),
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        }
    }

    /// Bound on conflict retries per update
    pub fn with_max_update_attempts(mut self, attempts: usize) -> Self {
        self.max_update_attempts = attempts.max(1);
        self
    }

    pub async fn get(&self, key: &str) -> Result<Reading> {
        self.repo.get(key).await.map_err(|e| {
            if e.is_not_found() {
                TallyError::NotFound(format!("reading {} not found", key))
            } else {
                e
            }
        })
    }

    /// Readings whose key matches a wildcard pattern (`>` for all)
    pub async fn list(&self, pattern: &str) -> Result<Vec<Entry<Reading>>> {
        match self.repo.entries(pattern).await {
            Ok(entries) => Ok(entries),
            Err(e) if e.is_no_keys() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Whether any reading key matches a wildcard pattern
    pub async fn any_matching(&self, pattern: &str) -> Result<bool> {
        match self.repo.keys(pattern).await {
            Ok(keys) => Ok(!keys.is_empty()),
            Err(e) if e.is_no_keys() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Get-or-create then modify a reading atomically with respect to other
    /// writers of the same key. `f` may run more than once.
    #[instrument(skip(self, f))]
    pub async fn apply<F>(&self, key: &str, f: F) -> Result<Reading>
    where
        F: FnMut(Option<Reading>) -> Result<Reading> + Send,
    {
        self.repo.upsert(key, self.max_update_attempts, f).await
    }
}
