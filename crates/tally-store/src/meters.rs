//! Meter registry
//!
//! CRUD over meter definitions, keyed by [`Meter::key`]. Meters are never
//! modified in place: a change is a delete followed by a new registration.

use std::sync::Arc;
use tally_common::{Meter, Result, StoreError, TallyError};
use tracing::{info, instrument};

use crate::kv::{KvBackend, Repo};

#[derive(Clone)]
pub struct MeterRegistry {
    repo: Repo<Meter>,
}

impl MeterRegistry {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            repo: Repo::new(backend),
        }
    }

    /// Validate and persist a meter; `AlreadyExists` if its key is taken
    #[instrument(skip(self, meter), fields(meter = %meter.key()))]
    pub async fn register(&self, meter: &Meter) -> Result<()> {
        meter.validate()?;

        let key = meter.key();
        match self.repo.create(&key, meter).await {
            Ok(_) => {
                info!(hash = %meter.hash(), "Registered meter");
                Ok(())
            }
            Err(TallyError::Store(StoreError::AlreadyExists(_))) => Err(
                TallyError::AlreadyExists(format!("meter {} already exists", key)),
            ),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Meter> {
        self.repo.get(key).await.map_err(|e| {
            if e.is_not_found() {
                TallyError::NotFound(format!("meter {} not found", key))
            } else {
                e
            }
        })
    }

    /// Every registered meter, empty when none exist
    pub async fn list(&self) -> Result<Vec<Meter>> {
        self.list_matching(">").await
    }

    /// Meters consuming a given event type
    pub async fn list_for_event_type(&self, event_type: &str) -> Result<Vec<Meter>> {
        self.list_matching(&format!("{}.*.*", event_type)).await
    }

    async fn list_matching(&self, pattern: &str) -> Result<Vec<Meter>> {
        match self.repo.list(pattern).await {
            Ok(meters) => Ok(meters),
            Err(e) if e.is_no_keys() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Remove a meter, returning what was stored
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<Meter> {
        let meter = self.get(key).await?;
        self.repo.delete(key).await?;
        info!(hash = %meter.hash(), "Deleted meter");
        Ok(meter)
    }
}
