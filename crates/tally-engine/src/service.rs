//! Metering service
//!
//! The boundary the HTTP layer talks to: meter registry operations, event
//! ingress, reading queries, and the hooks that keep the orchestrator's
//! desired set in step with registry mutations.

use chrono::Utc;
use std::sync::Arc;
use tally_common::{subject, Event, Meter, Reading, Result, TallyError};
use tally_messaging::{MessageChannel, OutboundMessage};
use tally_store::{Entry, MeterRegistry, ReadingStore};
use tracing::{info, instrument};

use crate::orchestrator::OrchestratorHandle;

#[derive(Clone)]
pub struct MeteringService {
    registry: MeterRegistry,
    readings: ReadingStore,
    channel: Arc<dyn MessageChannel>,
    consumer: OrchestratorHandle,
}

impl MeteringService {
    pub fn new(
        registry: MeterRegistry,
        readings: ReadingStore,
        channel: Arc<dyn MessageChannel>,
        consumer: OrchestratorHandle,
    ) -> Self {
        Self {
            registry,
            readings,
            channel,
            consumer,
        }
    }

    pub async fn register_meter(&self, meter: &Meter) -> Result<()> {
        self.registry.register(meter).await
    }

    pub async fn get_meter(&self, key: &str) -> Result<Meter> {
        self.registry.get(key).await
    }

    pub async fn list_meters(&self) -> Result<Vec<Meter>> {
        self.registry.list().await
    }

    /// Delete a meter; its readings are kept
    pub async fn delete_meter(&self, key: &str) -> Result<Meter> {
        self.registry.delete(key).await
    }

    /// Validate and publish an event.
    ///
    /// Rejected with `NotFound` when no meter consumes its type. A missing
    /// `time` is stamped with the current time before publishing.
    #[instrument(skip(self, event), fields(event = %event.key()))]
    pub async fn publish_event(&self, mut event: Event) -> Result<Event> {
        event.validate()?;

        if self.registry.list_for_event_type(&event.event_type).await?.is_empty() {
            return Err(TallyError::NotFound(format!(
                "no meter consumes event type {}",
                event.event_type
            )));
        }

        if event.time.is_none() {
            event.time = Some(Utc::now());
        }

        let message = OutboundMessage::new(subject::event_subject(&event), event.to_vec()?)
            .with_msg_id(event.id.clone());
        self.channel.publish(message).await?;

        info!("Event published");
        Ok(event)
    }

    pub async fn get_reading(&self, key: &str) -> Result<Reading> {
        self.readings.get(key).await
    }

    /// Readings whose key matches `pattern` (`>` for all)
    pub async fn list_readings(&self, pattern: &str) -> Result<Vec<Entry<Reading>>> {
        self.readings.list(pattern).await
    }

    pub fn add_meter_to_consume(&self, meter: Meter) -> Result<()> {
        self.consumer.add_meter(meter)
    }

    pub fn remove_meter_from_consume(&self, hash: &str) -> Result<()> {
        self.consumer.remove_meter(hash)
    }
}
