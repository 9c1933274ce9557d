//! # Tally Engine
//!
//! Turns published events into continuously updated readings.
//!
//! ## Components
//!
//! - **extract**: path-addressed value extraction from event payloads
//! - **aggregation**: seed/fold for every aggregation kind
//! - **Aggregator**: applies a (meter, event) pair to the reading store
//! - **Orchestrator**: keeps one durable subscription per consumed meter
//! - **MeteringService**: the operations exposed to the HTTP boundary

pub mod aggregation;
pub mod aggregator;
pub mod extract;
pub mod orchestrator;
pub mod service;

pub use aggregation::Sample;
pub use aggregator::{Aggregator, ApplyReport};
pub use extract::ValuePath;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use service::MeteringService;

use std::sync::Arc;
use tally_common::Result;
use tally_messaging::MessageChannel;
use tally_store::{MeterRegistry, ReadingStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Wire the aggregator and orchestrator over the given stores and channel,
/// start consuming, and return the service facade.
pub async fn start(
    registry: MeterRegistry,
    readings: ReadingStore,
    channel: Arc<dyn MessageChannel>,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
) -> Result<(MeteringService, JoinHandle<()>)> {
    let aggregator = Arc::new(Aggregator::new(readings.clone(), channel.clone()));
    let orchestrator = Orchestrator::new(registry.clone(), aggregator, channel.clone(), config);
    let (handle, task) = orchestrator.start(shutdown).await?;

    Ok((MeteringService::new(registry, readings, channel, handle), task))
}
