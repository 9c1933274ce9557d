//! # Tally Common
//!
//! Shared entities, errors, and subject helpers for the Tally usage-metering
//! engine.
//!
//! ## Core Types
//!
//! - [`Meter`]: a metering rule (event type + aggregation + value path + group-by)
//! - [`Event`]: an inbound fact about a subject
//! - [`Reading`]: the current aggregate for one meter × subject × segment
//! - [`AggregationKind`]: the closed set of aggregation functions
//!
//! ## Subjects
//!
//! - [`subject`]: broker subject layout and NATS-style wildcard matching

pub mod error;
pub mod subject;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ExtractionError, Result, StoreError, TallyError};
pub use types::{
    aggregation::{AggregationKind, SampleType},
    event::Event,
    meter::Meter,
    reading::{DurationData, Reading, Segment},
};

/// Tally version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default interval between orchestrator reconciliation passes (ms)
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5000;

/// Default number of compare-and-set attempts per reading update
pub const DEFAULT_MAX_UPDATE_ATTEMPTS: usize = 16;
