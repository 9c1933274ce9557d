//! Core metering entities

pub mod aggregation;
pub mod event;
pub mod meter;
pub mod reading;

pub use aggregation::{AggregationKind, SampleType};
pub use event::Event;
pub use meter::Meter;
pub use reading::{segment_digest, DurationData, Reading, Segment};
