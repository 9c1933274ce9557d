//! # Tally Store
//!
//! Key-value persistence for the Tally metering engine.
//!
//! ## Components
//!
//! - **kv**: backend trait, JetStream and in-memory backends, typed envelope repo
//! - **MeterRegistry**: meter definitions keyed by `eventType.aggregation.id`
//! - **ReadingStore**: aggregate readings with compare-and-set updates

pub mod kv;
pub mod meters;
pub mod readings;

pub use kv::{Entry, Envelope, KvBackend, MemoryKvBackend, NatsKvBackend, Repo, Versioned};
pub use meters::MeterRegistry;
pub use readings::ReadingStore;
