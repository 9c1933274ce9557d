//! Key-value persistence
//!
//! - [`KvBackend`]: raw byte storage with per-key revisions
//! - [`NatsKvBackend`]: JetStream KV bucket
//! - [`MemoryKvBackend`]: DashMap-backed stand-in for tests and local runs
//! - [`Repo`]: typed, envelope-wrapped access with lazy expiry

pub mod backend;
pub mod envelope;
pub mod memory;
pub mod nats;
pub mod repo;

pub use backend::{KvBackend, RawEntry};
pub use envelope::Envelope;
pub use memory::MemoryKvBackend;
pub use nats::NatsKvBackend;
pub use repo::{Entry, Repo, Versioned};
