//! Tally Messaging - durable event channel
//!
//! The [`MessageChannel`] trait abstracts the broker: publish with an
//! optional dedup id, and subscribe through named durable cursors with a
//! subject filter. [`JetStreamChannel`] is the production implementation;
//! [`MemoryChannel`] backs tests and local runs.

pub mod channel;
pub mod jetstream;
pub mod memory;

pub use channel::{
    Acker, Delivery, MessageChannel, OutboundMessage, StartPosition, Subscription, SubscriptionSpec,
};
pub use jetstream::{JetStreamChannel, JetStreamConfig};
pub use memory::{MemoryChannel, StoredMessage};
