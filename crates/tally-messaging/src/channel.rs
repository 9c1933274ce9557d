//! Message channel contract
//!
//! A channel publishes payloads under subjects (optionally with a dedup id)
//! and hands out durable, filtered subscriptions. A durable subscription is
//! identified by name; subscribing again under the same name resumes from
//! where the previous subscription left off.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tally_common::Result;

/// A message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Broker-level dedup id
    pub msg_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            msg_id: None,
        }
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }
}

/// Where a newly created durable starts reading.
///
/// Only consulted when the durable does not exist yet; an existing durable
/// always resumes from its own cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Everything the log still retains
    #[default]
    All,
    /// Only messages published after the durable is created
    New,
}

/// Parameters of a durable subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    /// Durable name, stable across restarts
    pub name: String,
    /// Subject filter, wildcards allowed
    pub filter_subject: String,
    pub description: Option<String>,
    pub start: StartPosition,
}

impl SubscriptionSpec {
    pub fn new(name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_subject: filter_subject.into(),
            description: None,
            start: StartPosition::All,
        }
    }

    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Acknowledges one delivered message
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// A message delivered by a subscription
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            payload,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledge the message; a no-op for channels that ack on delivery
    pub async fn ack(self) -> Result<()> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries for one durable subscription
pub type Subscription = BoxStream<'static, Result<Delivery>>;

/// Publish/subscribe primitive over a replayable event log
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Create (or resume) a durable subscription
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Subscription>;

    /// Remove a durable subscription and its broker-side cursor
    async fn delete_subscription(&self, name: &str) -> Result<()>;
}
