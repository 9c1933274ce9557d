//! NATS JetStream channel
//!
//! Events live in a single stream capturing `events.>`. Each subscription is
//! an explicit-ack durable pull consumer, so a restarted process resumes the
//! same broker-side cursor.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    context::Publish,
};
use async_trait::async_trait;
use futures::StreamExt;
use tally_common::{subject::EVENTS_PREFIX, Result, TallyError};
use tracing::{debug, info, instrument};

use crate::channel::{
    Acker, Delivery, MessageChannel, OutboundMessage, StartPosition, Subscription, SubscriptionSpec,
};

/// JetStream channel configuration
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    /// Stream holding all events
    pub stream: String,
    /// Subjects captured by the stream
    pub subjects: Vec<String>,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            stream: "meters".to_string(),
            subjects: vec![format!("{}.>", EVENTS_PREFIX)],
        }
    }
}

/// Channel backed by a JetStream stream
#[derive(Clone)]
pub struct JetStreamChannel {
    client: async_nats::Client,
    context: jetstream::Context,
    stream: String,
}

fn messaging_err(err: impl std::fmt::Display) -> TallyError {
    TallyError::Messaging(err.to_string())
}

impl JetStreamChannel {
    /// Connect to NATS and make sure the event stream exists
    pub async fn connect(url: &str, config: JetStreamConfig) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TallyError::Config(format!("Failed to connect to NATS at {}: {}", url, e)))?;
        info!(url, "Connected to NATS");
        Self::new(client, config).await
    }

    #[instrument(skip(client))]
    pub async fn new(client: async_nats::Client, config: JetStreamConfig) -> Result<Self> {
        let context = jetstream::new(client.clone());
        context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: config.subjects.clone(),
                ..Default::default()
            })
            .await
            .map_err(messaging_err)?;

        debug!(stream = %config.stream, "Event stream ready");

        Ok(Self {
            client,
            context,
            stream: config.stream,
        })
    }

    /// Underlying connection, shared with the KV buckets
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|e| TallyError::Messaging(format!("ack failed: {}", e)))
    }
}

#[async_trait]
impl MessageChannel for JetStreamChannel {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let mut publish = Publish::build().payload(message.payload);
        if let Some(id) = &message.msg_id {
            publish = publish.message_id(id);
        }

        let ack = self
            .context
            .send_publish(message.subject.clone(), publish)
            .await
            .map_err(|e| TallyError::Publish(e.to_string()))?;
        ack.await.map_err(|e| TallyError::Publish(e.to_string()))?;

        debug!(subject = %message.subject, "Published message");
        Ok(())
    }

    #[instrument(skip(self), fields(name = %spec.name))]
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Subscription> {
        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(messaging_err)?;

        let deliver_policy = match spec.start {
            StartPosition::All => DeliverPolicy::All,
            StartPosition::New => DeliverPolicy::New,
        };

        // An existing durable is returned as is, keeping its cursor
        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &spec.name,
                pull::Config {
                    durable_name: Some(spec.name.clone()),
                    description: spec.description.clone(),
                    filter_subject: spec.filter_subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy,
                    ..Default::default()
                },
            )
            .await
            .map_err(messaging_err)?;

        let messages = consumer.messages().await.map_err(messaging_err)?;
        info!(filter = %spec.filter_subject, start = ?spec.start, "Consumer attached");

        Ok(messages
            .map(|item| match item {
                Ok(message) => {
                    let delivery = Delivery::new(message.subject.to_string(), message.payload.clone());
                    Ok(delivery.with_acker(Box::new(JetStreamAcker(message))))
                }
                Err(e) => Err(messaging_err(e)),
            })
            .boxed())
    }

    #[instrument(skip(self))]
    async fn delete_subscription(&self, name: &str) -> Result<()> {
        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(messaging_err)?;
        stream.delete_consumer(name).await.map_err(messaging_err)?;
        info!("Deleted durable consumer");
        Ok(())
    }
}
