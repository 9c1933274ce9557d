//! Aggregation engine
//!
//! Applies one matched (meter, event) pair: the base reading is always
//! updated, then one grouped reading per `groupBy` label whose selector
//! resolves. Grouped readings aggregate the meter's `valueProperty`; the
//! label's own path only selects which segment the event falls into.
//!
//! Any failed reading update causes the original event to be republished on
//! the dead-letter subject. That publish is best effort.

use bytes::Bytes;
use std::sync::Arc;
use tally_common::{subject, Event, Meter, Reading, Result, Segment};
use tally_messaging::{MessageChannel, OutboundMessage};
use tally_store::ReadingStore;
use tracing::{debug, error, instrument, warn};

use crate::aggregation::{accumulate, Sample};
use crate::extract::extract_text;

/// Outcome of applying one event to one meter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Reading keys written
    pub updated: Vec<String>,
    /// Group labels whose selector did not resolve
    pub skipped_groups: Vec<String>,
    /// Reading keys whose update failed
    pub failed: Vec<String>,
    /// Whether the event reached the dead-letter subject
    pub dead_lettered: bool,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Aggregator {
    readings: ReadingStore,
    channel: Arc<dyn MessageChannel>,
}

impl Aggregator {
    pub fn new(readings: ReadingStore, channel: Arc<dyn MessageChannel>) -> Self {
        Self { readings, channel }
    }

    /// Apply a delivered payload. Fails only when the payload is not an event.
    pub async fn apply_raw(&self, meter: &Meter, payload: Bytes) -> Result<ApplyReport> {
        let event = Event::from_slice(&payload)?;
        Ok(self.process(meter, &event, Some(payload)).await)
    }

    /// Apply an event whose type matches the meter's
    pub async fn apply(&self, meter: &Meter, event: &Event) -> ApplyReport {
        self.process(meter, event, None).await
    }

    /// Whether the meter has written any reading yet
    pub async fn has_readings(&self, meter: &Meter) -> Result<bool> {
        self.readings
            .any_matching(&format!("{}.{}", meter.key(), subject::MATCH_ALL))
            .await
    }

    #[instrument(skip_all, fields(meter = %meter.key(), event = %event.key()))]
    async fn process(&self, meter: &Meter, event: &Event, raw: Option<Bytes>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let at = event.observed_at();

        let mut segments = vec![Segment::Base];
        for (label, path) in &meter.group_by {
            match extract_text(&event.data, path) {
                Ok(value) => segments.push(Segment::group(label, value)),
                Err(e) => {
                    warn!(label = %label, error = %e, "Group value not found, skipping group");
                    report.skipped_groups.push(label.clone());
                }
            }
        }

        let sample = Sample::from_event(meter, event);

        for segment in &segments {
            let key = Reading::key(meter, &event.subject, segment);
            let sample = match &sample {
                Ok(sample) => sample,
                Err(e) => {
                    error!(reading = %key, error = %e, "Failed to extract value");
                    report.failed.push(key);
                    continue;
                }
            };

            let outcome = self
                .readings
                .apply(&key, |current| {
                    accumulate(current, meter, &event.subject, segment, sample, at)
                })
                .await;

            match outcome {
                Ok(reading) => {
                    debug!(reading = %key, count = reading.count, "Reading updated");
                    report.updated.push(key);
                }
                Err(e) => {
                    error!(reading = %key, error = %e, "Failed to update reading");
                    report.failed.push(key);
                }
            }
        }

        if !report.is_clean() {
            report.dead_lettered = self.dead_letter(event, raw).await;
        }

        report
    }

    async fn dead_letter(&self, event: &Event, raw: Option<Bytes>) -> bool {
        let payload = match raw {
            Some(bytes) => bytes,
            None => match event.to_vec() {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    error!(error = %e, "Failed to encode event for dead-lettering");
                    return false;
                }
            },
        };

        let dead_subject = subject::dead_letter_subject(event);
        let message = OutboundMessage::new(dead_subject.clone(), payload)
            .with_msg_id(format!("{}-{}", subject::ERRORS_TOKEN, event.id));

        match self.channel.publish(message).await {
            Ok(()) => {
                warn!(subject = %dead_subject, "Event dead-lettered");
                true
            }
            Err(e) => {
                error!(subject = %dead_subject, error = %e, "Failed to dead-letter event");
                false
            }
        }
    }
}
