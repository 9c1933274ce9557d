//! Aggregate readings
//!
//! One reading exists per (meter, subject, optional group segment). Keys are
//! derived deterministically:
//!
//! ```text
//! base:    <meter key>.<subject>
//! grouped: <meter key>.<subject>.<group label>.<hash(group value)>
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{AggregationKind, Meter};

/// Running time-weighted total for `duration` meters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationData {
    /// Accumulated unit-hours
    pub total: f64,
    /// Rate in effect since `last_calculated`
    pub unit: f64,
    pub last_calculated: DateTime<Utc>,
}

/// Current aggregate state for one reading key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Source event type
    pub event: String,
    pub meter_id: String,
    pub subject: String,
    /// Group label, empty for the base reading
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub segment: String,
    /// Raw group value behind the hashed key segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_value: Option<String>,
    /// Aggregation kind, fixed at creation
    #[serde(rename = "type")]
    pub kind: AggregationKind,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub sum: f64,
    #[serde(default)]
    pub avg: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub min: f64,
    /// Distinct value -> occurrences
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unique: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_data: Option<DurationData>,
}

/// Where a reading sits within its meter's family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Base,
    Group { label: String, value: String },
}

impl Segment {
    pub fn group(label: impl Into<String>, value: impl Into<String>) -> Self {
        Segment::Group {
            label: label.into(),
            value: value.into(),
        }
    }
}

impl Reading {
    /// Empty reading for a meter/subject/segment, before any sample is folded in
    pub fn empty(meter: &Meter, subject: &str, segment: &Segment) -> Self {
        let (label, group_value) = match segment {
            Segment::Base => (String::new(), None),
            Segment::Group { label, value } => (label.clone(), Some(value.clone())),
        };

        Self {
            event: meter.event_type.clone(),
            meter_id: meter.id.clone(),
            subject: subject.to_string(),
            segment: label,
            group_value,
            kind: meter.aggregation,
            count: 0,
            sum: 0.0,
            avg: 0.0,
            max: 0.0,
            min: 0.0,
            unique: BTreeMap::new(),
            duration_data: None,
        }
    }

    /// Derive the storage key of a reading
    pub fn key(meter: &Meter, subject: &str, segment: &Segment) -> String {
        match segment {
            Segment::Base => format!("{}.{}", meter.key(), subject),
            Segment::Group { label, value } => format!(
                "{}.{}.{}.{}",
                meter.key(),
                subject,
                label,
                segment_digest(value)
            ),
        }
    }

    /// Number of distinct values seen by a `unique` reading
    pub fn distinct(&self) -> usize {
        self.unique.len()
    }
}

/// Content digest of a group value, bounded in size whatever the raw value
pub fn segment_digest(value: &str) -> String {
    let hash = blake3::hash(value.as_bytes());
    hash.to_hex()[..32].to_string()
}
