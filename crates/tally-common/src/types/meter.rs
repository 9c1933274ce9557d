//! Meter definitions
//!
//! A meter maps an event type, an aggregation kind and a value path (plus
//! optional group-by selectors) onto a family of readings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::AggregationKind;
use crate::error::{Result, TallyError};
use crate::subject::{is_token, ERRORS_TOKEN};

/// A user-declared metering rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    /// Caller-assigned identifier
    #[serde(alias = "slug")]
    pub id: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Event type this meter consumes
    pub event_type: String,
    /// Aggregation applied to matched events
    pub aggregation: AggregationKind,
    /// Path selecting the aggregated value from event data
    pub value_property: String,
    /// Group label -> path selecting the group value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group_by: BTreeMap<String, String>,
}

impl Meter {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        aggregation: AggregationKind,
        value_property: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            event_type: event_type.into(),
            aggregation,
            value_property: value_property.into(),
            group_by: BTreeMap::new(),
        }
    }

    /// Add a group-by selector
    pub fn with_group(mut self, label: impl Into<String>, path: impl Into<String>) -> Self {
        self.group_by.insert(label.into(), path.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Registry key, also the prefix of every reading key: `eventType.aggregation.id`
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.event_type, self.aggregation, self.id)
    }

    /// Stable identity used for subscription tracking and durable consumer names
    pub fn hash(&self) -> String {
        Self::hash_key(&self.key())
    }

    /// Hash of an already-derived meter key
    pub fn hash_key(key: &str) -> String {
        blake3::hash(key.as_bytes()).to_hex().to_string()
    }

    /// Validate the meter
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TallyError::Validation("id is required".into()));
        }
        if !is_token(&self.id) {
            return Err(TallyError::Validation(
                "id can only contain alphanumeric characters, dashes and underscores".into(),
            ));
        }
        if self.event_type.is_empty() {
            return Err(TallyError::Validation("eventType is required".into()));
        }
        if !is_token(&self.event_type) {
            return Err(TallyError::Validation(
                "eventType can only contain alphanumeric characters, dashes and underscores".into(),
            ));
        }
        if self.event_type == ERRORS_TOKEN {
            return Err(TallyError::Validation(format!(
                "eventType '{}' is reserved",
                ERRORS_TOKEN
            )));
        }
        if self.value_property.is_empty() {
            return Err(TallyError::Validation("valueProperty is required".into()));
        }
        for (label, path) in &self.group_by {
            if !is_token(label) {
                return Err(TallyError::Validation(format!(
                    "groupBy label '{}' can only contain alphanumeric characters, dashes and underscores",
                    label
                )));
            }
            if path.is_empty() {
                return Err(TallyError::Validation(format!(
                    "groupBy path for '{}' is required",
                    label
                )));
            }
        }
        Ok(())
    }
}
