//! Inbound business events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TallyError};
use crate::subject::{is_token, ERRORS_TOKEN};

/// An inbound fact about a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Caller-assigned id, used for broker dedup
    pub id: String,
    /// When the fact happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Event type tag meters are matched on
    pub event_type: String,
    /// Entity the event is about (customer, resource, ...)
    pub subject: String,
    /// Open payload
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            time: None,
            event_type: event_type.into(),
            subject: subject.into(),
            data: Map::new(),
        }
    }

    /// Set a payload field
    pub fn with_data(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(field.into(), value.into());
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// `eventType.subject.id`
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.event_type, self.subject, self.id)
    }

    /// Observation time, falling back to `now` for events without one
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.time.unwrap_or_else(Utc::now)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Validate the event
    pub fn validate(&self) -> Result<()> {
        if self.event_type.is_empty() {
            return Err(TallyError::Validation("eventType is required".into()));
        }
        if !is_token(&self.event_type) || self.event_type == ERRORS_TOKEN {
            return Err(TallyError::Validation(format!(
                "eventType '{}' is not a valid event type",
                self.event_type
            )));
        }
        if self.id.is_empty() {
            return Err(TallyError::Validation("id is required".into()));
        }
        if !is_token(&self.id) {
            return Err(TallyError::Validation(
                "id can only contain alphanumeric characters, dashes and underscores".into(),
            ));
        }
        if self.subject.is_empty() {
            return Err(TallyError::Validation("subject is required".into()));
        }
        if !is_token(&self.subject) {
            return Err(TallyError::Validation(
                "subject can only contain alphanumeric characters, dashes and underscores".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_key() {
        let event = Event::new("e1", "api_call", "cust-1");
        assert_eq!(event.key(), "api_call.cust-1.e1");
    }

    #[test]
    fn test_event_validation() {
        assert!(Event::new("e1", "api_call", "cust-1").validate().is_ok());
        assert!(Event::new("", "api_call", "cust-1").validate().is_err());
        assert!(Event::new("e1", "", "cust-1").validate().is_err());
        assert!(Event::new("e1", "api_call", "").validate().is_err());
    }

    #[test]
    fn test_subject_with_space_rejected() {
        let err = Event::new("e1", "api_call", "cust 1").validate().unwrap_err();
        assert!(matches!(err, TallyError::Validation(_)));
    }

    #[test]
    fn test_event_json_shape() {
        let raw = json!({
            "id": "e1",
            "time": "2024-01-01T00:00:00Z",
            "eventType": "api_call",
            "subject": "cust-1",
            "data": {"bytes": 10}
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert_eq!(event.data.get("bytes"), Some(&json!(10)));
        assert!(event.time.is_some());

        let bytes = event.to_vec().unwrap();
        assert_eq!(Event::from_slice(&bytes).unwrap(), event);
    }
}
