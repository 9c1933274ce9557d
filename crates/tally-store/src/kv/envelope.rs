//! Persisted value envelope
//!
//! Every stored value is wrapped as `{data, expiresAt}`. An absent
//! `expiresAt` means the entry never expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_common::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    /// Envelope expiring `ttl` from now
    pub fn expiring(data: T, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Serialization(format!("invalid ttl: {}", e)))?;
        Ok(Self {
            data,
            expires_at: Some(Utc::now() + ttl),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now > at,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_expires_without_deadline() {
        let env = Envelope::new(1u32);
        assert!(!env.is_expired());
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("expiresAt").is_none());
        assert_eq!(json["data"], 1);
    }

    #[test]
    fn test_expiry_deadline() {
        let env = Envelope::expiring("v", Duration::from_secs(60)).unwrap();
        let deadline = env.expires_at.unwrap();
        assert!(!env.is_expired());
        assert!(env.is_expired_at(deadline + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_missing_expiry_deserializes() {
        let env: Envelope<String> = serde_json::from_str(r#"{"data":"x"}"#).unwrap();
        assert_eq!(env.expires_at, None);
    }
}
