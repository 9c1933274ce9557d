//! Tally server configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_common::{DEFAULT_MAX_UPDATE_ATTEMPTS, DEFAULT_RECONCILE_INTERVAL_MS};
use tally_engine::OrchestratorConfig;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// NATS server URL
    pub nats_url: String,
    /// JetStream stream holding all events
    pub stream: String,
    /// KV bucket for meter definitions
    pub meters_bucket: String,
    /// KV bucket for readings
    pub readings_bucket: String,
    /// Emit logs as JSON
    pub log_json: bool,
    pub http: HttpSettings,
    pub consumer: ConsumerSettings,
    pub readings: ReadingSettings,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            stream: "meters".to_string(),
            meters_bucket: "meters".to_string(),
            readings_bucket: "readings".to_string(),
            log_json: false,
            http: HttpSettings::default(),
            consumer: ConsumerSettings::default(),
            readings: ReadingSettings::default(),
        }
    }
}

impl TallyConfig {
    /// Load configuration: defaults, then `tally.toml`, then `TALLY_*`
    /// environment variables (`__` separates nested keys). `PORT` wins over
    /// everything for the HTTP port.
    pub fn load() -> Result<Self> {
        // Try to load .env file
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("tally").required(false))
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Self = settings.try_deserialize()?;

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse::<u16>() {
                cfg.http.port = p;
            }
        }

        Ok(cfg)
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Event consumption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Interval between reconciliation passes (ms)
    pub reconcile_interval_ms: u64,
    /// Delete a meter's durable consumer when it stops being consumed
    pub delete_durable_on_deactivate: bool,
    /// Wait between subscription attempts (ms)
    pub resubscribe_backoff_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
            delete_durable_on_deactivate: true,
            resubscribe_backoff_ms: 1000,
        }
    }
}

impl ConsumerSettings {
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            reconcile_interval: Duration::from_millis(self.reconcile_interval_ms.max(1)),
            delete_durable_on_deactivate: self.delete_durable_on_deactivate,
            resubscribe_backoff: Duration::from_millis(self.resubscribe_backoff_ms),
        }
    }
}

/// Reading store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingSettings {
    /// Compare-and-set attempts per reading update
    pub max_update_attempts: usize,
}

impl Default for ReadingSettings {
    fn default() -> Self {
        Self {
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TallyConfig::default();
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.stream, "meters");

        let orchestrator = cfg.consumer.orchestrator();
        assert_eq!(orchestrator.reconcile_interval, Duration::from_secs(5));
        assert!(orchestrator.delete_durable_on_deactivate);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let cfg: TallyConfig = serde_json::from_str(
            r#"{"nats_url":"nats://bus:4222","consumer":{"reconcile_interval_ms":250}}"#,
        )
        .unwrap();
        assert_eq!(cfg.nats_url, "nats://bus:4222");
        assert_eq!(cfg.consumer.reconcile_interval_ms, 250);
        assert!(cfg.consumer.delete_durable_on_deactivate);
        assert_eq!(cfg.readings.max_update_attempts, DEFAULT_MAX_UPDATE_ATTEMPTS);
        assert_eq!(cfg.http.host, "0.0.0.0");
    }
}
