use std::fs;
use std::time::Duration;

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::withdrawal::guards::LimitTier;
use crate::withdrawal::monitor::MonitorConfig;
use crate::withdrawal::reconciliation::ReconciliationConfig;
use crate::withdrawal::worker::WorkerConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub saga: SagaConfig,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Tiered withdrawal limits; first tier is the default
    #[serde(default = "LimitTier::default_tiers")]
    pub limit_tiers: Vec<LimitTier>,
    /// Broker ledger API (mock ledger when absent)
    #[serde(default)]
    pub ledger: Option<EndpointConfig>,
    /// Off-ramp provider API (mock provider when absent)
    #[serde(default)]
    pub offramp: Option<EndpointConfig>,
    /// PostgreSQL withdrawal store (in-memory store when absent)
    #[serde(default)]
    pub postgres_url: Option<String>,
}

/// Saga-wide settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SagaConfig {
    /// Ledger account that holds funds between debit and payout
    pub system_account_id: String,
    /// Withdrawals at or above this amount raise a balance-change alert
    pub large_withdrawal_threshold: Decimal,
    /// Reverse the debit when the provider reports "failed" after initiation
    pub compensate_provider_failures: bool,
    /// In-process queue capacity
    pub queue_capacity: usize,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            system_account_id: "SYSTEM-OFFRAMP".to_string(),
            large_withdrawal_threshold: Decimal::new(10_000, 0),
            compensate_provider_failures: false,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BreakersConfig {
    pub ledger: CircuitBreakerConfig,
    pub offramp: CircuitBreakerConfig,
}

/// HTTP endpoint of an external provider
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            api_secret: None,
            timeout_ms: 10_000,
        }
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: offramp.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.saga.system_account_id, "SYSTEM-OFFRAMP");
        assert!(!config.saga.compensate_provider_failures);
        assert_eq!(config.monitor.poll_interval_secs, 10);
        assert_eq!(config.monitor.max_attempts, 30);
        assert_eq!(config.reconciliation.sla_threshold_secs, 900);
        assert!(!config.limit_tiers.is_empty());
        assert!(config.ledger.is_none());
        assert!(config.postgres_url.is_none());
    }

    #[test]
    fn test_breaker_section_parses_seconds() {
        let yaml = format!(
            "{}\nbreakers:\n  ledger:\n    max_requests: 1\n    interval: 120\n    timeout: 15\n    failure_threshold: 4\n    success_threshold: 1\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.breakers.ledger.interval, Duration::from_secs(120));
        assert_eq!(config.breakers.ledger.timeout, Duration::from_secs(15));
        assert_eq!(config.breakers.ledger.failure_threshold, 4);
        // Untouched dependency keeps defaults
        assert_eq!(config.breakers.offramp.failure_threshold, 5);
    }

    #[test]
    fn test_endpoint_section() {
        let yaml = format!(
            "{}\nledger:\n  base_url: https://broker.example\n  api_key: k\n  api_secret: s\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        let ledger = config.ledger.unwrap();
        assert_eq!(ledger.base_url, "https://broker.example");
        assert_eq!(ledger.api_secret.as_deref(), Some("s"));
        assert_eq!(ledger.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_required_field_fails() {
        assert!(AppConfig::from_yaml("log_level: info\n").is_err());
    }
}
