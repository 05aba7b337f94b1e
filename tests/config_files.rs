use std::time::Duration;

use offramp_saga::AppConfig;
use rust_decimal::Decimal;

#[test]
fn dev_config_loads() {
    let config = AppConfig::load("dev").unwrap();
    assert_eq!(config.saga.system_account_id, "SYSTEM-OFFRAMP");
    assert_eq!(config.saga.large_withdrawal_threshold, Decimal::new(10_000, 0));
    assert_eq!(config.breakers.ledger.timeout, Duration::from_secs(30));
    assert_eq!(config.limit_tiers.len(), 2);
    assert!(config.ledger.is_none());
    assert!(config.postgres_url.is_none());
}

#[test]
fn prod_config_loads() {
    let config = AppConfig::load("prod").unwrap();
    assert!(config.use_json);
    assert!(!config.limit_tiers.is_empty());
}

#[test]
fn unknown_env_is_an_error() {
    assert!(AppConfig::load("does-not-exist").is_err());
}
