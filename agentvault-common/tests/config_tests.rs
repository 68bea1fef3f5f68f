use agentvault_common::config::{ensure_config_exists, Config, TierConfig};
use agentvault_common::logging::{self, LogConfig};
use agentvault_common::types::{CoinNetwork, FeeSpeed};
use rust_decimal_macros::dec;
use std::fs;
use std::sync::Once;
use tempfile::tempdir;

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| {
        let _ = logging::init(&LogConfig::quiet());
    });
}

#[test]
fn test_defaults_are_valid() {
    setup();
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.wallet.network, CoinNetwork::Dogecoin);
    assert_eq!(config.policy.tiers.len(), 5);
    assert_eq!(config.policy.daily_limit, dec!(5000));
    assert_eq!(config.tracking.required_confirmations, 6);
}

#[test]
fn test_partial_file_fills_defaults() {
    setup();
    let dir = tempdir().unwrap();
    let path = dir.path().join("agentvault.toml");
    fs::write(
        &path,
        r#"
[wallet]
network = "dogecoin-testnet"
owner_id = "alice"

[fees]
speed = "high"
max_fee = 2.5

[policy]
daily_limit = 250
allowlist = ["nXyZ"]
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.wallet.network, CoinNetwork::DogecoinTestnet);
    assert_eq!(config.wallet.owner_id, "alice");
    assert_eq!(config.fees.speed, FeeSpeed::High);
    assert_eq!(config.fees.max_fee, dec!(2.5));
    assert_eq!(config.policy.daily_limit, dec!(250));
    assert_eq!(config.policy.hourly_limit, dec!(1000));
    assert_eq!(config.policy.allowlist, vec!["nXyZ".to_string()]);
    assert_eq!(config.gateway.providers.len(), 1);
}

#[test]
fn test_unordered_tiers_are_rejected() {
    setup();
    let mut config = Config::default();
    config.policy.tiers = vec![
        TierConfig {
            name: "big".into(),
            max_amount: dec!(100),
            action: "approve".into(),
            delay_secs: None,
        },
        TierConfig {
            name: "small".into(),
            max_amount: dec!(10),
            action: "auto".into(),
            delay_secs: None,
        },
    ];
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_action_is_rejected() {
    setup();
    let mut config = Config::default();
    config.policy.tiers[0].action = "yolo".into();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("yolo"));
}

#[test]
fn test_empty_owner_is_rejected() {
    setup();
    let mut config = Config::default();
    config.wallet.owner_id = "  ".into();
    assert!(config.validate().is_err());
}

#[test]
fn test_ensure_config_exists_round_trips() {
    setup();
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("agentvault.toml");
    ensure_config_exists(&path).unwrap();
    assert!(path.exists());

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.policy.tiers, Config::default().policy.tiers);

    // An existing file is never overwritten
    fs::write(&path, "[wallet]\nowner_id = \"bob\"\n").unwrap();
    ensure_config_exists(&path).unwrap();
    assert_eq!(Config::load(&path).unwrap().wallet.owner_id, "bob");
}
