//! Fuzz target: power policy config file
//!
//! Parses arbitrary bytes as `config/power_policy.json` the way the
//! config store does, and checks that anything `validate()` accepts has
//! ordered, positive thresholds and in-range delays.
//!
//! cargo fuzz run fuzz_policy_config

#![no_main]

use libfuzzer_sys::fuzz_target;
use rackctl::config::{
    FAN_STOP_DELAY_RANGE, PowerPolicyConfig, RECOVERY_HOLD_RANGE, SHUTDOWN_DELAY_RANGE,
};

fuzz_target!(|data: &[u8]| {
    let Ok(cfg) = serde_json::from_slice::<PowerPolicyConfig>(data) else {
        return;
    };
    if cfg.validate().is_err() {
        return;
    }
    assert!(cfg.low_voltage_threshold > 0.0);
    assert!(cfg.low_voltage_threshold < cfg.recovery_voltage_threshold);
    assert!(SHUTDOWN_DELAY_RANGE.contains(&cfg.shutdown_delay_sec));
    assert!(RECOVERY_HOLD_RANGE.contains(&cfg.recovery_hold_sec));
    assert!(FAN_STOP_DELAY_RANGE.contains(&cfg.fan_stop_delay_sec));
});
