//! Persisted configuration records.
//!
//! Each record is stored as JSON in both tiers: a file under `config/` on
//! the SD card and a blob in NVS. The [`ConfigStore`](crate::store::ConfigStore)
//! resolves which tier wins. Records validate themselves before they are
//! persisted; invalid values are rejected, never clamped.

use serde::{Deserialize, Serialize};

use crate::app::ports::ConfigError;

/// Where a record lives in each storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// Path relative to the SD card root.
    pub path: &'static str,
    /// NVS namespace.
    pub namespace: &'static str,
    /// NVS key.
    pub key: &'static str,
}

pub const TEMP_RECORD: RecordLocation = RecordLocation {
    path: "config/temp.json",
    namespace: "ts_temp",
    key: "config",
};

pub const POWER_POLICY_RECORD: RecordLocation = RecordLocation {
    path: "config/power_policy.json",
    namespace: "power_policy",
    key: "config",
};

pub const CONTROLLER_RECORD: RecordLocation = RecordLocation {
    path: "config/controller.json",
    namespace: "controller",
    key: "config",
};

// ---------------------------------------------------------------------------
// Temperature
// ---------------------------------------------------------------------------

/// Persisted name of the preferred temperature source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredSource {
    /// Default priority walk.
    #[default]
    Auto,
    Variable,
    Agx,
    Local,
    /// Accepted on load for compatibility; treated as `Auto`.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TempConfig {
    pub preferred_source: PreferredSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_variable: Option<String>,
}

/// Maximum bound-variable name length (exclusive).
pub const VARIABLE_NAME_MAX: usize = 32;

impl TempConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.bound_variable {
            if name.is_empty() || name.len() >= VARIABLE_NAME_MAX {
                return Err(ConfigError::ValidationFailed(
                    "bound_variable must be 1-31 characters",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Power policy
// ---------------------------------------------------------------------------

pub const SHUTDOWN_DELAY_RANGE: core::ops::RangeInclusive<u32> = 10..=600;
pub const RECOVERY_HOLD_RANGE: core::ops::RangeInclusive<u32> = 1..=300;
pub const FAN_STOP_DELAY_RANGE: core::ops::RangeInclusive<u32> = 10..=600;

/// Voltage-protection thresholds, delays and feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerPolicyConfig {
    /// Volts; below this the policy leaves NORMAL.
    pub low_voltage_threshold: f32,
    /// Volts; at or above this the policy recovers.
    pub recovery_voltage_threshold: f32,
    pub shutdown_delay_sec: u32,
    pub recovery_hold_sec: u32,
    pub fan_stop_delay_sec: u32,
    /// Start the monitor at boot.
    pub enabled: bool,
    /// Reboot automatically once the recovery hold completes.
    pub auto_recovery: bool,
    pub led_feedback: bool,
    pub device_shutdown: bool,
    pub fan_control: bool,
    pub lpmu_ping_before_shutdown: bool,
    /// Readings at or below this are treated as a failed measurement.
    pub min_valid_voltage: f32,
}

impl Default for PowerPolicyConfig {
    fn default() -> Self {
        Self {
            low_voltage_threshold: 12.6,
            recovery_voltage_threshold: 18.0,
            shutdown_delay_sec: 60,
            recovery_hold_sec: 5,
            fan_stop_delay_sec: 60,
            enabled: true,
            auto_recovery: true,
            led_feedback: true,
            device_shutdown: true,
            fan_control: true,
            lpmu_ping_before_shutdown: true,
            min_valid_voltage: 5.0,
        }
    }
}

impl PowerPolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.low_voltage_threshold.is_finite() || !self.recovery_voltage_threshold.is_finite() {
            return Err(ConfigError::ValidationFailed("voltage thresholds must be finite"));
        }
        if self.low_voltage_threshold <= 0.0 {
            return Err(ConfigError::ValidationFailed("low_voltage_threshold must be positive"));
        }
        if self.low_voltage_threshold >= self.recovery_voltage_threshold {
            return Err(ConfigError::ValidationFailed(
                "low_voltage_threshold must be < recovery_voltage_threshold",
            ));
        }
        if !SHUTDOWN_DELAY_RANGE.contains(&self.shutdown_delay_sec) {
            return Err(ConfigError::ValidationFailed("shutdown_delay_sec must be 10-600"));
        }
        if !RECOVERY_HOLD_RANGE.contains(&self.recovery_hold_sec) {
            return Err(ConfigError::ValidationFailed("recovery_hold_sec must be 1-300"));
        }
        if !FAN_STOP_DELAY_RANGE.contains(&self.fan_stop_delay_sec) {
            return Err(ConfigError::ValidationFailed("fan_stop_delay_sec must be 10-600"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller timing
// ---------------------------------------------------------------------------

/// Task periods and bounded waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub fan_update_interval_ms: u32,
    pub power_monitor_interval_ms: u32,
    /// Timeout passed to `EventBus::post`; 0 never blocks.
    pub event_post_timeout_ms: u32,
    /// How long `stop()` waits for a periodic task to exit.
    pub task_stop_wait_ms: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fan_update_interval_ms: 1000,
            power_monitor_interval_ms: 1000,
            event_post_timeout_ms: 0,
            task_stop_wait_ms: 5000,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=10_000).contains(&self.fan_update_interval_ms) {
            return Err(ConfigError::ValidationFailed("fan_update_interval_ms must be 100-10000"));
        }
        if !(100..=10_000).contains(&self.power_monitor_interval_ms) {
            return Err(ConfigError::ValidationFailed(
                "power_monitor_interval_ms must be 100-10000",
            ));
        }
        if self.event_post_timeout_ms > 1000 {
            return Err(ConfigError::ValidationFailed("event_post_timeout_ms must be 0-1000"));
        }
        if !(100..=60_000).contains(&self.task_stop_wait_ms) {
            return Err(ConfigError::ValidationFailed("task_stop_wait_ms must be 100-60000"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(TempConfig::default().validate().is_ok());
        assert!(PowerPolicyConfig::default().validate().is_ok());
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_power_json_fills_defaults() {
        let cfg: PowerPolicyConfig =
            serde_json::from_str(r#"{"low_voltage_threshold": 11.5}"#).unwrap();
        assert!((cfg.low_voltage_threshold - 11.5).abs() < 1e-6);
        assert!((cfg.recovery_voltage_threshold - 18.0).abs() < 1e-6);
        assert_eq!(cfg.shutdown_delay_sec, 60);
        assert!(cfg.enabled);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let cfg = PowerPolicyConfig {
            low_voltage_threshold: 18.0,
            recovery_voltage_threshold: 12.0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn rejects_delays_out_of_range() {
        for cfg in [
            PowerPolicyConfig { shutdown_delay_sec: 9, ..Default::default() },
            PowerPolicyConfig { shutdown_delay_sec: 601, ..Default::default() },
            PowerPolicyConfig { recovery_hold_sec: 0, ..Default::default() },
            PowerPolicyConfig { fan_stop_delay_sec: 601, ..Default::default() },
        ] {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn temp_config_uses_persisted_names() {
        let cfg = TempConfig {
            preferred_source: PreferredSource::Local,
            bound_variable: Some("rack.inlet".into()),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains(r#""preferred_source":"local""#));
        let back: TempConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn rejects_long_variable_name() {
        let cfg = TempConfig {
            bound_variable: Some("x".repeat(VARIABLE_NAME_MAX)),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
