//! `power.*` endpoints (voltage protection).

use std::sync::Arc;

use serde_json::{Value, json};

use crate::api::auth::perm;
use crate::api::{Category, Endpoint, ParamSpec};
use crate::config::{
    FAN_STOP_DELAY_RANGE, PowerPolicyConfig, RECOVERY_HOLD_RANGE, SHUTDOWN_DELAY_RANGE,
};
use crate::power::{PolicyStatus, PowerPolicy};

use super::Services;

const SET_PARAMS: &[ParamSpec] = &[
    ParamSpec::float("low_threshold", 0.0, 60.0),
    ParamSpec::float("recovery_threshold", 0.0, 60.0),
    ParamSpec::int(
        "shutdown_delay",
        *SHUTDOWN_DELAY_RANGE.start() as i64,
        *SHUTDOWN_DELAY_RANGE.end() as i64,
    )
    .range_msg("shutdown_delay must be 10-600"),
    ParamSpec::int(
        "recovery_hold",
        *RECOVERY_HOLD_RANGE.start() as i64,
        *RECOVERY_HOLD_RANGE.end() as i64,
    )
    .range_msg("recovery_hold must be 1-300"),
    ParamSpec::int(
        "fan_stop_delay",
        *FAN_STOP_DELAY_RANGE.start() as i64,
        *FAN_STOP_DELAY_RANGE.end() as i64,
    )
    .range_msg("fan_stop_delay must be 10-600"),
    ParamSpec::bool("enable"),
    ParamSpec::bool("persist"),
];

const DEBUG_PARAMS: &[ParamSpec] = &[
    ParamSpec::bool("enable").required(),
    ParamSpec::int("duration", 0, 3600),
];

pub fn status_json(s: &PolicyStatus) -> Value {
    json!({
        "running": s.running,
        "state": s.state.name(),
        "current_voltage_v": s.voltage,
        "countdown_remaining_sec": s.countdown_sec,
        "recovery_timer_sec": s.recovery_timer,
        "fan_stop_timer_sec": s.fan_stop_timer,
        "fans_stopped": s.fans_stopped,
        "protection_count": s.protection_count,
        "uptime_ms": s.uptime_ms,
        "devices": {
            "agx_powered": s.agx_powered,
            "lpmu_powered": s.lpmu_powered,
        },
    })
}

fn config_json(c: &PowerPolicyConfig) -> Value {
    let d = PowerPolicyConfig::default();
    json!({
        "low_voltage_threshold": c.low_voltage_threshold,
        "recovery_voltage_threshold": c.recovery_voltage_threshold,
        "shutdown_delay_sec": c.shutdown_delay_sec,
        "recovery_hold_sec": c.recovery_hold_sec,
        "fan_stop_delay_sec": c.fan_stop_delay_sec,
        "enabled": c.enabled,
        "auto_recovery": c.auto_recovery,
        "device_shutdown": c.device_shutdown,
        "fan_control": c.fan_control,
        "lpmu_ping_before_shutdown": c.lpmu_ping_before_shutdown,
        "defaults": {
            "low_voltage_threshold": d.low_voltage_threshold,
            "recovery_voltage_threshold": d.recovery_voltage_threshold,
            "shutdown_delay_sec": d.shutdown_delay_sec,
            "recovery_hold_sec": d.recovery_hold_sec,
            "fan_stop_delay_sec": d.fan_stop_delay_sec,
        },
    })
}

/// Apply the fields present in `p`. Earlier changes stay applied when a
/// later one fails.
fn apply_set(policy: &PowerPolicy, p: &crate::api::Params<'_>) -> crate::error::Result<bool> {
    let cfg = policy.config();
    if p.has("low_threshold") || p.has("recovery_threshold") {
        let low = p.f64("low_threshold").map_or(cfg.low_voltage_threshold, |v| v as f32);
        let rec = p
            .f64("recovery_threshold")
            .map_or(cfg.recovery_voltage_threshold, |v| v as f32);
        policy.set_thresholds(low, rec)?;
    }
    if let Some(s) = p.i64("shutdown_delay") {
        policy.set_shutdown_delay(s as u32)?;
    }
    if let Some(s) = p.i64("recovery_hold") {
        policy.set_recovery_hold(s as u32)?;
    }
    if let Some(s) = p.i64("fan_stop_delay") {
        policy.set_fan_stop_delay(s as u32)?;
    }
    let persist = if let Some(enable) = p.bool("enable") {
        policy.set_enabled(enable);
        true
    } else {
        p.bool("persist").unwrap_or(false)
    };
    if persist {
        policy.save_config()?;
    }
    Ok(persist)
}

pub fn endpoints(svc: &Services) -> Vec<Endpoint> {
    vec![
        status(svc.policy.clone()),
        config(svc.policy.clone()),
        set(svc.policy.clone()),
        trigger_test(svc.policy.clone()),
        debug_mode(svc.policy.clone()),
    ]
}

fn status(policy: Arc<PowerPolicy>) -> Endpoint {
    Endpoint::new(
        "power.protection.status",
        "Get voltage protection status",
        Category::Power,
        move |_, res| {
            res.ok(status_json(&policy.status()));
            Ok(())
        },
    )
}

fn config(policy: Arc<PowerPolicy>) -> Endpoint {
    Endpoint::new(
        "power.protection.config",
        "Get voltage protection configuration",
        Category::Power,
        move |_, res| {
            res.ok(config_json(&policy.config()));
            Ok(())
        },
    )
}

fn set(policy: Arc<PowerPolicy>) -> Endpoint {
    Endpoint::new(
        "power.protection.set",
        "Configure voltage protection",
        Category::Power,
        move |p, res| {
            let persisted = apply_set(&policy, p)?;
            let c = policy.config();
            res.ok(json!({
                "low_threshold_v": c.low_voltage_threshold,
                "recovery_threshold_v": c.recovery_voltage_threshold,
                "shutdown_delay_sec": c.shutdown_delay_sec,
                "recovery_hold_sec": c.recovery_hold_sec,
                "fan_stop_delay_sec": c.fan_stop_delay_sec,
                "running": policy.is_running(),
                "persisted": persisted,
            }));
            Ok(())
        },
    )
    .params(SET_PARAMS)
    .permission(perm::POWER_CONTROL)
}

fn trigger_test(policy: Arc<PowerPolicy>) -> Endpoint {
    Endpoint::new(
        "power.protection.test",
        "Simulate a low-voltage event",
        Category::Power,
        move |_, res| {
            policy.trigger_test()?;
            let c = policy.config();
            res.ok(json!({
                "test_voltage_v": c.low_voltage_threshold - 0.5,
                "state": policy.state().name(),
            }));
            Ok(())
        },
    )
    .permission(perm::POWER_CONTROL)
}

fn debug_mode(policy: Arc<PowerPolicy>) -> Endpoint {
    Endpoint::new("power.debug", "Set debug mode", Category::Power, move |p, res| {
        let enable = p.req_bool("enable")?;
        let duration = p.i64("duration").unwrap_or(0) as u32;
        policy.set_debug_mode(enable, duration);
        res.ok(json!({"debug": enable, "duration_sec": duration}));
        Ok(())
    })
    .params(DEBUG_PARAMS)
    .permission(perm::POWER_CONTROL)
}
