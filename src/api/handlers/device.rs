//! `device.*` endpoints.

use std::sync::Arc;

use serde_json::json;

use crate::api::auth::perm;
use crate::api::{Category, Endpoint, ParamSpec, Params};
use crate::device::{Device, DevicePower, DeviceStatus};
use crate::error::{Error, Result};

use super::Services;

const DEVICE_NAMES: &[&str] = &["agx", "lpmu"];

const STATUS_PARAMS: &[ParamSpec] = &[ParamSpec::one_of("device", DEVICE_NAMES)];

const POWER_PARAMS: &[ParamSpec] = &[
    ParamSpec::one_of("device", DEVICE_NAMES),
    ParamSpec::one_of("action", &["on", "off", "toggle", "force_off"]).required(),
];

/// Defaults to the AGX.
fn device_of(p: &Params<'_>) -> Device {
    p.str("device").and_then(Device::parse).unwrap_or(Device::Agx)
}

pub fn status_json(s: &DeviceStatus) -> serde_json::Value {
    json!({
        "device": s.device.name(),
        "state": s.state.name(),
        "power_good": s.power_good,
        "uptime_ms": s.uptime_ms,
        "boot_count": s.boot_count,
    })
}

fn apply_power(devices: &DevicePower, dev: Device, action: &str) -> Result<()> {
    match action {
        "on" => devices.power_on(dev),
        "off" => devices.power_off(dev),
        "toggle" => devices.toggle(dev),
        "force_off" => devices.force_off(dev),
        _ => Err(Error::InvalidArg("Invalid action")),
    }
}

pub fn endpoints(svc: &Services) -> Vec<Endpoint> {
    vec![
        status(svc.devices.clone()),
        power(svc.devices.clone()),
        reset(svc.devices.clone()),
        recovery(svc.devices.clone()),
    ]
}

fn status(devices: Arc<DevicePower>) -> Endpoint {
    Endpoint::new("device.status", "Get device status", Category::Device, move |p, res| {
        let status = devices.status(device_of(p))?;
        res.ok(status_json(&status));
        Ok(())
    })
    .params(STATUS_PARAMS)
}

fn power(devices: Arc<DevicePower>) -> Endpoint {
    Endpoint::new("device.power", "Control device power", Category::Device, move |p, res| {
        let dev = device_of(p);
        let action = p.req_str("action")?;
        apply_power(&devices, dev, action)?;
        res.ok(json!({"device": dev.name(), "action": action, "success": true}));
        Ok(())
    })
    .params(POWER_PARAMS)
    .permission(perm::DEVICE_CONTROL)
}

fn reset(devices: Arc<DevicePower>) -> Endpoint {
    Endpoint::new("device.reset", "Reset device", Category::Device, move |p, res| {
        let dev = device_of(p);
        devices.reset(dev)?;
        res.ok(json!({"device": dev.name(), "reset": true}));
        Ok(())
    })
    .params(STATUS_PARAMS)
    .permission(perm::DEVICE_CONTROL)
}

fn recovery(devices: Arc<DevicePower>) -> Endpoint {
    Endpoint::new(
        "device.recovery",
        "Boot the AGX into recovery mode",
        Category::Device,
        move |p, res| {
            let dev = device_of(p);
            devices.enter_recovery(dev)?;
            res.ok(json!({"device": dev.name(), "recovery": true}));
            Ok(())
        },
    )
    .params(STATUS_PARAMS)
    .permission(perm::DEVICE_CONTROL)
}
