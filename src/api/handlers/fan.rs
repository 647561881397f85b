//! `fan.*` endpoints.
//!
//! Curve points arrive in °C (`{"temp": 45, "duty": 60}`) and are stored
//! in tenths.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::api::auth::perm;
use crate::api::{Category, Endpoint, ParamSpec};
use crate::error::{Error, Result};
use crate::fan::curve::{CurvePoint, MAX_CURVE_POINTS};
use crate::fan::{FAN_COUNT, FanController, FanMode, FanStatus};
use crate::temp::tenths_from_celsius;

use super::{Services, celsius};

const MAX_ID: i64 = FAN_COUNT as i64 - 1;

const STATUS_PARAMS: &[ParamSpec] =
    &[ParamSpec::int("id", 0, MAX_ID).range_msg("Invalid fan ID")];

const SET_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("id", 0, MAX_ID).required().range_msg("Invalid fan ID"),
    ParamSpec::int("duty", 0, 100).required().range_msg("Duty must be 0-100"),
];

const MODE_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("id", 0, MAX_ID).required().range_msg("Invalid fan ID"),
    ParamSpec::one_of("mode", &["off", "manual", "auto", "curve"]).required(),
];

const ENABLE_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("id", 0, MAX_ID).required().range_msg("Invalid fan ID"),
    ParamSpec::bool("enable").required(),
];

const CURVE_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("id", 0, MAX_ID).required().range_msg("Invalid fan ID"),
    ParamSpec::array("curve", MAX_CURVE_POINTS)
        .required()
        .range_msg("Too many curve points"),
];

pub fn status_json(s: &FanStatus) -> Value {
    json!({
        "id": s.id,
        "mode": s.mode.name(),
        "duty": s.duty,
        "target_duty": s.target_duty,
        "rpm": s.rpm,
        "temperature": celsius(s.temperature),
        "enabled": s.enabled,
        "running": s.running,
        "fault": s.fault,
    })
}

fn parse_point(v: &Value) -> Result<CurvePoint> {
    const BAD: Error = Error::InvalidArg("Invalid curve point format");
    let temp = v.get("temp").and_then(Value::as_f64).ok_or(BAD)?;
    let duty = v.get("duty").and_then(Value::as_f64).ok_or(BAD)?;
    if !(0.0..=100.0).contains(&duty) {
        return Err(BAD);
    }
    let temp = tenths_from_celsius(temp).ok_or(BAD)?;
    Ok(CurvePoint::new(temp, duty as u8))
}

pub fn endpoints(svc: &Services) -> Vec<Endpoint> {
    vec![
        status(svc.fans.clone()),
        set(svc.fans.clone()),
        mode(svc.fans.clone()),
        enable(svc.fans.clone()),
        curve(svc.fans.clone()),
    ]
}

fn status(fans: Arc<FanController>) -> Endpoint {
    Endpoint::new("fan.status", "Get fan status", Category::Fan, move |p, res| {
        match p.i64("id") {
            Some(id) => {
                let s = fans.get_status(id as usize)?;
                res.ok(status_json(&s));
            }
            None => {
                let all: Vec<Value> = fans.get_all_status().iter().map(status_json).collect();
                res.ok(json!({ "fans": all }));
            }
        }
        Ok(())
    })
    .params(STATUS_PARAMS)
}

fn set(fans: Arc<FanController>) -> Endpoint {
    Endpoint::new("fan.set", "Set fan speed (manual mode)", Category::Fan, move |p, res| {
        let id = p.req_i64("id")?;
        let duty = p.req_i64("duty")?;
        fans.set_duty(id as usize, duty as u8)?;
        res.ok(json!({"id": id, "duty": duty, "mode": FanMode::Manual.name()}));
        Ok(())
    })
    .params(SET_PARAMS)
    .permission(perm::FAN_CONTROL)
}

fn mode(fans: Arc<FanController>) -> Endpoint {
    Endpoint::new("fan.mode", "Set fan operating mode", Category::Fan, move |p, res| {
        let id = p.req_i64("id")?;
        let mode = FanMode::parse(p.req_str("mode")?).ok_or(Error::InvalidArg("Invalid mode"))?;
        fans.set_mode(id as usize, mode)?;
        res.ok(json!({"id": id, "mode": mode.name()}));
        Ok(())
    })
    .params(MODE_PARAMS)
    .permission(perm::FAN_CONTROL)
}

fn enable(fans: Arc<FanController>) -> Endpoint {
    Endpoint::new("fan.enable", "Enable or disable a fan", Category::Fan, move |p, res| {
        let id = p.req_i64("id")?;
        let enable = p.req_bool("enable")?;
        fans.enable(id as usize, enable)?;
        res.ok(json!({"id": id, "enabled": enable}));
        Ok(())
    })
    .params(ENABLE_PARAMS)
    .permission(perm::FAN_CONTROL)
}

fn curve(fans: Arc<FanController>) -> Endpoint {
    Endpoint::new("fan.curve", "Set temperature curve for fan", Category::Fan, move |p, res| {
        let id = p.req_i64("id")?;
        let points = p
            .array("curve")
            .ok_or(Error::InvalidArg("Missing required parameter: curve"))?
            .iter()
            .map(parse_point)
            .collect::<Result<Vec<_>>>()?;
        fans.set_curve(id as usize, &points)?;
        res.ok(json!({"id": id, "points": points.len()}));
        Ok(())
    })
    .params(CURVE_PARAMS)
    .permission(perm::FAN_CONTROL)
}
