//! `temp.*` endpoints.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::api::auth::perm;
use crate::api::{Category, Endpoint, ParamSpec};
use crate::error::Error;
use crate::temp::{MAX_VALID, MIN_VALID, Provider, Reading, SourceKind, TempManager};

use super::{Services, celsius};

const READ_PARAMS: &[ParamSpec] = &[ParamSpec::str("source")];

const MANUAL_PARAMS: &[ParamSpec] = &[
    ParamSpec::bool("enable"),
    ParamSpec::float("temperature_c", MIN_VALID as f64 / 10.0, MAX_VALID as f64 / 10.0),
    ParamSpec::int("temperature_01c", MIN_VALID as i64, MAX_VALID as i64),
];

const SOURCE_PARAMS: &[ParamSpec] = &[ParamSpec::one_of(
    "source",
    &["auto", "default", "variable", "agx", "local", "sensor"],
)
.required()];

fn reading_json(r: &Reading) -> Value {
    json!({
        "temperature_01c": r.value,
        "temperature_c": celsius(r.value),
        "source": r.source.name(),
        "timestamp_ms": r.timestamp_ms,
        "valid": r.valid,
    })
}

fn provider_json(p: &Provider) -> Value {
    json!({
        "name": p.name,
        "type": p.kind.name(),
        "active": p.active,
        "last_value_01c": p.value,
        "last_value_c": celsius(p.value),
        "last_update_ms": p.last_update_ms,
        "update_count": p.update_count,
    })
}

pub fn endpoints(svc: &Services) -> Vec<Endpoint> {
    vec![
        read(svc.temp.clone()),
        manual(svc.temp.clone()),
        sources(svc.temp.clone()),
        status(svc.temp.clone()),
        source(svc.temp.clone()),
    ]
}

fn read(temp: Arc<TempManager>) -> Endpoint {
    Endpoint::new("temp.read", "Read current temperature", Category::Device, move |p, res| {
        let reading = match p.str("source") {
            Some(s) => {
                let kind = SourceKind::parse(s).ok_or(Error::InvalidArg("Invalid source type"))?;
                temp.get_by_source(kind)?
            }
            None => temp.get_effective(),
        };
        res.ok(reading_json(&reading));
        Ok(())
    })
    .params(READ_PARAMS)
}

fn manual(temp: Arc<TempManager>) -> Endpoint {
    Endpoint::new(
        "temp.manual",
        "Set/get manual temperature mode",
        Category::Device,
        move |p, res| {
            let value = match (p.f64("temperature_c"), p.i64("temperature_01c")) {
                (Some(c), _) => Some((c * 10.0).round() as i16),
                (None, Some(t)) => Some(t as i16),
                (None, None) => None,
            };
            if let Some(v) = value {
                temp.set_manual(v)?;
            }
            if let Some(enable) = p.bool("enable") {
                temp.set_manual_mode(enable)?;
            }
            let r = temp.get_effective();
            res.ok(json!({
                "manual_mode": temp.is_manual_mode(),
                "current_temp_01c": r.value,
                "current_temp_c": celsius(r.value),
                "active_source": r.source.name(),
            }));
            Ok(())
        },
    )
    .params(MANUAL_PARAMS)
    .permission(perm::TEMP_CONTROL)
}

fn sources(temp: Arc<TempManager>) -> Endpoint {
    Endpoint::new(
        "temp.sources",
        "Get all temperature sources info",
        Category::Device,
        move |_, res| {
            let st = temp.status();
            let providers: Vec<Value> = st.providers.iter().map(provider_json).collect();
            res.ok(json!({
                "initialized": st.initialized,
                "active_source": st.active_source.name(),
                "current_temp_01c": st.current_temp,
                "current_temp_c": celsius(st.current_temp),
                "manual_mode": st.manual_mode,
                "preferred_source": st.preferred_source.name(),
                "bound_variable": st.bound_variable,
                "provider_count": providers.len(),
                "providers": providers,
            }));
            Ok(())
        },
    )
}

fn status(temp: Arc<TempManager>) -> Endpoint {
    Endpoint::new(
        "temp.status",
        "Get temperature system status",
        Category::Device,
        move |_, res| {
            let st = temp.status();
            let r = temp.get_effective();
            res.ok(json!({
                "initialized": st.initialized,
                "manual_mode": st.manual_mode,
                "active_source": r.source.name(),
                "temperature_01c": r.value,
                "temperature_c": celsius(r.value),
                "valid": r.valid,
                "timestamp_ms": r.timestamp_ms,
            }));
            Ok(())
        },
    )
}

fn source(temp: Arc<TempManager>) -> Endpoint {
    Endpoint::new(
        "temp.source",
        "Select the preferred temperature source",
        Category::Device,
        move |p, res| {
            let kind = SourceKind::parse(p.req_str("source")?)
                .ok_or(Error::InvalidArg("Invalid source type"))?;
            if kind == SourceKind::Default {
                temp.clear_preferred_source()?;
            } else {
                temp.set_preferred_source(kind)?;
            }
            res.ok(json!({
                "preferred_source": temp.preferred_source().name(),
                "active_source": temp.get_effective().source.name(),
            }));
            Ok(())
        },
    )
    .params(SOURCE_PARAMS)
    .permission(perm::TEMP_CONTROL)
}
