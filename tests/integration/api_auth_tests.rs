//! Dispatch authorization, envelopes and introspection over the full
//! endpoint table.

use std::collections::HashSet;

use rackctl::pins;
use serde_json::json;

use crate::mock_hw::Rig;

#[test]
fn device_power_requires_auth_then_permission() {
    let rig = Rig::new();
    rig.gpio.clear();
    let params = json!({"device": "agx", "action": "off"});

    let r = rig.call("device.power", params.clone(), None);
    assert_eq!(r["code"], 10);
    assert_eq!(r["message"], "Authentication required");

    let r = rig.call("device.power", params.clone(), Some(rig.viewer()));
    assert_eq!(r["code"], 3);
    assert_eq!(r["message"], "Permission required: device.control");
    assert_eq!(rig.gpio.writes_to(pins::AGX_POWER_GPIO), 0);

    let r = rig.call("device.power", params, Some(rig.admin()));
    assert_eq!(r["code"], 0, "{r}");
    assert_eq!(r["data"]["success"], true);
    assert_eq!(rig.gpio.writes_to(pins::AGX_POWER_GPIO), 1);
}

#[test]
fn unknown_session_is_anonymous() {
    let rig = Rig::new();
    let r = rig.call("device.reset", json!({}), Some(0xDEAD_BEEF));
    assert_eq!(r["code"], 10);
}

#[test]
fn wrong_password_is_unauthorized() {
    let rig = Rig::new();
    assert_eq!(
        rig.plane.login(2, "ops", "nope"),
        Err(rackctl::Error::Unauthorized)
    );
}

#[test]
fn malformed_requests_get_envelopes() {
    let rig = Rig::new();
    let r: serde_json::Value = serde_json::from_str(&rig.plane.request("{not json", None)).unwrap();
    assert_eq!(r["code"], 1);

    let r = rig.call("no.such.thing", json!({}), None);
    assert_eq!(r["code"], 2);
    assert_eq!(r["message"], "API not found");

    let r = rig.call("device.power", json!({"device": "agx"}), Some(rig.admin()));
    assert_eq!(r["code"], 1);
    assert_eq!(r["message"], "Missing required parameter: action");

    let r = rig.call("device.power", json!({"device": "gpu", "action": "on"}), Some(rig.admin()));
    assert_eq!(r["code"], 1);
    assert!(r["message"].as_str().unwrap().contains("device"));
}

#[test]
fn lpmu_recovery_is_not_supported() {
    let rig = Rig::new();
    let r = rig.call("device.recovery", json!({"device": "lpmu"}), Some(rig.admin()));
    assert_eq!(r["code"], 8);
}

#[test]
fn device_status_reflects_power_changes() {
    let rig = Rig::new();
    let sid = rig.admin();
    let r = rig.call("device.status", json!({"device": "lpmu"}), None);
    assert_eq!(r["data"]["state"], "off");

    rig.call("device.power", json!({"device": "lpmu", "action": "on"}), Some(sid));
    let r = rig.call("device.status", json!({"device": "lpmu"}), None);
    assert_eq!(r["data"]["state"], "on");
    assert_eq!(r["data"]["boot_count"], 1);
}

#[test]
fn catalog_lists_every_endpoint_once() {
    let rig = Rig::new();
    let r = rig.call("api.list", json!({}), None);
    assert_eq!(r["code"], 0);
    let endpoints = r["data"]["endpoints"].as_array().unwrap();
    assert_eq!(r["data"]["count"], endpoints.len());
    assert_eq!(endpoints.len(), rig.plane.registry().len());

    let names: HashSet<&str> = endpoints.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names.len(), endpoints.len());
    for name in [
        "device.status",
        "device.power",
        "device.reset",
        "fan.status",
        "fan.set",
        "fan.mode",
        "fan.enable",
        "fan.curve",
        "temp.read",
        "temp.manual",
        "temp.sources",
        "temp.status",
        "power.protection.status",
        "power.protection.set",
        "power.protection.test",
        "api.list",
        "api.info",
    ] {
        assert!(names.contains(name), "{name} missing");
    }

    let r = rig.call("api.list", json!({"category": "fan"}), None);
    assert_eq!(r["data"]["count"], 5);
}

#[test]
fn info_describes_parameters() {
    let rig = Rig::new();
    let r = rig.call("api.info", json!({"name": "fan.set"}), None);
    assert_eq!(r["code"], 0);
    assert_eq!(r["data"]["requires_auth"], true);
    let params = r["data"]["params"].as_array().unwrap();
    assert!(params.iter().any(|p| p["name"] == "duty" && p["required"] == true));

    let r = rig.call("api.info", json!({"name": "fan.explode"}), None);
    assert_eq!(r["code"], 2);
}
