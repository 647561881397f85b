//! Temperature fusion through the full control plane: provider priority,
//! preferred source, staleness and the manual override over the API.

use rackctl::temp::{DATA_TIMEOUT_MS, DEFAULT_TEMP, SourceKind};
use serde_json::json;

use crate::mock_hw::Rig;

#[test]
fn preferred_source_outlives_a_stale_peer() {
    let rig = Rig::new();
    let temp = rig.plane.temp();

    temp.provider_register(SourceKind::SensorLocal, Some("board")).unwrap();
    temp.provider_update(SourceKind::SensorLocal, 350).unwrap();
    let r = temp.get_effective();
    assert_eq!((r.value, r.source), (350, SourceKind::SensorLocal));

    temp.provider_register(SourceKind::AgxAuto, None).unwrap();
    temp.provider_update(SourceKind::AgxAuto, 420).unwrap();
    let r = temp.get_effective();
    assert_eq!((r.value, r.source), (420, SourceKind::AgxAuto));

    temp.set_preferred_source(SourceKind::SensorLocal).unwrap();
    assert_eq!(temp.get_effective().value, 350);

    rig.clock.advance_ms(DATA_TIMEOUT_MS + 1);
    temp.provider_update(SourceKind::SensorLocal, 350).unwrap();
    let r = temp.get_effective();
    assert_eq!((r.value, r.source), (350, SourceKind::SensorLocal));
    assert!(!temp.get_by_source(SourceKind::AgxAuto).unwrap().valid);

    temp.provider_unregister(SourceKind::SensorLocal).unwrap();
    let r = temp.get_effective();
    assert_eq!((r.value, r.source), (DEFAULT_TEMP, SourceKind::Default));
}

#[test]
fn manual_override_over_the_api() {
    let rig = Rig::new();
    let sid = rig.admin();
    rig.plane.temp().provider_register(SourceKind::AgxAuto, None).unwrap();
    rig.plane.temp().provider_update(SourceKind::AgxAuto, 380).unwrap();

    let r = rig.call("temp.manual", json!({"enable": true, "temperature_c": 45.0}), Some(sid));
    assert_eq!(r["code"], 0, "{r}");
    assert_eq!(r["data"]["current_temp_01c"], 450);
    assert_eq!(r["data"]["active_source"], "manual");

    let r = rig.call("temp.read", json!({}), None);
    assert_eq!(r["data"]["temperature_01c"], 450);
    assert_eq!(r["data"]["source"], "manual");

    let r = rig.call("temp.manual", json!({"enable": false}), Some(sid));
    assert_eq!(r["code"], 0);
    assert_eq!(r["data"]["manual_mode"], false);
    assert_eq!(r["data"]["current_temp_01c"], 380);
    assert_eq!(r["data"]["active_source"], "agx");
}

#[test]
fn manual_override_requires_temp_control() {
    let rig = Rig::new();
    let r = rig.call("temp.manual", json!({"enable": true}), None);
    assert_eq!(r["code"], 10);
    let r = rig.call("temp.manual", json!({"enable": true}), Some(rig.viewer()));
    assert_eq!(r["code"], 3);
    assert!(!rig.plane.temp().is_manual_mode());
}

#[test]
fn reading_an_unregistered_source_is_not_found() {
    let rig = Rig::new();
    let r = rig.call("temp.read", json!({"source": "agx"}), None);
    assert_eq!(r["code"], 2);

    let r = rig.call("temp.read", json!({"source": "lava"}), None);
    assert_eq!(r["code"], 1);
    assert_eq!(r["message"], "Invalid source type");
}

#[test]
fn variable_source_tracks_the_registry() {
    let rig = Rig::new();
    rig.vars.set("rack.inlet", 31.5);
    rig.plane.temp().bind_variable("rack.inlet").unwrap();

    let r = rig.plane.temp().get_effective();
    assert_eq!((r.value, r.source), (315, SourceKind::Variable));

    rig.vars.remove("rack.inlet");
    assert_eq!(rig.plane.temp().get_effective().source, SourceKind::Default);
}

#[test]
fn fans_follow_the_effective_temperature() {
    let rig = Rig::new();
    rig.plane.fans().set_mode(0, rackctl::fan::FanMode::Auto).unwrap();
    rig.plane.temp().set_manual(612).unwrap();
    rig.plane.fans().tick();
    assert_eq!(rig.plane.fans().get_status(0).unwrap().temperature, 612);
}
