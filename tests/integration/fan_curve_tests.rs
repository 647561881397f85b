//! Fan curve and hysteresis driven by the temperature manager, plus the
//! `fan.*` endpoints.

use rackctl::fan::FanMode;
use rackctl::fan::curve::CurvePoint;
use serde_json::json;

use crate::mock_hw::Rig;

fn curve_rig(points: &[(i16, u8)], hysteresis: i16) -> Rig {
    let rig = Rig::new();
    let fans = rig.plane.fans();
    let points: Vec<CurvePoint> = points.iter().map(|&(t, d)| CurvePoint::new(t, d)).collect();
    fans.set_limits(0, 20, 100).unwrap();
    fans.set_curve(0, &points).unwrap();
    fans.set_hysteresis(0, hysteresis, 100).unwrap();
    fans.set_mode(0, FanMode::Curve).unwrap();
    rig
}

/// Feed `temp` through the manual source and run one fan tick.
fn sample(rig: &Rig, temp: i16) -> u8 {
    rig.plane.temp().set_manual(temp).unwrap();
    rig.clock.advance_ms(100);
    rig.plane.fans().tick();
    rig.plane.fans().get_status(0).unwrap().applied_duty
}

#[test]
fn curve_interpolates_between_breakpoints() {
    let rig = curve_rig(&[(300, 20), (500, 40), (700, 80), (800, 100)], 0);
    assert_eq!(sample(&rig, 250), 20);
    assert_eq!(sample(&rig, 600), 60);
    assert_eq!(sample(&rig, 750), 90);
    assert_eq!(sample(&rig, 850), 100);
    assert_eq!(rig.pwm.last(0), Some(100));
}

#[test]
fn hysteresis_staircase_changes_only_on_large_steps() {
    let rig = curve_rig(&[(300, 20), (800, 100)], 30);
    let mut prev = rig.plane.fans().get_status(0).unwrap().applied_duty;
    let mut changed_at = Vec::new();
    for t in [400, 405, 410, 425, 435, 460] {
        let duty = sample(&rig, t);
        if duty != prev {
            changed_at.push(t);
        }
        prev = duty;
    }
    assert_eq!(changed_at, vec![400, 435]);
    let s = rig.plane.fans().get_status(0).unwrap();
    assert_eq!(s.last_stable_temp, 435);
    assert!(s.target_duty > s.duty, "460 asks for more than the held duty");
}

#[test]
fn disabled_and_off_fans_write_zero() {
    let rig = Rig::new();
    let fans = rig.plane.fans();
    fans.set_duty(0, 70).unwrap();
    fans.tick();
    assert_eq!(rig.pwm.last(0), Some(70));

    fans.enable(0, false).unwrap();
    fans.tick();
    assert_eq!(rig.pwm.last(0), Some(0));
    assert!(!fans.get_status(0).unwrap().running);

    fans.enable(0, true).unwrap();
    fans.set_mode(0, FanMode::Off).unwrap();
    fans.tick();
    assert_eq!(rig.pwm.last(0), Some(0));
    assert_eq!(fans.get_status(0).unwrap().duty, 70, "set point survives OFF");
}

#[test]
fn api_sets_duty_and_curve() {
    let rig = Rig::new();
    let sid = rig.admin();

    let r = rig.call("fan.set", json!({"id": 0, "duty": 55}), Some(sid));
    assert_eq!(r["code"], 0, "{r}");
    assert_eq!(rig.pwm.last(0), Some(55));

    let r = rig.call("fan.set", json!({"id": 0, "duty": 101}), Some(sid));
    assert_eq!(r["code"], 1);
    assert_eq!(r["message"], "Duty must be 0-100");

    let r = rig.call("fan.set", json!({"id": 9, "duty": 10}), Some(sid));
    assert_eq!(r["message"], "Invalid fan ID");

    let curve = json!([{"temp": 70, "duty": 100}, {"temp": 30, "duty": 20}]);
    let r = rig.call("fan.curve", json!({"id": 0, "curve": curve}), Some(sid));
    assert_eq!(r["code"], 0, "{r}");
    let settings = rig.plane.fans().settings(0).unwrap();
    assert_eq!(settings.curve[0], CurvePoint::new(300, 20));
    assert_eq!(settings.curve[1], CurvePoint::new(700, 100));

    let r = rig.call("fan.mode", json!({"id": 0, "mode": "curve"}), Some(sid));
    assert_eq!(r["code"], 0);
    let r = rig.call("fan.status", json!({"id": 0}), None);
    assert_eq!(r["data"]["mode"], "curve");
}

#[test]
fn too_many_curve_points_are_rejected() {
    let rig = Rig::new();
    let curve: Vec<_> = (0..9).map(|i| json!({"temp": 20 + i * 5, "duty": 20 + i * 5})).collect();
    let r = rig.call("fan.curve", json!({"id": 0, "curve": curve}), Some(rig.admin()));
    assert_eq!(r["code"], 1);
    assert_eq!(r["message"], "Too many curve points");
}

#[test]
fn unconfigured_fan_is_invalid_state() {
    let rig = Rig::new();
    let r = rig.call("fan.status", json!({"id": 2}), None);
    assert_eq!(r["code"], 11);
    let all = rig.call("fan.status", json!({}), None);
    assert_eq!(all["data"]["fans"].as_array().unwrap().len(), 1);
}

#[test]
fn emergency_full_overrides_modes() {
    let rig = Rig::new();
    let fans = rig.plane.fans();
    fans.set_mode(0, FanMode::Off).unwrap();
    fans.emergency_full().unwrap();
    let s = fans.get_status(0).unwrap();
    assert_eq!((s.mode, s.duty, s.enabled), (FanMode::Manual, 100, true));
    assert_eq!(rig.pwm.last(0), Some(100));
}
