//! SD > NVS > defaults across the control plane start-up path.

use rackctl::adapters::sd::MemCard;
use rackctl::config::{POWER_POLICY_RECORD, PowerPolicyConfig, TEMP_RECORD};
use rackctl::fan::FanMode;
use rackctl::store::Tier;
use rackctl::temp::SourceKind;

use crate::mock_hw::{Media, Rig};

fn power_json(low: f32) -> Vec<u8> {
    format!(r#"{{"low_voltage_threshold": {low}}}"#).into_bytes()
}

fn low_threshold(rig: &Rig) -> f32 {
    rig.plane.policy().config().low_voltage_threshold
}

#[test]
fn sd_record_wins_until_reload() {
    let card = MemCard::new();
    card.put(POWER_POLICY_RECORD.path, &power_json(11.5));
    let rig = Rig::with_media(Media {
        nvs: vec![(POWER_POLICY_RECORD.namespace, POWER_POLICY_RECORD.key, power_json(12.2))],
        card: Some(card),
    });
    assert!((low_threshold(&rig) - 11.5).abs() < 1e-4);

    let store = rig.plane.store();
    store.unmount_sd();
    let cfg = PowerPolicyConfig {
        low_voltage_threshold: 12.0,
        ..PowerPolicyConfig::default()
    };
    store.save_json(POWER_POLICY_RECORD, &cfg).unwrap();
    assert!((low_threshold(&rig) - 11.5).abs() < 1e-4, "no live reload");

    assert_eq!(rig.plane.policy().load_config().unwrap(), Some(Tier::Nvs));
    assert!((low_threshold(&rig) - 12.0).abs() < 1e-4);
}

#[test]
fn nvs_is_used_without_a_card() {
    let rig = Rig::with_media(Media {
        nvs: vec![(POWER_POLICY_RECORD.namespace, POWER_POLICY_RECORD.key, power_json(12.2))],
        card: None,
    });
    assert!((low_threshold(&rig) - 12.2).abs() < 1e-4);
}

#[test]
fn invalid_stored_record_keeps_defaults() {
    let card = MemCard::new();
    card.put(
        POWER_POLICY_RECORD.path,
        br#"{"low_voltage_threshold": 20.0, "recovery_voltage_threshold": 18.0}"#,
    );
    let rig = Rig::with_media(Media {
        nvs: Vec::new(),
        card: Some(card),
    });
    assert_eq!(rig.plane.policy().config(), PowerPolicyConfig::default());
}

#[test]
fn mounting_a_card_reloads_and_syncs() {
    let rig = Rig::new();
    rig.plane.temp().set_preferred_source(SourceKind::AgxAuto).unwrap();
    let card = MemCard::new();
    card.put(POWER_POLICY_RECORD.path, &power_json(11.0));

    rig.plane.store().mount_sd(Box::new(card.clone())).unwrap();
    assert!(card.contains(TEMP_RECORD.path), "pending temp record synced to SD");
    assert!((low_threshold(&rig) - 11.0).abs() < 1e-4, "policy reloaded on mount");
    assert_eq!(rig.plane.temp().preferred_source(), SourceKind::AgxAuto);
}

#[test]
fn fan_settings_survive_a_restart() {
    let blob = {
        let rig = Rig::new();
        let fans = rig.plane.fans();
        fans.set_limits(0, 30, 90).unwrap();
        fans.set_duty(0, 42).unwrap();
        fans.save_config().unwrap();
        rig.plane.store().read_blob("fan_config", "fan0").unwrap()
    };

    let rig = Rig::with_media(Media {
        nvs: vec![("fan_config", "fan0", blob)],
        card: None,
    });
    let s = rig.plane.fans().get_status(0).unwrap();
    assert_eq!((s.mode, s.duty), (FanMode::Manual, 42));
    let settings = rig.plane.fans().settings(0).unwrap();
    assert_eq!((settings.min_duty, settings.max_duty), (30, 90));
    assert_eq!(rig.pwm.last(0), Some(42), "saved manual duty re-applied");
}

#[test]
fn temp_preference_is_restored_from_sd() {
    let card = MemCard::new();
    card.put(TEMP_RECORD.path, br#"{"preferred_source": "local"}"#);
    let rig = Rig::with_media(Media {
        nvs: Vec::new(),
        card: Some(card),
    });
    assert_eq!(rig.plane.temp().preferred_source(), SourceKind::SensorLocal);
    let fans = rig.plane.fans();
    assert_eq!(fans.mode(0).unwrap(), FanMode::Manual);
}
