//! Power policy cycles against recording hardware: brownout, cancelled
//! countdown, recovery reboot, and the `power.*` endpoints.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use rackctl::adapters::nvs::NvsAdapter;
use rackctl::adapters::time::SimClock;
use rackctl::adapters::variables::VariableRegistry;
use rackctl::app::ports::IndicatorPattern;
use rackctl::config::PowerPolicyConfig;
use rackctl::device::{AgxPins, Device, DevicePower, LpmuPins};
use rackctl::events::{Event, EventBus, Filter, PowerEventKind, Topic};
use rackctl::fan::{FanController, FanHwConfig};
use rackctl::pins;
use rackctl::power::{PolicyDeps, PolicyState, PowerPolicy};
use rackctl::store::ConfigStore;
use rackctl::temp::TempManager;
use serde_json::json;

use crate::mock_hw::{
    MockGpio, MockIndicator, MockProbe, MockPwm, MockSystem, Rig, ScriptedSupply,
};

/// Hand-wired policy so delays below the runtime setter ranges can be used.
struct Bench {
    clock: Arc<SimClock>,
    gpio: Arc<MockGpio>,
    pwm: Arc<MockPwm>,
    supply: Arc<ScriptedSupply>,
    probe: Arc<MockProbe>,
    system: Arc<MockSystem>,
    led: Arc<MockIndicator>,
    bus: Arc<EventBus>,
    devices: Arc<DevicePower>,
    fans: Arc<FanController>,
    policy: PowerPolicy,
}

impl Bench {
    fn new(config: PowerPolicyConfig) -> Self {
        let clock = Arc::new(SimClock::starting_at_ms(1_000));
        let gpio = Arc::new(MockGpio::default());
        let pwm = Arc::new(MockPwm::default());
        let supply = Arc::new(ScriptedSupply::new(24.0));
        let probe = Arc::new(MockProbe::default());
        probe.reachable.store(true, Ordering::Relaxed);
        let system = Arc::new(MockSystem::default());
        let led = Arc::new(MockIndicator::default());
        let vars = Arc::new(VariableRegistry::new());
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(ConfigStore::new(
            Box::new(NvsAdapter::new().unwrap()),
            bus.clone(),
        ));
        let temp = Arc::new(TempManager::new(clock.clone(), vars.clone(), store.clone(), bus.clone(), 0));
        let fans = Arc::new(FanController::new(
            pwm.clone(),
            clock.clone(),
            temp,
            store.clone(),
            bus.clone(),
        ));
        fans.configure(0, FanHwConfig::board(0, None)).unwrap();
        let devices = Arc::new(DevicePower::new(gpio.clone(), clock.clone(), bus.clone(), 0));
        devices.configure_agx(AgxPins::default()).unwrap();
        devices.configure_lpmu(LpmuPins::default()).unwrap();
        let policy = PowerPolicy::new(
            PolicyDeps {
                clock: clock.clone(),
                voltage: supply.clone(),
                probe: probe.clone(),
                system: system.clone(),
                indicator: led.clone(),
                vars,
                devices: devices.clone(),
                fans: fans.clone(),
                store,
                bus: bus.clone(),
                post_timeout_ms: 0,
            },
            config,
        )
        .unwrap();
        policy.start();
        Self {
            clock,
            gpio,
            pwm,
            supply,
            probe,
            system,
            led,
            bus,
            devices,
            fans,
            policy,
        }
    }

    /// One tick per volt sample; returns the state after each.
    fn run(&self, volts: f32, ticks: usize) -> Vec<PolicyState> {
        self.supply.push(volts, ticks);
        (0..ticks)
            .map(|_| {
                self.clock.advance_ms(1_000);
                self.policy.tick();
                self.policy.state()
            })
            .collect()
    }
}

fn brownout_config() -> PowerPolicyConfig {
    PowerPolicyConfig {
        low_voltage_threshold: 12.6,
        recovery_voltage_threshold: 18.0,
        shutdown_delay_sec: 5,
        recovery_hold_sec: 2,
        fan_stop_delay_sec: 3,
        ..PowerPolicyConfig::default()
    }
}

fn record_power_events(bus: &EventBus) -> Arc<std::sync::Mutex<Vec<PowerEventKind>>> {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.register(Topic::Power, Filter::Any, move |ev| {
        if let Event::Power(p) = ev {
            sink.lock().unwrap().push(p.kind);
        }
    })
    .unwrap();
    seen
}

#[test]
fn brownout_full_cycle() {
    let b = Bench::new(brownout_config());
    let events = record_power_events(&b.bus);
    b.devices.power_on(Device::Agx).unwrap();
    b.devices.power_on(Device::Lpmu).unwrap();
    b.fans.set_duty(0, 60).unwrap();
    b.gpio.clear();

    let low = b.run(12.0, 5);
    assert_eq!(&low[..4], &[PolicyState::LowVoltage; 4]);
    assert_eq!(low[4], PolicyState::Protected);
    assert_eq!(b.gpio.writes_to(pins::AGX_POWER_GPIO), 1, "AGX graceful off");
    assert_eq!(b.gpio.writes_to(pins::LPMU_POWER_GPIO), 2, "one LPMU button pulse");
    assert_eq!(b.probe.pings.load(Ordering::Relaxed), 1);
    assert_eq!(b.led.last(), Some(IndicatorPattern::Warning));

    let held = b.run(17.0, 3);
    assert_eq!(held, vec![PolicyState::Protected; 3]);
    assert!(b.policy.status().fans_stopped);
    assert_eq!(b.pwm.last(0), Some(0));

    let rec = b.run(19.0, 1);
    assert_eq!(rec, vec![PolicyState::Recovery]);
    assert_eq!(b.system.restarts(), 0);
    b.run(19.0, 1);
    assert_eq!(b.system.restarts(), 1);
    assert!(b.system.flushes.load(Ordering::Relaxed) >= 1);

    let seen = events.lock().unwrap().clone();
    for kind in [
        PowerEventKind::LowVoltage,
        PowerEventKind::ShutdownStart,
        PowerEventKind::Protected,
        PowerEventKind::RecoveryStart,
        PowerEventKind::RecoveryComplete,
    ] {
        assert!(seen.contains(&kind), "missing {:?} in {:?}", kind, seen);
    }
    let order: Vec<_> = seen
        .iter()
        .filter(|k| !matches!(k, PowerEventKind::CountdownTick | PowerEventKind::StateChanged { .. }))
        .copied()
        .collect();
    assert_eq!(order.first(), Some(&PowerEventKind::LowVoltage));
    assert_eq!(order.last(), Some(&PowerEventKind::RecoveryComplete));
}

#[test]
fn short_dip_cancels_the_countdown() {
    let b = Bench::new(PowerPolicyConfig::default());
    b.devices.power_on(Device::Agx).unwrap();
    b.gpio.clear();

    let dip = b.run(12.0, 30);
    assert!(dip.iter().all(|s| *s == PolicyState::LowVoltage));
    assert_eq!(b.policy.status().countdown_sec, 30);

    assert_eq!(b.run(19.0, 1), vec![PolicyState::Normal]);
    assert_eq!(b.gpio.writes_to(pins::AGX_POWER_GPIO), 0, "no shutdown fired");
    assert!(b.devices.is_powered(Device::Agx));
    assert_eq!(b.policy.status().protection_count, 1);
}

#[test]
fn sixty_second_brownout_then_recovery_reboots() {
    let b = Bench::new(PowerPolicyConfig::default());
    let states = b.run(12.0, 60);
    assert_eq!(states[0], PolicyState::LowVoltage);
    assert_eq!(states[58], PolicyState::LowVoltage);
    assert_eq!(states[59], PolicyState::Protected);

    assert_eq!(b.run(19.0, 1), vec![PolicyState::Recovery]);
    let hold = PowerPolicyConfig::default().recovery_hold_sec as usize;
    b.run(19.0, hold - 2);
    assert_eq!(b.system.restarts(), 0);
    b.run(19.0, 1);
    assert_eq!(b.system.restarts(), 1);
}

#[test]
fn recovery_dip_falls_back_to_protected() {
    let b = Bench::new(brownout_config());
    b.run(12.0, 5);
    assert_eq!(b.run(19.0, 1), vec![PolicyState::Recovery]);
    assert_eq!(b.run(15.0, 1), vec![PolicyState::Protected]);
    assert_eq!(b.policy.status().recovery_timer, 0);
    assert_eq!(b.run(19.0, 1), vec![PolicyState::Recovery]);
    assert_eq!(b.run(11.0, 1), vec![PolicyState::LowVoltage]);
    assert_eq!(b.system.restarts(), 0);
}

#[test]
fn device_shutdown_can_be_disabled() {
    let b = Bench::new(PowerPolicyConfig {
        device_shutdown: false,
        ..brownout_config()
    });
    b.devices.power_on(Device::Agx).unwrap();
    b.run(12.0, 5);
    assert_eq!(b.policy.state(), PolicyState::Protected);
    assert!(b.devices.is_powered(Device::Agx));
}

// ── API surface ───────────────────────────────────────────────

#[test]
fn protection_endpoints_report_and_configure() {
    let rig = Rig::new();
    let sid = rig.admin();

    let r = rig.call("power.protection.status", json!({}), None);
    assert_eq!(r["code"], 0);
    assert_eq!(r["data"]["state"], "NORMAL");
    assert_eq!(r["data"]["running"], true);

    let r = rig.call(
        "power.protection.set",
        json!({"low_threshold": 11.8, "shutdown_delay": 30}),
        Some(sid),
    );
    assert_eq!(r["code"], 0, "{r}");
    assert_eq!(r["data"]["shutdown_delay_sec"], 30);
    assert_eq!(r["data"]["persisted"], false);
    let cfg = rig.plane.policy().config();
    assert!((cfg.low_voltage_threshold - 11.8).abs() < 1e-4);
    assert!((cfg.recovery_voltage_threshold - 18.0).abs() < 1e-4);

    let r = rig.call("power.protection.set", json!({"shutdown_delay": 5}), Some(sid));
    assert_eq!(r["code"], 1);
    assert_eq!(r["message"], "shutdown_delay must be 10-600");

    let r = rig.call("power.protection.set", json!({"low_threshold": 19.0}), Some(sid));
    assert_eq!(r["code"], 1);
    assert!((rig.plane.policy().config().low_voltage_threshold - 11.8).abs() < 1e-4);

    let r = rig.call("power.protection.config", json!({}), None);
    assert_eq!(r["data"]["defaults"]["shutdown_delay_sec"], 60);
}

#[test]
fn protection_test_endpoint_trips_the_monitor() {
    let rig = Rig::new();
    let r = rig.call("power.protection.test", json!({}), None);
    assert_eq!(r["code"], 10);

    let r = rig.call("power.protection.test", json!({}), Some(rig.admin()));
    assert_eq!(r["code"], 0, "{r}");
    rig.feed(24.0, 1);
    assert_eq!(rig.plane.policy().state(), PolicyState::LowVoltage);
    assert!(rig.plane.policy().is_test_mode());
}

#[test]
fn disabling_the_monitor_persists() {
    let rig = Rig::new();
    let r = rig.call("power.protection.set", json!({"enable": false}), Some(rig.admin()));
    assert_eq!(r["code"], 0, "{r}");
    assert_eq!(r["data"]["running"], false);
    assert_eq!(r["data"]["persisted"], true);

    rig.feed(10.0, 3);
    assert_eq!(rig.plane.policy().state(), PolicyState::Normal);
    rig.plane.policy().load_config().unwrap();
    assert!(!rig.plane.policy().config().enabled);
}
