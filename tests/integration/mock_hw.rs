//! Recording mock adapters for integration tests.
//!
//! Every port the control plane drives is backed by a mock that keeps its
//! full call history, so tests can assert on what reached the "hardware"
//! without touching real GPIO/PWM registers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rackctl::adapters::nvs::NvsAdapter;
use rackctl::adapters::sd::MemCard;
use rackctl::adapters::time::SimClock;
use rackctl::adapters::variables::VariableRegistry;
use rackctl::api::Level;
use rackctl::app::ports::{
    FilePort, GpioPort, HwError, IndicatorPattern, IndicatorPort, NetProbePort, PinState,
    PwmPort, StoragePort, SystemPort, VoltagePort,
};
use rackctl::app::{ControlPlane, Ports};
use rackctl::config::ControllerConfig;
use rackctl::fan::FAN_COUNT;

// ── PWM ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockPwm {
    pub writes: Mutex<Vec<(u8, u8)>>,
    pub fail: AtomicBool,
}

impl MockPwm {
    pub fn last(&self, channel: u8) -> Option<u8> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, d)| *d)
    }
}

impl PwmPort for MockPwm {
    fn configure(&self, _: u8, _: i32, _: u32, _: u8) -> Result<(), HwError> {
        Ok(())
    }

    fn set_duty(&self, channel: u8, percent: u8) -> Result<(), HwError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(HwError::PwmWriteFailed);
        }
        self.writes.lock().unwrap().push((channel, percent));
        Ok(())
    }
}

// ── GPIO ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockGpio {
    pub levels: Mutex<HashMap<i32, PinState>>,
    pub writes: Mutex<Vec<(i32, PinState)>>,
}

impl MockGpio {
    pub fn writes_to(&self, pin: i32) -> usize {
        self.writes.lock().unwrap().iter().filter(|(p, _)| *p == pin).count()
    }

    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl GpioPort for MockGpio {
    fn configure_output(&self, pin: i32, initial: PinState) -> Result<(), HwError> {
        self.levels.lock().unwrap().insert(pin, initial);
        Ok(())
    }

    fn configure_input(&self, _: i32) -> Result<(), HwError> {
        Ok(())
    }

    fn write(&self, pin: i32, level: PinState) -> Result<(), HwError> {
        self.levels.lock().unwrap().insert(pin, level);
        self.writes.lock().unwrap().push((pin, level));
        Ok(())
    }

    fn read(&self, pin: i32) -> Result<PinState, HwError> {
        Ok(self.levels.lock().unwrap().get(&pin).copied().unwrap_or(PinState::Low))
    }
}

// ── Supply voltage ────────────────────────────────────────────

/// Replays a scripted series, then holds the last value.
pub struct ScriptedSupply {
    queue: Mutex<VecDeque<f32>>,
    last: Mutex<f32>,
}

impl ScriptedSupply {
    pub fn new(initial: f32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            last: Mutex::new(initial),
        }
    }

    pub fn push(&self, volts: f32, times: usize) {
        self.queue.lock().unwrap().extend(std::iter::repeat(volts).take(times));
    }
}

impl VoltagePort for ScriptedSupply {
    fn read_supply_voltage(&self) -> Result<f32, HwError> {
        let mut last = self.last.lock().unwrap();
        if let Some(v) = self.queue.lock().unwrap().pop_front() {
            *last = v;
        }
        Ok(*last)
    }
}

// ── Probe / system / indicator ────────────────────────────────

#[derive(Default)]
pub struct MockProbe {
    pub reachable: AtomicBool,
    pub pings: AtomicU32,
}

impl NetProbePort for MockProbe {
    fn ping(&self, _: &str, _: u32) -> bool {
        self.pings.fetch_add(1, Ordering::Relaxed);
        self.reachable.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct MockSystem {
    pub restarts: AtomicU32,
    pub flushes: AtomicU32,
}

impl MockSystem {
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }
}

impl SystemPort for MockSystem {
    fn flush_logs(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct MockIndicator {
    pub shown: Mutex<Vec<IndicatorPattern>>,
}

impl MockIndicator {
    pub fn last(&self) -> Option<IndicatorPattern> {
        self.shown.lock().unwrap().last().copied()
    }
}

impl IndicatorPort for MockIndicator {
    fn show(&self, pattern: IndicatorPattern) {
        self.shown.lock().unwrap().push(pattern);
    }
}

// ── Rig ───────────────────────────────────────────────────────

pub const ADMIN: (&str, &str) = ("ops", "rack-admin");
pub const VIEWER: (&str, &str) = ("viewer", "look-only");

/// A control plane wired to mocks, plus handles to every mock.
pub struct Rig {
    pub plane: ControlPlane,
    pub clock: Arc<SimClock>,
    pub pwm: Arc<MockPwm>,
    pub gpio: Arc<MockGpio>,
    pub supply: Arc<ScriptedSupply>,
    pub probe: Arc<MockProbe>,
    pub system: Arc<MockSystem>,
    pub led: Arc<MockIndicator>,
    pub vars: Arc<VariableRegistry>,
}

/// Storage handed to the rig before start-up.
#[derive(Default)]
pub struct Media {
    pub nvs: Vec<(&'static str, &'static str, Vec<u8>)>,
    pub card: Option<MemCard>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_media(Media::default())
    }

    pub fn with_media(media: Media) -> Self {
        let clock = Arc::new(SimClock::starting_at_ms(1_000));
        let pwm = Arc::new(MockPwm::default());
        let gpio = Arc::new(MockGpio::default());
        let supply = Arc::new(ScriptedSupply::new(24.0));
        let probe = Arc::new(MockProbe::default());
        probe.reachable.store(true, Ordering::Relaxed);
        let system = Arc::new(MockSystem::default());
        let led = Arc::new(MockIndicator::default());
        let vars = Arc::new(VariableRegistry::new());

        let mut nvs = NvsAdapter::new().unwrap();
        for (ns, key, data) in &media.nvs {
            nvs.write(ns, key, data).unwrap();
        }

        let ports = Ports {
            clock: clock.clone(),
            pwm: pwm.clone(),
            gpio: gpio.clone(),
            voltage: supply.clone(),
            probe: probe.clone(),
            system: system.clone(),
            indicator: led.clone(),
            vars: vars.clone(),
            nvs: Box::new(nvs),
            sd: media.card.map(|c| Box::new(c) as Box<dyn FilePort>),
            tach: [None; FAN_COUNT],
        };
        let plane = ControlPlane::new(ports, ControllerConfig::default()).unwrap();
        plane.add_user(ADMIN.0, ADMIN.1, Level::Admin).unwrap();
        plane.add_user(VIEWER.0, VIEWER.1, Level::User).unwrap();

        Self {
            plane,
            clock,
            pwm,
            gpio,
            supply,
            probe,
            system,
            led,
            vars,
        }
    }

    pub fn admin(&self) -> u32 {
        self.plane.login(0, ADMIN.0, ADMIN.1).unwrap()
    }

    pub fn viewer(&self) -> u32 {
        self.plane.login(1, VIEWER.0, VIEWER.1).unwrap()
    }

    /// Send a request and parse the envelope.
    pub fn call(&self, method: &str, params: serde_json::Value, session: Option<u32>) -> serde_json::Value {
        let req = serde_json::json!({"method": method, "params": params}).to_string();
        serde_json::from_str(&self.plane.request(&req, session)).unwrap()
    }

    /// Feed `volts` for `ticks` policy ticks, one simulated second each.
    pub fn feed(&self, volts: f32, ticks: usize) {
        self.supply.push(volts, ticks);
        for _ in 0..ticks {
            self.clock.advance_ms(1_000);
            self.plane.policy().tick();
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.plane.shutdown();
    }
}
