//! Fan controller.
//!
//! Owns up to [`FAN_COUNT`] PWM fans. Each fan runs in one of four modes:
//!
//! | Mode     | Duty source                                        |
//! |----------|----------------------------------------------------|
//! | `Off`    | 0                                                  |
//! | `Manual` | the set point from [`FanController::set_duty`]     |
//! | `Auto`   | clamped curve value, every tick                    |
//! | `Curve`  | clamped curve value, damped by hysteresis          |
//!
//! Temperature arrives two ways: `TempEvent::Updated` on the bus, and a
//! pull of the effective temperature at the start of every tick. The pull
//! happens before the fan lock is taken (lock order temp → fan).

pub mod curve;
pub mod record;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{ClockPort, PwmPort};
use crate::drivers::tach::{self, TachCounter};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Filter, HandlerId, TempEvent, Topic};
use crate::pins;
use crate::store::ConfigStore;
use crate::temp::{DEFAULT_TEMP, MIN_VALID, TempManager};

pub use curve::{Curve, CurvePoint, MAX_CURVE_POINTS};
use record::{FanRecord, NVS_NAMESPACE, RECORD_VERSION};

pub const FAN_COUNT: usize = pins::FAN_COUNT;

pub const DEFAULT_MIN_DUTY: u8 = 20;
pub const DEFAULT_MAX_DUTY: u8 = 100;
/// 3.0 °C.
pub const DEFAULT_HYSTERESIS: i16 = 30;
pub const DEFAULT_MIN_INTERVAL_MS: u32 = 2000;

pub const HYSTERESIS_RANGE: core::ops::RangeInclusive<i16> = 0..=200;
pub const MIN_INTERVAL_RANGE: core::ops::RangeInclusive<u32> = 100..=60_000;

// ── Types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanMode {
    Off,
    Manual,
    Auto,
    Curve,
}

impl FanMode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Curve => "curve",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            "curve" => Some(Self::Curve),
            _ => None,
        }
    }

    const fn follows_temperature(self) -> bool {
        matches!(self, Self::Auto | Self::Curve)
    }
}

/// Tachometer input wired to a fan.
#[derive(Debug, Clone, Copy)]
pub struct Tach {
    pub gpio: i32,
    pub counter: &'static TachCounter,
}

/// Hardware binding passed to [`FanController::configure`].
#[derive(Debug, Clone, Copy)]
pub struct FanHwConfig {
    pub pwm_channel: u8,
    pub pwm_gpio: i32,
    pub tach: Option<Tach>,
    pub invert_pwm: bool,
}

impl FanHwConfig {
    /// Board wiring for fan `id`.
    pub fn board(id: usize, counter: Option<&'static TachCounter>) -> Self {
        let tach_gpio = pins::FAN_TACH_GPIO[id];
        Self {
            pwm_channel: id as u8,
            pwm_gpio: pins::FAN_PWM_GPIO[id],
            tach: counter
                .filter(|_| pins::is_wired(tach_gpio))
                .map(|counter| Tach { gpio: tach_gpio, counter }),
            invert_pwm: false,
        }
    }
}

/// Tunables that survive a reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanSettings {
    pub curve: Curve,
    pub min_duty: u8,
    pub max_duty: u8,
    /// 0.1 °C.
    pub hysteresis: i16,
    pub min_interval_ms: u32,
    pub invert_pwm: bool,
}

impl Default for FanSettings {
    fn default() -> Self {
        Self {
            curve: curve::default_curve(),
            min_duty: DEFAULT_MIN_DUTY,
            max_duty: DEFAULT_MAX_DUTY,
            hysteresis: DEFAULT_HYSTERESIS,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            invert_pwm: false,
        }
    }
}

impl FanSettings {
    fn duty_for(&self, temp: i16) -> u8 {
        curve::duty_for(&self.curve, temp, self.min_duty, self.max_duty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanStatus {
    pub id: u8,
    pub mode: FanMode,
    /// Set point.
    pub duty: u8,
    /// Last value written to the output (before inversion).
    pub applied_duty: u8,
    pub target_duty: u8,
    pub rpm: u32,
    /// 0.1 °C.
    pub temperature: i16,
    pub last_stable_temp: i16,
    pub enabled: bool,
    pub running: bool,
    pub fault: bool,
}

struct Fan {
    configured: bool,
    enabled: bool,
    mode: FanMode,
    current_duty: u8,
    applied_duty: u8,
    target_duty: u8,
    rpm: u32,
    temperature: i16,
    last_stable_temp: i16,
    last_speed_change_ms: u64,
    fault: bool,
    pwm_failures: u32,
    channel: u8,
    tach: Option<Tach>,
    last_tach_us: u64,
    settings: FanSettings,
}

impl Fan {
    fn new() -> Self {
        Self {
            configured: false,
            enabled: true,
            mode: FanMode::Off,
            current_duty: 0,
            applied_duty: 0,
            target_duty: 0,
            rpm: 0,
            temperature: DEFAULT_TEMP,
            last_stable_temp: DEFAULT_TEMP,
            last_speed_change_ms: 0,
            fault: false,
            pwm_failures: 0,
            channel: 0,
            tach: None,
            last_tach_us: 0,
            settings: FanSettings::default(),
        }
    }

    fn record(&self) -> FanRecord {
        FanRecord {
            version: RECORD_VERSION,
            mode: self.mode,
            duty: self.current_duty,
            enabled: self.enabled,
            curve: self.settings.curve.clone(),
            hysteresis: self.settings.hysteresis,
            min_interval_ms: self.settings.min_interval_ms,
            min_duty: self.settings.min_duty,
            max_duty: self.settings.max_duty,
            invert_pwm: self.settings.invert_pwm,
        }
    }

    fn restore(&mut self, rec: FanRecord) {
        self.mode = rec.mode;
        self.current_duty = rec.duty;
        self.enabled = rec.enabled;
        self.settings = FanSettings {
            curve: rec.curve,
            min_duty: rec.min_duty,
            max_duty: rec.max_duty,
            hysteresis: rec.hysteresis,
            min_interval_ms: rec.min_interval_ms,
            invert_pwm: rec.invert_pwm,
        };
    }

    fn status(&self, id: usize) -> FanStatus {
        FanStatus {
            id: id as u8,
            mode: self.mode,
            duty: self.current_duty,
            applied_duty: self.applied_duty,
            target_duty: self.target_duty,
            rpm: self.rpm,
            temperature: self.temperature,
            last_stable_temp: self.last_stable_temp,
            enabled: self.enabled,
            running: self.enabled && self.applied_duty > 0,
            fault: self.fault,
        }
    }
}

// ── Controller ────────────────────────────────────────────────

pub struct FanController {
    fans: Mutex<[Fan; FAN_COUNT]>,
    pwm: Arc<dyn PwmPort>,
    clock: Arc<dyn ClockPort>,
    temp: Arc<TempManager>,
    store: Arc<ConfigStore>,
    bus: Arc<EventBus>,
    auto_temp: AtomicBool,
    subscription: Mutex<Option<HandlerId>>,
}

impl FanController {
    pub fn new(
        pwm: Arc<dyn PwmPort>,
        clock: Arc<dyn ClockPort>,
        temp: Arc<TempManager>,
        store: Arc<ConfigStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            fans: Mutex::new(core::array::from_fn(|_| Fan::new())),
            pwm,
            clock,
            temp,
            store,
            bus,
            auto_temp: AtomicBool::new(true),
            subscription: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [Fan; FAN_COUNT]> {
        self.fans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on a configured fan.
    fn with_fan<R>(&self, id: usize, f: impl FnOnce(&mut Fan) -> Result<R>) -> Result<R> {
        if id >= FAN_COUNT {
            return Err(Error::InvalidArg("Invalid fan ID"));
        }
        let mut fans = self.lock();
        let fan = &mut fans[id];
        if !fan.configured {
            return Err(Error::InvalidState);
        }
        f(fan)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Follow `TempEvent::Updated` on the bus.
    pub fn subscribe(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.bus.register(Topic::Temp, Filter::Id(TempEvent::UPDATED), move |ev| {
            if let (Some(ctl), Event::Temp(TempEvent::Updated(u))) = (weak.upgrade(), ev) {
                ctl.on_temperature(u.temp);
            }
        })?;
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        Ok(())
    }

    /// Drop the bus subscription. Must run before the bus shuts down.
    pub fn deinit(&self) {
        let id = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = id {
            if let Err(e) = self.bus.unregister(id) {
                warn!("fan: unsubscribe failed: {}", e);
            }
        }
    }

    fn on_temperature(&self, temp: i16) {
        if !self.auto_temp.load(Ordering::Relaxed) {
            return;
        }
        for (i, fan) in self.lock().iter_mut().enumerate() {
            if fan.configured && fan.mode.follows_temperature() {
                fan.temperature = temp;
                debug!("fan[{}]: temperature {}", i, temp);
            }
        }
    }

    /// Bind fan `id` to its PWM channel and tachometer. The fan starts
    /// enabled in `Manual` at its minimum duty.
    pub fn configure(&self, id: usize, hw: FanHwConfig) -> Result<()> {
        if id >= FAN_COUNT {
            return Err(Error::InvalidArg("Invalid fan ID"));
        }
        if let Err(e) = self.pwm.configure(
            hw.pwm_channel,
            hw.pwm_gpio,
            pins::FAN_PWM_FREQ_HZ,
            pins::FAN_PWM_RESOLUTION_BITS,
        ) {
            warn!("fan[{}]: PWM setup on GPIO{} failed: {}", id, hw.pwm_gpio, e);
            return Err(e.into());
        }
        if let Some(t) = hw.tach {
            tach::attach_isr(t.gpio, t.counter)?;
            t.counter.take();
        }

        let now_us = self.clock.now_us();
        let mut fans = self.lock();
        let fan = &mut fans[id];
        fan.configured = true;
        fan.enabled = true;
        fan.mode = FanMode::Manual;
        fan.fault = false;
        fan.pwm_failures = 0;
        fan.channel = hw.pwm_channel;
        fan.tach = hw.tach;
        fan.last_tach_us = now_us;
        fan.settings.invert_pwm = hw.invert_pwm;
        fan.current_duty = fan.settings.min_duty;
        info!(
            "fan[{}]: PWM=GPIO{} CH{}, tach={}, curve={} points",
            id,
            hw.pwm_gpio,
            hw.pwm_channel,
            hw.tach.map_or(-1, |t| t.gpio),
            fan.settings.curve.len()
        );
        Ok(())
    }

    pub fn is_configured(&self, id: usize) -> bool {
        id < FAN_COUNT && self.lock()[id].configured
    }

    // ── Control ───────────────────────────────────────────────

    /// Switching to `Off` drives the output to 0 at once.
    pub fn set_mode(&self, id: usize, mode: FanMode) -> Result<()> {
        self.with_fan(id, |fan| {
            fan.mode = mode;
            info!("fan[{}]: mode {}", id, mode.name());
            if mode == FanMode::Off {
                self.write(id, fan, 0)
            } else {
                Ok(())
            }
        })
    }

    pub fn mode(&self, id: usize) -> Result<FanMode> {
        self.with_fan(id, |fan| Ok(fan.mode))
    }

    /// Switch to `Manual` and apply `duty` (clamped to 100).
    pub fn set_duty(&self, id: usize, duty: u8) -> Result<()> {
        let duty = duty.min(100);
        self.with_fan(id, |fan| {
            fan.mode = FanMode::Manual;
            fan.current_duty = duty;
            fan.target_duty = duty;
            self.write(id, fan, duty)
        })
    }

    pub fn enable(&self, id: usize, enable: bool) -> Result<()> {
        self.with_fan(id, |fan| {
            fan.enabled = enable;
            info!("fan[{}]: {}", id, if enable { "enabled" } else { "disabled" });
            if !enable {
                self.write(id, fan, 0)
            } else if fan.mode == FanMode::Manual {
                let duty = fan.current_duty;
                self.write(id, fan, duty)
            } else {
                Ok(())
            }
        })
    }

    pub fn is_enabled(&self, id: usize) -> Result<bool> {
        self.with_fan(id, |fan| Ok(fan.enabled))
    }

    /// Feed a temperature directly (0.1 °C).
    pub fn set_temperature(&self, id: usize, temp: i16) -> Result<()> {
        self.with_fan(id, |fan| {
            fan.temperature = temp;
            Ok(())
        })
    }

    /// Replace the curve. Points are sorted by temperature.
    pub fn set_curve(&self, id: usize, points: &[CurvePoint]) -> Result<()> {
        let curve = curve::build(points)?;
        self.with_fan(id, |fan| {
            info!("fan[{}]: curve set with {} points", id, curve.len());
            fan.settings.curve = curve;
            Ok(())
        })
    }

    /// `hysteresis` in 0.1 °C.
    pub fn set_hysteresis(&self, id: usize, hysteresis: i16, min_interval_ms: u32) -> Result<()> {
        if !HYSTERESIS_RANGE.contains(&hysteresis) {
            return Err(Error::InvalidArg("Hysteresis must be 0-200"));
        }
        if !MIN_INTERVAL_RANGE.contains(&min_interval_ms) {
            return Err(Error::InvalidArg("Min interval must be 100-60000 ms"));
        }
        self.with_fan(id, |fan| {
            fan.settings.hysteresis = hysteresis;
            fan.settings.min_interval_ms = min_interval_ms;
            info!(
                "fan[{}]: hysteresis {:.1}\u{00b0}C, interval {}ms",
                id,
                f32::from(hysteresis) / 10.0,
                min_interval_ms
            );
            Ok(())
        })
    }

    /// Re-clamps the current set point into the new window.
    pub fn set_limits(&self, id: usize, min_duty: u8, max_duty: u8) -> Result<()> {
        if min_duty > 100 || max_duty > 100 {
            return Err(Error::InvalidArg("Duty limits must be 0-100"));
        }
        if min_duty > max_duty {
            return Err(Error::InvalidArg("min_duty must not exceed max_duty"));
        }
        self.with_fan(id, |fan| {
            fan.settings.min_duty = min_duty;
            fan.settings.max_duty = max_duty;
            fan.current_duty = curve::clamp_duty(fan.current_duty, min_duty, max_duty);
            info!("fan[{}]: limits {}%..{}%", id, min_duty, max_duty);
            Ok(())
        })
    }

    pub fn settings(&self, id: usize) -> Result<FanSettings> {
        self.with_fan(id, |fan| Ok(fan.settings.clone()))
    }

    /// Gate both temperature inputs (bus events and the per-tick pull).
    pub fn set_auto_temp(&self, enable: bool) {
        self.auto_temp.store(enable, Ordering::Relaxed);
        info!("fan: automatic temperature {}", if enable { "on" } else { "off" });
    }

    pub fn is_auto_temp(&self) -> bool {
        self.auto_temp.load(Ordering::Relaxed)
    }

    /// All configured fans to `Manual` 100 %, enabled.
    pub fn emergency_full(&self) -> Result<()> {
        warn!("fan: emergency, all fans to 100%");
        self.for_each_configured(|id, fan| {
            fan.mode = FanMode::Manual;
            fan.enabled = true;
            fan.current_duty = 100;
            fan.target_duty = 100;
            self.write(id, fan, 100)
        })
    }

    /// All configured fans to `Off`.
    pub fn stop_all(&self) -> Result<()> {
        info!("fan: stopping all fans");
        self.for_each_configured(|id, fan| {
            fan.mode = FanMode::Off;
            fan.target_duty = 0;
            self.write(id, fan, 0)
        })
    }

    /// Apply `f` to every configured fan; returns the first error after
    /// visiting all of them.
    fn for_each_configured(&self, mut f: impl FnMut(usize, &mut Fan) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for (id, fan) in self.lock().iter_mut().enumerate() {
            if fan.configured {
                if let Err(e) = f(id, fan) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ── Status ────────────────────────────────────────────────

    /// Refreshes the temperature of `Auto`/`Curve` fans and reports the
    /// duty the curve currently asks for.
    pub fn get_status(&self, id: usize) -> Result<FanStatus> {
        let effective = self.pull_temperature();
        self.with_fan(id, |fan| {
            refresh_target(fan, effective);
            Ok(fan.status(id))
        })
    }

    /// Status of every configured fan.
    pub fn get_all_status(&self) -> Vec<FanStatus> {
        let effective = self.pull_temperature();
        self.lock()
            .iter_mut()
            .enumerate()
            .filter(|(_, f)| f.configured)
            .map(|(id, fan)| {
                refresh_target(fan, effective);
                fan.status(id)
            })
            .collect()
    }

    // ── Periodic update ───────────────────────────────────────

    /// One control-loop iteration.
    pub fn tick(&self) {
        let effective = self.pull_temperature();
        let now_ms = self.clock.now_ms();
        let now_us = self.clock.now_us();

        let mut fans = self.lock();
        for (id, fan) in fans.iter_mut().enumerate() {
            if !fan.configured {
                continue;
            }
            if let Some(t) = effective {
                if fan.mode.follows_temperature() {
                    fan.temperature = t;
                }
            }

            if let Some(t) = fan.tach {
                let dt_us = now_us.saturating_sub(fan.last_tach_us);
                if dt_us > 0 {
                    fan.rpm = tach::rpm_from_pulses(t.counter.take(), dt_us);
                    fan.last_tach_us = now_us;
                }
            }

            let duty = if fan.enabled { self.step(id, fan, now_ms) } else { 0 };
            // Failures are counted and logged inside write().
            let _ = self.write(id, fan, duty);
        }
    }

    /// Duty the current mode asks for this tick.
    fn step(&self, id: usize, fan: &mut Fan, now_ms: u64) -> u8 {
        match fan.mode {
            FanMode::Off => 0,
            FanMode::Manual => fan.current_duty,
            FanMode::Auto => {
                let target = fan.settings.duty_for(fan.temperature);
                fan.target_duty = target;
                fan.current_duty = target;
                target
            }
            FanMode::Curve => {
                let target = fan.settings.duty_for(fan.temperature);
                fan.target_duty = target;
                let delta = (i32::from(fan.temperature) - i32::from(fan.last_stable_temp)).abs();
                let settled = now_ms.saturating_sub(fan.last_speed_change_ms)
                    >= u64::from(fan.settings.min_interval_ms);
                if delta >= i32::from(fan.settings.hysteresis)
                    && settled
                    && target != fan.current_duty
                {
                    debug!(
                        "fan[{}]: {}% -> {}% at {} (stable {})",
                        id, fan.current_duty, target, fan.temperature, fan.last_stable_temp
                    );
                    fan.current_duty = target;
                    fan.last_stable_temp = fan.temperature;
                    fan.last_speed_change_ms = now_ms;
                }
                fan.current_duty
            }
        }
    }

    /// Effective temperature when automatic intake is on and the value is
    /// usable. Called without the fan lock held.
    fn pull_temperature(&self) -> Option<i16> {
        if !self.is_auto_temp() {
            return None;
        }
        let t = self.temp.get_effective().value;
        (t > MIN_VALID).then_some(t)
    }

    /// Drive the output. Disabled and `Off` fans always get 0.
    fn write(&self, id: usize, fan: &mut Fan, duty: u8) -> Result<()> {
        let duty = if fan.enabled && fan.mode != FanMode::Off { duty.min(100) } else { 0 };
        let raw = if fan.settings.invert_pwm { 100 - duty } else { duty };
        match self.pwm.set_duty(fan.channel, raw) {
            Ok(()) => {
                if fan.pwm_failures > 0 {
                    info!("fan[{}]: PWM recovered after {} failure(s)", id, fan.pwm_failures);
                    fan.pwm_failures = 0;
                }
                fan.applied_duty = duty;
                Ok(())
            }
            Err(e) => {
                fan.fault = true;
                fan.pwm_failures += 1;
                if fan.pwm_failures == 1 || fan.pwm_failures % 10 == 0 {
                    warn!("fan[{}]: PWM write failed ({}x): {}", id, fan.pwm_failures, e);
                }
                Err(e.into())
            }
        }
    }

    // ── Persistence ───────────────────────────────────────────

    /// Persist every configured fan. Returns the first failure after
    /// attempting all of them.
    pub fn save_config(&self) -> Result<()> {
        let records: Vec<(usize, FanRecord)> = self
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.configured)
            .map(|(id, f)| (id, f.record()))
            .collect();

        let mut first_err = None;
        for (id, rec) in records {
            let result = rec
                .encode()
                .map_err(Error::from)
                .and_then(|bytes| self.store.write_blob(NVS_NAMESPACE, &record::key(id), &bytes));
            match result {
                Ok(()) => info!(
                    "fan[{}]: saved mode={} duty={}% curve={} points",
                    id,
                    rec.mode.name(),
                    rec.duty,
                    rec.curve.len()
                ),
                Err(e) => {
                    warn!("fan[{}]: save failed: {}", id, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Restore configured fans from NVS. Records with another version or
    /// a bad layout are skipped. Returns the number restored.
    pub fn load_config(&self) -> Result<usize> {
        let mut restored = 0;
        for id in 0..FAN_COUNT {
            if !self.is_configured(id) {
                continue;
            }
            let bytes = match self.store.read_blob(NVS_NAMESPACE, &record::key(id)) {
                Ok(b) => b,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!("fan[{}]: load failed: {}", id, e);
                    continue;
                }
            };
            let rec = match FanRecord::decode(&bytes) {
                Ok(r) => r,
                Err(e) => {
                    warn!("fan[{}]: stored config skipped: {}", id, e);
                    continue;
                }
            };

            let mut fans = self.lock();
            let fan = &mut fans[id];
            let manual_duty = (rec.mode == FanMode::Manual).then_some(rec.duty);
            info!(
                "fan[{}]: restored mode={} duty={}% curve={} points",
                id,
                rec.mode.name(),
                rec.duty,
                rec.curve.len()
            );
            fan.restore(rec);
            if let Some(duty) = manual_duty {
                let _ = self.write(id, fan, duty);
            }
            restored += 1;
        }
        Ok(restored)
    }
}

fn refresh_target(fan: &mut Fan, effective: Option<i16>) {
    match (fan.mode.follows_temperature(), effective) {
        (true, Some(t)) => {
            fan.temperature = t;
            fan.target_duty = fan.settings.duty_for(t);
        }
        _ => fan.target_duty = fan.current_duty,
    }
}
