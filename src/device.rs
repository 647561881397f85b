//! Device-power facade for the downstream compute modules.
//!
//! | Device | Power                          | Reset             | Extra                  |
//! |--------|--------------------------------|-------------------|------------------------|
//! | AGX    | level pin, LOW = on            | HIGH pulse 1000ms | force-recovery strap   |
//! | LPMU   | toggle pulse HIGH 300ms        | HIGH pulse 300ms  | reachable over network |
//!
//! State is tracked in software; the boards expose no reliable power-good
//! line, so `power_good` falls back to "state is on" when the pin is not
//! wired. Every state change is posted as `DeviceMonEvent::StateChanged`
//! after the facade lock is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};

use crate::app::ports::{ClockPort, GpioPort, HwError, PinState};
use crate::error::{Error, Result};
use crate::events::{DeviceMonEvent, Event, EventBus};
use crate::pins;

pub const AGX_RESET_PULSE_MS: u32 = 1000;
pub const AGX_POWER_PULSE_MS: u32 = 500;
pub const AGX_POWER_ON_SETTLE_MS: u32 = 100;
pub const AGX_RECOVERY_HOLD_MS: u32 = 1000;
pub const LPMU_POWER_PULSE_MS: u32 = 300;
pub const LPMU_RESET_PULSE_MS: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Agx,
    Lpmu,
}

impl Device {
    pub const ALL: [Device; 2] = [Self::Agx, Self::Lpmu];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Agx => "agx",
            Self::Lpmu => "lpmu",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agx" => Some(Self::Agx),
            "lpmu" => Some(Self::Lpmu),
            _ => None,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Off,
    Standby,
    On,
    Booting,
    Recovery,
    Error,
}

impl DeviceState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Standby => "standby",
            Self::On => "on",
            Self::Booting => "booting",
            Self::Recovery => "recovery",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub device: Device,
    pub state: DeviceState,
    pub power_good: bool,
    /// Time since the last power-on while `On`, else 0.
    pub uptime_ms: u64,
    pub boot_count: u32,
}

/// GPIO assignment for the AGX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgxPins {
    pub power: i32,
    pub reset: i32,
    pub force_recovery: i32,
    pub power_good: i32,
}

/// GPIO assignment for the LPMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LpmuPins {
    pub power: i32,
    pub reset: i32,
}

impl Default for AgxPins {
    fn default() -> Self {
        Self {
            power: pins::AGX_POWER_GPIO,
            reset: pins::AGX_RESET_GPIO,
            force_recovery: pins::AGX_FORCE_RECOVERY_GPIO,
            power_good: pins::AGX_POWER_GOOD_GPIO,
        }
    }
}

impl Default for LpmuPins {
    fn default() -> Self {
        Self {
            power: pins::LPMU_POWER_GPIO,
            reset: pins::LPMU_RESET_GPIO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    configured: bool,
    state: DeviceState,
    power_on_ms: u64,
    boot_count: u32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            configured: false,
            state: DeviceState::Off,
            power_on_ms: 0,
            boot_count: 0,
        }
    }
}

struct Inner {
    slots: [Slot; 2],
    agx: AgxPins,
    lpmu: LpmuPins,
    /// State changes to post once the lock is released.
    changes: Vec<(Device, DeviceState, DeviceState)>,
}

impl Inner {
    fn set_state(&mut self, dev: Device, to: DeviceState) {
        let slot = &mut self.slots[dev.index()];
        let from = slot.state;
        if from != to {
            slot.state = to;
            self.changes.push((dev, from, to));
        }
    }
}

pub struct DevicePower {
    inner: Mutex<Inner>,
    gpio: Arc<dyn GpioPort>,
    clock: Arc<dyn ClockPort>,
    bus: Arc<EventBus>,
    post_timeout_ms: u32,
}

impl DevicePower {
    pub fn new(
        gpio: Arc<dyn GpioPort>,
        clock: Arc<dyn ClockPort>,
        bus: Arc<EventBus>,
        post_timeout_ms: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: [Slot::new(); 2],
                agx: AgxPins::default(),
                lpmu: LpmuPins::default(),
                changes: Vec::new(),
            }),
            gpio,
            clock,
            bus,
            post_timeout_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive the AGX straps to their idle levels: power HIGH (off), reset
    /// and force-recovery LOW. The AGX stays off until powered on.
    pub fn configure_agx(&self, pins: AgxPins) -> Result<()> {
        if !pins::is_wired(pins.power) {
            return Err(Error::InvalidArg("AGX power pin not wired"));
        }
        self.gpio.configure_output(pins.power, PinState::High)?;
        self.configure_idle_low(pins.reset)?;
        self.configure_idle_low(pins.force_recovery)?;
        if pins::is_wired(pins.power_good) {
            self.gpio.configure_input(pins.power_good)?;
        }
        let mut inner = self.lock();
        inner.agx = pins;
        inner.slots[Device::Agx.index()] = Slot { configured: true, ..Slot::new() };
        info!(
            "device: AGX configured (power={} HIGH=off, reset={}, recovery={})",
            pins.power, pins.reset, pins.force_recovery
        );
        Ok(())
    }

    /// Both LPMU lines idle LOW.
    pub fn configure_lpmu(&self, pins: LpmuPins) -> Result<()> {
        self.configure_idle_low(pins.power)?;
        self.configure_idle_low(pins.reset)?;
        let mut inner = self.lock();
        inner.lpmu = pins;
        inner.slots[Device::Lpmu.index()] = Slot { configured: true, ..Slot::new() };
        info!("device: LPMU configured (power={}, reset={})", pins.power, pins.reset);
        Ok(())
    }

    fn configure_idle_low(&self, pin: i32) -> Result<()> {
        if pins::is_wired(pin) {
            self.gpio.configure_output(pin, PinState::Low)?;
        }
        Ok(())
    }

    pub fn is_configured(&self, dev: Device) -> bool {
        self.lock().slots[dev.index()].configured
    }

    // ── Operations ────────────────────────────────────────────

    pub fn power_on(&self, dev: Device) -> Result<()> {
        self.run(dev, |inner| match dev {
            Device::Agx => self.agx_power_on(inner),
            Device::Lpmu => self.lpmu_power(inner, true),
        })
    }

    /// Graceful power-off.
    pub fn power_off(&self, dev: Device) -> Result<()> {
        self.run(dev, |inner| match dev {
            Device::Agx => self.agx_power_off(inner),
            Device::Lpmu => self.lpmu_power(inner, false),
        })
    }

    /// AGX: hold the force-recovery strap like a long button press, then
    /// cut power. LPMU has no forced path and powers off normally.
    pub fn force_off(&self, dev: Device) -> Result<()> {
        self.run(dev, |inner| match dev {
            Device::Agx => {
                warn!("device: AGX force power off");
                self.pulse(inner.agx.force_recovery, AGX_POWER_PULSE_MS)?;
                self.agx_power_off(inner)
            }
            Device::Lpmu => self.lpmu_power(inner, false),
        })
    }

    pub fn toggle(&self, dev: Device) -> Result<()> {
        if self.is_powered(dev) {
            self.power_off(dev)
        } else {
            self.power_on(dev)
        }
    }

    pub fn reset(&self, dev: Device) -> Result<()> {
        self.run(dev, |inner| {
            let (pin, width) = match dev {
                Device::Agx => (inner.agx.reset, AGX_RESET_PULSE_MS),
                Device::Lpmu => (inner.lpmu.reset, LPMU_RESET_PULSE_MS),
            };
            info!("device: {} resetting", dev.name());
            self.pulse(pin, width)?;
            let slot = &mut inner.slots[dev.index()];
            slot.boot_count = slot.boot_count.wrapping_add(1);
            let boot = slot.boot_count;
            inner.set_state(dev, DeviceState::Booting);
            info!("device: {} reset complete (boot #{})", dev.name(), boot);
            Ok(())
        })
    }

    /// AGX only: strap HIGH, hold, reset pulse, hold, release.
    pub fn enter_recovery(&self, dev: Device) -> Result<()> {
        if dev != Device::Agx {
            warn!("device: recovery mode only supported for AGX");
            return Err(Error::NotSupported);
        }
        self.run(dev, |inner| {
            info!("device: AGX entering recovery mode");
            let strap = inner.agx.force_recovery;
            self.set_level(strap, PinState::High)?;
            self.clock.sleep_ms(AGX_RECOVERY_HOLD_MS);
            let result = self.pulse(inner.agx.reset, AGX_RESET_PULSE_MS);
            if result.is_ok() {
                self.clock.sleep_ms(AGX_RECOVERY_HOLD_MS);
            }
            self.set_level(strap, PinState::Low)?;
            result?;
            let slot = &mut inner.slots[Device::Agx.index()];
            slot.boot_count = slot.boot_count.wrapping_add(1);
            inner.set_state(Device::Agx, DeviceState::Recovery);
            Ok(())
        })
    }

    pub fn status(&self, dev: Device) -> Result<DeviceStatus> {
        let (slot, pg_pin) = {
            let inner = self.lock();
            (inner.slots[dev.index()], inner.agx.power_good)
        };
        if !slot.configured {
            return Err(Error::InvalidState);
        }
        let power_good = match dev {
            Device::Agx if pins::is_wired(pg_pin) => {
                self.gpio.read(pg_pin).map(|l| l == PinState::High).unwrap_or(false)
            }
            _ => slot.state == DeviceState::On,
        };
        let uptime_ms = if slot.state == DeviceState::On && slot.power_on_ms > 0 {
            self.clock.now_ms().saturating_sub(slot.power_on_ms)
        } else {
            0
        };
        Ok(DeviceStatus {
            device: dev,
            state: slot.state,
            power_good,
            uptime_ms,
            boot_count: slot.boot_count,
        })
    }

    /// AGX counts as powered in `On` and `Recovery`; LPMU only in `On`.
    pub fn is_powered(&self, dev: Device) -> bool {
        let state = self.lock().slots[dev.index()].state;
        match dev {
            Device::Agx => matches!(state, DeviceState::On | DeviceState::Recovery),
            Device::Lpmu => state == DeviceState::On,
        }
    }

    // ── Internal ──────────────────────────────────────────────

    /// Run `op` under the facade lock, then post the state changes it made.
    /// A hardware failure leaves the device in `Error`.
    fn run(&self, dev: Device, op: impl FnOnce(&mut Inner) -> Result<()>) -> Result<()> {
        let (result, changes) = {
            let mut inner = self.lock();
            if !inner.slots[dev.index()].configured {
                return Err(Error::InvalidState);
            }
            let result = op(&mut inner);
            if let Err(e @ Error::Hardware(_)) = result {
                warn!("device: {} operation failed: {}", dev.name(), e);
                inner.set_state(dev, DeviceState::Error);
            }
            (result, core::mem::take(&mut inner.changes))
        };
        for (device, from, to) in changes {
            let ev = Event::DeviceMon(DeviceMonEvent::StateChanged { device, from, to });
            if let Err(e) = self.bus.post(ev, self.post_timeout_ms) {
                warn!("device: state event dropped: {}", e);
            }
        }
        result
    }

    fn agx_power_on(&self, inner: &mut Inner) -> Result<()> {
        if inner.slots[Device::Agx.index()].state == DeviceState::On {
            info!("device: AGX already on");
            return Ok(());
        }
        inner.set_state(Device::Agx, DeviceState::Booting);
        self.gpio.write(inner.agx.power, PinState::Low)?;
        self.clock.sleep_ms(AGX_POWER_ON_SETTLE_MS);
        let now = self.clock.now_ms();
        let slot = &mut inner.slots[Device::Agx.index()];
        slot.power_on_ms = now;
        slot.boot_count = slot.boot_count.wrapping_add(1);
        let boot = slot.boot_count;
        inner.set_state(Device::Agx, DeviceState::On);
        info!("device: AGX powered on (GPIO{} LOW, boot #{})", inner.agx.power, boot);
        Ok(())
    }

    fn agx_power_off(&self, inner: &mut Inner) -> Result<()> {
        self.gpio.write(inner.agx.power, PinState::High)?;
        inner.set_state(Device::Agx, DeviceState::Off);
        info!("device: AGX powered off (GPIO{} HIGH)", inner.agx.power);
        Ok(())
    }

    /// The LPMU button toggles, so a request matching the tracked state
    /// is a no-op.
    fn lpmu_power(&self, inner: &mut Inner, on: bool) -> Result<()> {
        let state = inner.slots[Device::Lpmu.index()].state;
        if on && state == DeviceState::On || !on && state == DeviceState::Off {
            return Ok(());
        }
        if on {
            inner.set_state(Device::Lpmu, DeviceState::Booting);
        }
        self.pulse(inner.lpmu.power, LPMU_POWER_PULSE_MS)?;
        if on {
            let now = self.clock.now_ms();
            let slot = &mut inner.slots[Device::Lpmu.index()];
            slot.power_on_ms = now;
            slot.boot_count = slot.boot_count.wrapping_add(1);
            inner.set_state(Device::Lpmu, DeviceState::On);
        } else {
            inner.set_state(Device::Lpmu, DeviceState::Off);
        }
        info!("device: LPMU powered {}", if on { "on" } else { "off" });
        Ok(())
    }

    /// HIGH for `width_ms`, then LOW. Unwired pins are skipped.
    fn pulse(&self, pin: i32, width_ms: u32) -> Result<()> {
        if !pins::is_wired(pin) {
            return Ok(());
        }
        self.gpio.write(pin, PinState::High)?;
        self.clock.sleep_ms(width_ms);
        self.gpio.write(pin, PinState::Low).map_err(Error::from)
    }

    fn set_level(&self, pin: i32, level: PinState) -> core::result::Result<(), HwError> {
        if pins::is_wired(pin) {
            self.gpio.write(pin, level)
        } else {
            Ok(())
        }
    }
}
