//! Voltage-protection policy engine.
//!
//! Samples the rack supply once per tick and drives the policy FSM
//! ([`crate::fsm`]). Side effects requested by the state handlers
//! (events, device shutdown, fan stop, reboot, LED) run after the policy
//! lock is released, so the lock order temp → fan → power holds and no
//! event is delivered under it.
//!
//! Tick order:
//!
//! 1. voltage intake (test voltage, else the ADC; readings at or below
//!    `min_valid_voltage` are discarded)
//! 2. device status refresh
//! 3. FSM tick (transition check, then the per-state timers)
//! 4. debug tick, action execution, variable export

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};

use crate::app::ports::{
    ClockPort, IndicatorPort, NetProbePort, SystemPort, VariablePort, VoltagePort,
};
use crate::config::{
    FAN_STOP_DELAY_RANGE, POWER_POLICY_RECORD, PowerPolicyConfig, RECOVERY_HOLD_RANGE,
    SHUTDOWN_DELAY_RANGE,
};
use crate::device::{Device, DevicePower, DeviceState};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Filter, HandlerId, PowerEventKind, StorageEvent, Topic};
use crate::fan::FanController;
use crate::fsm::context::FsmContext;
use crate::fsm::{Fsm, states};
use crate::pins;
use crate::store::{ConfigStore, Tier};

pub use crate::fsm::PolicyState;
pub use crate::fsm::context::{PolicyAction, PolicyStatus};

/// Timeout for the LPMU reachability probe before shutdown.
pub const LPMU_PING_TIMEOUT_MS: u32 = 2000;

/// Names under which the policy exports its state.
pub mod vars {
    pub const STATE: &str = "power_policy.state";
    pub const VOLTAGE: &str = "power_policy.voltage";
    pub const COUNTDOWN: &str = "power_policy.countdown";
    pub const RECOVERY_TIMER: &str = "power_policy.recovery_timer";
    pub const PROTECTION_COUNT: &str = "power_policy.protection_count";
}

/// Collaborators the policy drives.
pub struct PolicyDeps {
    pub clock: Arc<dyn ClockPort>,
    pub voltage: Arc<dyn VoltagePort>,
    pub probe: Arc<dyn NetProbePort>,
    pub system: Arc<dyn SystemPort>,
    pub indicator: Arc<dyn IndicatorPort>,
    pub vars: Arc<dyn VariablePort>,
    pub devices: Arc<DevicePower>,
    pub fans: Arc<FanController>,
    pub store: Arc<ConfigStore>,
    pub bus: Arc<EventBus>,
    pub post_timeout_ms: u32,
}

struct Inner {
    fsm: Fsm,
    ctx: FsmContext,
    running: bool,
    started_ms: u64,
    test_voltage: Option<f32>,
    read_failures: u32,
    /// `Some(None)` runs until disabled.
    debug_until_ms: Option<Option<u64>>,
    reboot_requested: bool,
}

pub struct PowerPolicy {
    inner: Mutex<Inner>,
    deps: PolicyDeps,
    subscription: Mutex<Option<HandlerId>>,
}

impl PowerPolicy {
    /// Build the policy in `NORMAL`. The configured thresholds must be
    /// ordered; delay ranges apply to the runtime setters and stored
    /// records.
    pub fn new(deps: PolicyDeps, config: PowerPolicyConfig) -> Result<Self> {
        check_thresholds(config.low_voltage_threshold, config.recovery_voltage_threshold)?;
        let mut fsm = Fsm::new(states::build_state_table(), PolicyState::Normal);
        let mut ctx = FsmContext::new(config);
        fsm.start(&mut ctx);
        ctx.actions.clear();
        Ok(Self {
            inner: Mutex::new(Inner {
                fsm,
                ctx,
                running: false,
                started_ms: 0,
                test_voltage: None,
                read_failures: 0,
                debug_until_ms: None,
                reboot_requested: false,
            }),
            deps,
            subscription: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&self) {
        let now = self.deps.clock.now_ms();
        let mut inner = self.lock();
        if inner.running {
            return;
        }
        inner.running = true;
        inner.started_ms = now;
        inner.ctx.running = true;
        let cfg = inner.ctx.config;
        info!(
            "power: monitor started (low={:.2}V, recovery={:.2}V, delay={}s)",
            cfg.low_voltage_threshold, cfg.recovery_voltage_threshold, cfg.shutdown_delay_sec
        );
    }

    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.running {
            inner.running = false;
            inner.ctx.running = false;
            info!("power: monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Re-read the stored config whenever the SD card is mounted.
    pub fn watch_storage(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.deps.bus.register(
            Topic::Storage,
            Filter::Id(StorageEvent::SD_MOUNTED),
            move |_| {
                if let Some(policy) = weak.upgrade() {
                    if let Err(e) = policy.load_config() {
                        warn!("power: reload after SD mount failed: {}", e);
                    }
                }
            },
        )?;
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        Ok(())
    }

    pub fn deinit(&self) {
        self.stop();
        let id = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = id {
            let _ = self.deps.bus.unregister(id);
        }
    }

    // ── Periodic update ───────────────────────────────────────

    /// One monitor iteration. A no-op while stopped or once a reboot has
    /// been requested.
    pub fn tick(&self) {
        let test_voltage = {
            let inner = self.lock();
            if !inner.running || inner.reboot_requested {
                return;
            }
            inner.test_voltage
        };

        let raw = match test_voltage {
            Some(v) => {
                debug!("power: test mode, simulating {:.2}V", v);
                Ok(v)
            }
            None => self.deps.voltage.read_supply_voltage(),
        };
        let agx_on = self.device_on(Device::Agx);
        let lpmu_on = self.device_on(Device::Lpmu);
        let now = self.deps.clock.now_ms();

        let (actions, status) = {
            let mut inner = self.lock();
            let min_valid = inner.ctx.config.min_valid_voltage;
            let voltage = match raw {
                Ok(v) if v > min_valid || test_voltage.is_some() => {
                    if inner.read_failures > 0 {
                        info!("power: voltage reading recovered: {:.2}V", v);
                        inner.read_failures = 0;
                    }
                    Some(v)
                }
                Ok(v) => {
                    inner.read_failures += 1;
                    if inner.read_failures == 1 || inner.read_failures % 10 == 0 {
                        warn!("power: invalid voltage reading {:.2}V ({}x)", v, inner.read_failures);
                    }
                    None
                }
                Err(e) => {
                    inner.read_failures += 1;
                    if inner.read_failures == 1 || inner.read_failures % 10 == 0 {
                        warn!("power: voltage read failed ({}x): {}", inner.read_failures, e);
                    }
                    None
                }
            };

            let started = inner.started_ms;
            let Inner { fsm, ctx, .. } = &mut *inner;
            ctx.voltage = voltage;
            if let Some(v) = voltage {
                ctx.last_voltage = v;
            }
            ctx.uptime_ms = now.saturating_sub(started);
            if let Some(on) = agx_on {
                ctx.agx_powered = on;
            }
            if let Some(on) = lpmu_on {
                ctx.lpmu_powered = on;
            }
            fsm.tick(ctx);

            if let Some(until) = inner.debug_until_ms {
                match until {
                    Some(t) if now >= t => {
                        inner.debug_until_ms = None;
                        info!("power: debug mode expired");
                    }
                    _ => {
                        let c = &mut inner.ctx;
                        info!(
                            "power: [debug] {} {:.2}V countdown={} recovery={} fan_stop={}",
                            c.state.name(),
                            c.last_voltage,
                            c.countdown_sec,
                            c.recovery_timer,
                            c.fan_stop_timer
                        );
                        c.emit(PowerEventKind::DebugTick);
                    }
                }
            }

            let actions = inner.ctx.take_actions();
            if actions.contains(&PolicyAction::Reboot) {
                inner.reboot_requested = true;
            }
            (actions, inner.ctx.status())
        };

        self.execute(&actions);
        self.export(&status);
    }

    fn device_on(&self, dev: Device) -> Option<bool> {
        self.deps.devices.status(dev).ok().map(|s| s.state == DeviceState::On)
    }

    fn execute(&self, actions: &[PolicyAction]) {
        for action in actions {
            match *action {
                PolicyAction::Post(ev) => {
                    if let Err(e) = self.deps.bus.post(Event::Power(ev), self.deps.post_timeout_ms) {
                        warn!("power: event dropped: {}", e);
                    }
                }
                PolicyAction::ShutdownDevices => self.shutdown_devices(),
                PolicyAction::StopFans => {
                    if let Err(e) = self.deps.fans.stop_all() {
                        warn!("power: fan stop failed: {}", e);
                    }
                }
                PolicyAction::Reboot => self.restart(),
                PolicyAction::Indicator(pattern) => self.deps.indicator.show(pattern),
            }
        }
    }

    fn shutdown_devices(&self) {
        warn!("power: executing protective shutdown");
        let devices = &self.deps.devices;
        if devices.is_powered(Device::Agx) {
            info!("power: shutting down AGX");
            if let Err(e) = devices.power_off(Device::Agx) {
                warn!("power: AGX power off failed: {}", e);
            }
        }
        if devices.is_powered(Device::Lpmu) {
            let reachable = !self.config().lpmu_ping_before_shutdown
                || self.deps.probe.ping(pins::LPMU_ADDR, LPMU_PING_TIMEOUT_MS);
            if reachable {
                info!("power: shutting down LPMU");
                if let Err(e) = devices.power_off(Device::Lpmu) {
                    warn!("power: LPMU power off failed: {}", e);
                }
            } else {
                info!("power: LPMU not reachable at {}, skipping power off", pins::LPMU_ADDR);
            }
        }
    }

    fn restart(&self) {
        self.deps.system.flush_logs();
        self.deps.system.restart();
    }

    fn export(&self, s: &PolicyStatus) {
        let v = &self.deps.vars;
        v.publish(vars::STATE, s.state as u8 as f64);
        v.publish(vars::VOLTAGE, f64::from(s.voltage));
        v.publish(vars::COUNTDOWN, f64::from(s.countdown_sec));
        v.publish(vars::RECOVERY_TIMER, f64::from(s.recovery_timer));
        v.publish(vars::PROTECTION_COUNT, f64::from(s.protection_count));
    }

    // ── Status ────────────────────────────────────────────────

    pub fn status(&self) -> PolicyStatus {
        self.lock().ctx.status()
    }

    pub fn state(&self) -> PolicyState {
        self.lock().fsm.current_state()
    }

    pub fn config(&self) -> PowerPolicyConfig {
        self.lock().ctx.config
    }

    pub fn is_test_mode(&self) -> bool {
        self.lock().test_voltage.is_some()
    }

    pub fn is_debug_mode(&self) -> bool {
        self.lock().debug_until_ms.is_some()
    }

    // ── Commands ──────────────────────────────────────────────

    /// Simulate a brownout: the next ticks read `low − 0.5 V`.
    pub fn trigger_test(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.running {
            return Err(Error::InvalidState);
        }
        let v = inner.ctx.config.low_voltage_threshold - 0.5;
        inner.test_voltage = Some(v);
        warn!(
            "power: test mode, simulating {:.2}V (threshold {:.2}V)",
            v, inner.ctx.config.low_voltage_threshold
        );
        Ok(())
    }

    /// Override the measured voltage; `None` returns to the ADC.
    pub fn set_test_voltage(&self, voltage: Option<f32>) -> Result<()> {
        if let Some(v) = voltage {
            if !v.is_finite() || v < 0.0 {
                return Err(Error::InvalidArg("test voltage must be a non-negative number"));
            }
        }
        self.lock().test_voltage = voltage;
        Ok(())
    }

    /// Back to `NORMAL`, clear test mode, then restart the controller.
    pub fn reset(&self) -> Result<()> {
        let actions = {
            let mut inner = self.lock();
            info!("power: protection reset requested, restarting controller");
            inner.test_voltage = None;
            let Inner { fsm, ctx, .. } = &mut *inner;
            fsm.force_transition(PolicyState::Normal, ctx);
            ctx.countdown_sec = 0;
            ctx.recovery_timer = 0;
            inner.reboot_requested = true;
            inner.ctx.take_actions()
        };
        self.execute(&actions);
        self.restart();
        Ok(())
    }

    pub fn set_thresholds(&self, low: f32, recovery: f32) -> Result<()> {
        check_thresholds(low, recovery)?;
        self.update(|c| {
            c.low_voltage_threshold = low;
            c.recovery_voltage_threshold = recovery;
        });
        info!("power: thresholds set: low={:.2}V, recovery={:.2}V", low, recovery);
        Ok(())
    }

    pub fn set_shutdown_delay(&self, sec: u32) -> Result<()> {
        if !SHUTDOWN_DELAY_RANGE.contains(&sec) {
            return Err(Error::InvalidArg("shutdown_delay must be 10-600"));
        }
        self.update(|c| c.shutdown_delay_sec = sec);
        Ok(())
    }

    pub fn set_recovery_hold(&self, sec: u32) -> Result<()> {
        if !RECOVERY_HOLD_RANGE.contains(&sec) {
            return Err(Error::InvalidArg("recovery_hold must be 1-300"));
        }
        self.update(|c| c.recovery_hold_sec = sec);
        Ok(())
    }

    pub fn set_fan_stop_delay(&self, sec: u32) -> Result<()> {
        if !FAN_STOP_DELAY_RANGE.contains(&sec) {
            return Err(Error::InvalidArg("fan_stop_delay must be 10-600"));
        }
        self.update(|c| c.fan_stop_delay_sec = sec);
        Ok(())
    }

    /// Toggle the monitor and remember the choice for the next boot.
    pub fn set_enabled(&self, enable: bool) {
        self.update(|c| c.enabled = enable);
        if enable {
            self.start();
        } else {
            self.stop();
        }
    }

    /// Emit a `DebugTick` and a log line every tick. A zero duration runs
    /// until disabled.
    pub fn set_debug_mode(&self, enable: bool, duration_sec: u32) {
        let now = self.deps.clock.now_ms();
        let mut inner = self.lock();
        inner.debug_until_ms = enable
            .then(|| (duration_sec > 0).then(|| now + u64::from(duration_sec) * 1000));
        info!(
            "power: debug mode {} ({}s)",
            if enable { "on" } else { "off" },
            duration_sec
        );
    }

    fn update(&self, f: impl FnOnce(&mut PowerPolicyConfig)) {
        f(&mut self.lock().ctx.config);
    }

    // ── Persistence ───────────────────────────────────────────

    pub fn save_config(&self) -> Result<()> {
        let cfg = self.config();
        self.deps.store.save_json(POWER_POLICY_RECORD, &cfg)
    }

    /// Load thresholds and delays (SD > NVS > defaults). An invalid record
    /// is rejected and the running config kept.
    pub fn load_config(&self) -> Result<Option<Tier>> {
        let (cfg, tier) = match self.deps.store.load_json::<PowerPolicyConfig>(POWER_POLICY_RECORD) {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                info!("power: no stored config, using defaults");
                return Ok(None);
            }
            Err(e) => {
                warn!("power: failed to load config: {}", e);
                return Err(e);
            }
        };
        if let Err(e) = cfg.validate() {
            warn!("power: stored config rejected: {}", e);
            return Err(e.into());
        }
        self.lock().ctx.config = cfg;
        info!(
            "power: config loaded from {:?}: low={:.2}V, recovery={:.2}V, delay={}s",
            tier, cfg.low_voltage_threshold, cfg.recovery_voltage_threshold, cfg.shutdown_delay_sec
        );
        Ok(Some(tier))
    }
}

fn check_thresholds(low: f32, recovery: f32) -> Result<()> {
    if !low.is_finite() || !recovery.is_finite() || low <= 0.0 {
        return Err(Error::InvalidArg("thresholds must be positive numbers"));
    }
    if low >= recovery {
        return Err(Error::InvalidArg("low threshold must be below recovery threshold"));
    }
    Ok(())
}
