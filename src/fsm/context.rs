//! Shared mutable context threaded through every policy handler.
//!
//! Handlers never touch hardware. They update counters and append
//! [`PolicyAction`]s; the power policy executes those after releasing
//! its lock, so device pulses and event delivery never run under it.

use crate::app::ports::IndicatorPattern;
use crate::config::PowerPolicyConfig;
use crate::events::{PowerEvent, PowerEventKind};

use super::PolicyState;

/// Status snapshot carried by every power event and returned by
/// `PowerPolicy::status`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyStatus {
    pub running: bool,
    pub state: PolicyState,
    /// Last valid supply reading (V).
    pub voltage: f32,
    pub countdown_sec: u32,
    pub recovery_timer: u32,
    pub fan_stop_timer: u32,
    pub fans_stopped: bool,
    pub protection_count: u32,
    pub uptime_ms: u64,
    pub agx_powered: bool,
    pub lpmu_powered: bool,
}

/// Side effect requested by a handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyAction {
    Post(PowerEvent),
    /// Graceful shutdown of the downstream devices.
    ShutdownDevices,
    StopFans,
    Reboot,
    Indicator(IndicatorPattern),
}

pub struct FsmContext {
    // -- Timing --
    pub ticks_in_state: u64,
    pub total_ticks: u64,

    // -- Inputs (refreshed before each tick) --
    /// This tick's reading; `None` when the measurement was invalid.
    pub voltage: Option<f32>,
    pub last_voltage: f32,
    pub running: bool,
    pub uptime_ms: u64,
    pub agx_powered: bool,
    pub lpmu_powered: bool,

    pub config: PowerPolicyConfig,

    // -- Policy state --
    pub state: PolicyState,
    /// State left by the most recent transition.
    pub prev_state: PolicyState,
    pub countdown_sec: u32,
    pub recovery_timer: u32,
    pub fan_stop_timer: u32,
    pub fans_stopped: bool,
    pub protection_count: u32,

    // -- Outputs --
    pub actions: Vec<PolicyAction>,
}

impl FsmContext {
    pub fn new(config: PowerPolicyConfig) -> Self {
        Self {
            ticks_in_state: 0,
            total_ticks: 0,
            voltage: None,
            last_voltage: 0.0,
            running: false,
            uptime_ms: 0,
            agx_powered: false,
            lpmu_powered: false,
            config,
            state: PolicyState::Normal,
            prev_state: PolicyState::Normal,
            countdown_sec: 0,
            recovery_timer: 0,
            fan_stop_timer: 0,
            fans_stopped: false,
            protection_count: 0,
            actions: Vec::new(),
        }
    }

    /// Reading for threshold checks. Only called when `voltage` is set.
    pub fn v(&self) -> f32 {
        self.voltage.unwrap_or(self.last_voltage)
    }

    pub fn status(&self) -> PolicyStatus {
        PolicyStatus {
            running: self.running,
            state: self.state,
            voltage: self.last_voltage,
            countdown_sec: self.countdown_sec,
            recovery_timer: self.recovery_timer,
            fan_stop_timer: self.fan_stop_timer,
            fans_stopped: self.fans_stopped,
            protection_count: self.protection_count,
            uptime_ms: self.uptime_ms,
            agx_powered: self.agx_powered,
            lpmu_powered: self.lpmu_powered,
        }
    }

    /// Queue a power event with the current snapshot.
    pub fn emit(&mut self, kind: PowerEventKind) {
        let status = self.status();
        self.actions.push(PolicyAction::Post(PowerEvent { kind, status }));
    }

    pub(super) fn on_transition(&mut self, from: PolicyState, to: PolicyState) {
        self.prev_state = from;
        self.emit(PowerEventKind::StateChanged { from, to });
        if self.config.led_feedback {
            let pattern = match to {
                PolicyState::LowVoltage | PolicyState::Shutdown | PolicyState::Protected => {
                    IndicatorPattern::Warning
                }
                PolicyState::Normal | PolicyState::Recovery => IndicatorPattern::Normal,
            };
            self.actions.push(PolicyAction::Indicator(pattern));
        }
    }

    /// Drop queued actions, returning them.
    pub fn take_actions(&mut self) -> Vec<PolicyAction> {
        core::mem::take(&mut self.actions)
    }
}
