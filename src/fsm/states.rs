//! Policy state handlers and table builder.
//!
//! ```text
//!  NORMAL ──[V < low]──▶ LOW_VOLTAGE ──[countdown 0]──▶ SHUTDOWN
//!    ▲                     │      ▲                         │
//!    └──[V ≥ recovery]─────┘      │                      (settle)
//!    ▲                            │                         ▼
//!    │                         [V < low]               PROTECTED ◀─┐
//!    │                            │                         │      │
//!    └───[hold elapsed: reboot]── RECOVERY ◀──[V ≥ recovery]┘      │
//!                                     └──[low ≤ V < recovery]──────┘
//! ```

use super::context::{FsmContext, PolicyAction};
use super::{PolicyState, StateDescriptor};
use crate::events::PowerEventKind;
use log::{info, warn};

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

pub fn build_state_table() -> [StateDescriptor; PolicyState::COUNT] {
    [
        StateDescriptor {
            id: PolicyState::Normal,
            name: PolicyState::Normal.name(),
            on_enter: Some(normal_enter),
            on_exit: None,
            on_update: normal_update,
            on_step: None,
            transient: false,
        },
        StateDescriptor {
            id: PolicyState::LowVoltage,
            name: PolicyState::LowVoltage.name(),
            on_enter: Some(low_enter),
            on_exit: None,
            on_update: low_update,
            on_step: Some(low_step),
            transient: false,
        },
        StateDescriptor {
            id: PolicyState::Shutdown,
            name: PolicyState::Shutdown.name(),
            on_enter: Some(shutdown_enter),
            on_exit: None,
            on_update: shutdown_update,
            on_step: None,
            transient: true,
        },
        StateDescriptor {
            id: PolicyState::Protected,
            name: PolicyState::Protected.name(),
            on_enter: Some(protected_enter),
            on_exit: None,
            on_update: protected_update,
            on_step: Some(protected_step),
            transient: false,
        },
        StateDescriptor {
            id: PolicyState::Recovery,
            name: PolicyState::Recovery.name(),
            on_enter: Some(recovery_enter),
            on_exit: Some(recovery_exit),
            on_update: recovery_update,
            on_step: Some(recovery_step),
            transient: false,
        },
    ]
}

// ═══════════════════════════════════════════════════════════════════════════
//  NORMAL
// ═══════════════════════════════════════════════════════════════════════════

fn normal_enter(ctx: &mut FsmContext) {
    ctx.countdown_sec = 0;
}

fn normal_update(ctx: &mut FsmContext) -> Option<PolicyState> {
    let v = ctx.v();
    if v < ctx.config.low_voltage_threshold {
        warn!(
            "power: NORMAL -> LOW_VOLTAGE: {:.2}V < {:.2}V",
            v, ctx.config.low_voltage_threshold
        );
        return Some(PolicyState::LowVoltage);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  LOW_VOLTAGE: shutdown countdown
// ═══════════════════════════════════════════════════════════════════════════

fn low_enter(ctx: &mut FsmContext) {
    ctx.countdown_sec = ctx.config.shutdown_delay_sec;
    if ctx.prev_state == PolicyState::Normal {
        ctx.protection_count = ctx.protection_count.wrapping_add(1);
        ctx.emit(PowerEventKind::LowVoltage);
    }
    warn!("power: low voltage, shutdown in {}s", ctx.countdown_sec);
}

fn low_update(ctx: &mut FsmContext) -> Option<PolicyState> {
    let v = ctx.v();
    if v >= ctx.config.recovery_voltage_threshold {
        info!(
            "power: LOW_VOLTAGE -> NORMAL: {:.2}V >= {:.2}V (countdown cancelled)",
            v, ctx.config.recovery_voltage_threshold
        );
        return Some(PolicyState::Normal);
    }
    None
}

fn low_step(ctx: &mut FsmContext) -> Option<PolicyState> {
    if ctx.countdown_sec == 0 {
        return None;
    }
    ctx.countdown_sec -= 1;
    let cd = ctx.countdown_sec;
    if cd % 10 == 0 || cd <= 5 {
        warn!("power: low voltage countdown: {}s remaining", cd);
        ctx.emit(PowerEventKind::CountdownTick);
    }
    if cd == 0 {
        warn!("power: countdown complete, initiating shutdown");
        return Some(PolicyState::Shutdown);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  SHUTDOWN: transient, runs the device sequence
// ═══════════════════════════════════════════════════════════════════════════

fn shutdown_enter(ctx: &mut FsmContext) {
    ctx.emit(PowerEventKind::ShutdownStart);
    if ctx.config.device_shutdown {
        ctx.actions.push(PolicyAction::ShutdownDevices);
    } else {
        info!("power: device shutdown disabled, skipping");
    }
    ctx.fan_stop_timer = ctx.config.fan_stop_delay_sec;
    ctx.fans_stopped = false;
}

fn shutdown_update(_ctx: &mut FsmContext) -> Option<PolicyState> {
    Some(PolicyState::Protected)
}

// ═══════════════════════════════════════════════════════════════════════════
//  PROTECTED: devices down, waiting for the supply to return
// ═══════════════════════════════════════════════════════════════════════════

fn protected_enter(ctx: &mut FsmContext) {
    ctx.emit(PowerEventKind::Protected);
    warn!("power: entered protected state");
}

fn protected_update(ctx: &mut FsmContext) -> Option<PolicyState> {
    let v = ctx.v();
    if v >= ctx.config.recovery_voltage_threshold {
        info!(
            "power: PROTECTED -> RECOVERY: {:.2}V >= {:.2}V",
            v, ctx.config.recovery_voltage_threshold
        );
        return Some(PolicyState::Recovery);
    }
    None
}

fn protected_step(ctx: &mut FsmContext) -> Option<PolicyState> {
    if !ctx.config.fan_control || ctx.fans_stopped || ctx.fan_stop_timer == 0 {
        return None;
    }
    ctx.fan_stop_timer -= 1;
    let t = ctx.fan_stop_timer;
    if t % 10 == 0 || t <= 5 {
        info!("power: fan stop in {}s", t);
    }
    if t == 0 {
        warn!("power: stopping all fans");
        ctx.actions.push(PolicyAction::StopFans);
        ctx.fans_stopped = true;
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  RECOVERY: supply back, holding before reboot
// ═══════════════════════════════════════════════════════════════════════════

fn recovery_enter(ctx: &mut FsmContext) {
    ctx.recovery_timer = ctx.config.recovery_hold_sec;
    ctx.emit(PowerEventKind::RecoveryStart);
}

fn recovery_exit(ctx: &mut FsmContext) {
    ctx.recovery_timer = 0;
}

fn recovery_update(ctx: &mut FsmContext) -> Option<PolicyState> {
    let v = ctx.v();
    if v >= ctx.config.recovery_voltage_threshold {
        return None;
    }
    if v < ctx.config.low_voltage_threshold {
        warn!("power: RECOVERY -> LOW_VOLTAGE: {:.2}V", v);
        Some(PolicyState::LowVoltage)
    } else {
        info!("power: RECOVERY -> PROTECTED: {:.2}V below recovery threshold", v);
        Some(PolicyState::Protected)
    }
}

fn recovery_step(ctx: &mut FsmContext) -> Option<PolicyState> {
    if ctx.recovery_timer == 0 {
        return None;
    }
    ctx.recovery_timer -= 1;
    info!("power: recovery timer: {}s remaining", ctx.recovery_timer);
    if ctx.recovery_timer == 0 {
        ctx.emit(PowerEventKind::RecoveryComplete);
        if ctx.config.auto_recovery {
            info!("power: recovery confirmed, restarting controller");
            ctx.actions.push(PolicyAction::Reboot);
        } else {
            info!("power: recovery confirmed, auto recovery off; waiting for reset");
        }
    }
    None
}
