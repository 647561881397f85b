//! Function-pointer finite state machine driving the power policy.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  StateTable                                                      │
//! │  ┌─────────────┬──────────┬─────────┬───────────┬─────────────┐  │
//! │  │ PolicyState │ on_enter │ on_exit │ on_update │ on_step     │  │
//! │  ├─────────────┼──────────┼─────────┼───────────┼─────────────┤  │
//! │  │ Normal      │ fn(ctx)  │    -    │ voltage   │     -       │  │
//! │  │ LowVoltage  │ fn(ctx)  │    -    │ voltage   │ countdown   │  │
//! │  │ Shutdown    │ fn(ctx)  │    -    │ settle    │     -       │  │
//! │  │ Protected   │ fn(ctx)  │    -    │ voltage   │ fan stop    │  │
//! │  │ Recovery    │ fn(ctx)  │ fn(ctx) │ voltage   │ hold timer  │  │
//! │  └─────────────┴──────────┴─────────┴───────────┴─────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One tick runs in three phases:
//!
//! 1. `on_update` of the current state, only when the tick carries a
//!    valid voltage. It returns `Some(next)` for a threshold crossing.
//! 2. `on_step` of the (possibly new) current state: timers that run
//!    once per tick. A timer expiring may also return `Some(next)`.
//! 3. Transient states (`Shutdown`) settle through their `on_update`
//!    until a resting state is reached.
//!
//! Every transition runs `on_exit` of the old state, then `on_enter` of
//! the new one, and records a `StateChanged` event in the context.

pub mod context;
pub mod states;

use context::FsmContext;
use log::info;

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

/// Power-policy states. Must stay in sync with [`states::build_state_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PolicyState {
    Normal = 0,
    LowVoltage = 1,
    Shutdown = 2,
    Protected = 3,
    Recovery = 4,
}

impl PolicyState {
    pub const COUNT: usize = 5;

    pub const ALL: [PolicyState; Self::COUNT] = [
        Self::Normal,
        Self::LowVoltage,
        Self::Shutdown,
        Self::Protected,
        Self::Recovery,
    ];

    /// Out-of-range indices map to `Normal` in release builds.
    pub fn from_index(idx: usize) -> Self {
        match Self::ALL.get(idx) {
            Some(s) => *s,
            None => {
                debug_assert!(false, "invalid state index: {idx}");
                Self::Normal
            }
        }
    }

    /// Wire name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::LowVoltage => "LOW_VOLTAGE",
            Self::Shutdown => "SHUTDOWN",
            Self::Protected => "PROTECTED",
            Self::Recovery => "RECOVERY",
        }
    }
}

// ---------------------------------------------------------------------------
// Function-pointer type aliases
// ---------------------------------------------------------------------------

/// `on_enter` / `on_exit`. Run exactly once per transition.
pub type StateActionFn = fn(&mut FsmContext);

/// `on_update` / `on_step`. `Some(next)` requests a transition.
pub type StateUpdateFn = fn(&mut FsmContext) -> Option<PolicyState>;

// ---------------------------------------------------------------------------
// State descriptor (one row in the table)
// ---------------------------------------------------------------------------

pub struct StateDescriptor {
    pub id: PolicyState,
    pub name: &'static str,
    pub on_enter: Option<StateActionFn>,
    pub on_exit: Option<StateActionFn>,
    pub on_update: StateUpdateFn,
    pub on_step: Option<StateUpdateFn>,
    /// Left within the tick it was entered.
    pub transient: bool,
}

// ---------------------------------------------------------------------------
// FSM engine
// ---------------------------------------------------------------------------

pub struct Fsm {
    table: [StateDescriptor; PolicyState::COUNT],
    current: usize,
    tick_count: u64,
    state_entry_tick: u64,
}

impl Fsm {
    pub fn new(table: [StateDescriptor; PolicyState::COUNT], initial: PolicyState) -> Self {
        Self {
            table,
            current: initial as usize,
            tick_count: 0,
            state_entry_tick: 0,
        }
    }

    /// Run `on_enter` of the starting state. Call once before `tick()`.
    pub fn start(&mut self, ctx: &mut FsmContext) {
        info!("FSM starting in state: {}", self.table[self.current].name);
        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }

    /// Advance one tick. See the module docs for the phase order.
    pub fn tick(&mut self, ctx: &mut FsmContext) {
        self.tick_count += 1;
        ctx.ticks_in_state = self.tick_count - self.state_entry_tick;
        ctx.total_ticks = self.tick_count;

        if ctx.voltage.is_some() {
            if let Some(next) = (self.table[self.current].on_update)(ctx) {
                self.transition(next, ctx);
            }
        }

        if let Some(step) = self.table[self.current].on_step {
            if let Some(next) = step(ctx) {
                self.transition(next, ctx);
            }
        }

        // Bounded: at most one pass per state.
        for _ in 0..PolicyState::COUNT {
            let row = &self.table[self.current];
            if !row.transient {
                break;
            }
            match (row.on_update)(ctx) {
                Some(next) => self.transition(next, ctx),
                None => break,
            }
        }
    }

    /// Jump to `next` regardless of the handlers (used by reset).
    pub fn force_transition(&mut self, next: PolicyState, ctx: &mut FsmContext) {
        if next as usize != self.current {
            self.transition(next, ctx);
        }
    }

    pub fn current_state(&self) -> PolicyState {
        PolicyState::from_index(self.current)
    }

    pub fn ticks_in_current_state(&self) -> u64 {
        self.tick_count - self.state_entry_tick
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn transition(&mut self, next_id: PolicyState, ctx: &mut FsmContext) {
        let from = self.current_state();
        let next_idx = next_id as usize;

        info!(
            "FSM transition: {} -> {}",
            self.table[self.current].name, self.table[next_idx].name
        );

        if let Some(exit) = self.table[self.current].on_exit {
            exit(ctx);
        }

        self.current = next_idx;
        self.state_entry_tick = self.tick_count;
        ctx.ticks_in_state = 0;
        ctx.state = next_id;
        ctx.on_transition(from, next_id);

        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::context::{FsmContext, PolicyAction};
    use super::*;
    use crate::config::PowerPolicyConfig;
    use crate::events::PowerEventKind;

    fn make_ctx() -> FsmContext {
        FsmContext::new(PowerPolicyConfig::default())
    }

    fn make_fsm() -> Fsm {
        Fsm::new(states::build_state_table(), PolicyState::Normal)
    }

    fn feed(fsm: &mut Fsm, ctx: &mut FsmContext, v: f32) {
        ctx.voltage = Some(v);
        fsm.tick(ctx);
    }

    fn posted(ctx: &FsmContext) -> Vec<PowerEventKind> {
        ctx.actions
            .iter()
            .filter_map(|a| match a {
                PolicyAction::Post(e) => Some(e.kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn starts_in_normal() {
        let fsm = make_fsm();
        assert_eq!(fsm.current_state(), PolicyState::Normal);
    }

    #[test]
    fn low_voltage_starts_countdown_in_entry_tick() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        fsm.start(&mut ctx);
        feed(&mut fsm, &mut ctx, 12.0);
        assert_eq!(fsm.current_state(), PolicyState::LowVoltage);
        assert_eq!(ctx.countdown_sec, ctx.config.shutdown_delay_sec - 1);
        assert_eq!(ctx.protection_count, 1);
        let kinds = posted(&ctx);
        assert!(kinds.contains(&PowerEventKind::LowVoltage));
        assert!(kinds.contains(&PowerEventKind::StateChanged {
            from: PolicyState::Normal,
            to: PolicyState::LowVoltage
        }));
    }

    #[test]
    fn countdown_cancelled_by_recovery_voltage() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        fsm.start(&mut ctx);
        for _ in 0..30 {
            feed(&mut fsm, &mut ctx, 12.0);
        }
        feed(&mut fsm, &mut ctx, 19.0);
        assert_eq!(fsm.current_state(), PolicyState::Normal);
        assert_eq!(ctx.countdown_sec, 0);
        assert!(!ctx.actions.contains(&PolicyAction::ShutdownDevices));
    }

    #[test]
    fn voltage_between_thresholds_keeps_counting() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        fsm.start(&mut ctx);
        feed(&mut fsm, &mut ctx, 12.0);
        feed(&mut fsm, &mut ctx, 15.0);
        assert_eq!(fsm.current_state(), PolicyState::LowVoltage);
        assert_eq!(ctx.countdown_sec, ctx.config.shutdown_delay_sec - 2);
    }

    #[test]
    fn countdown_expiry_passes_through_shutdown() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        ctx.config.shutdown_delay_sec = 10;
        fsm.start(&mut ctx);
        for _ in 0..10 {
            feed(&mut fsm, &mut ctx, 12.0);
        }
        assert_eq!(fsm.current_state(), PolicyState::Protected);
        assert!(ctx.actions.contains(&PolicyAction::ShutdownDevices));
        let kinds = posted(&ctx);
        assert!(kinds.contains(&PowerEventKind::ShutdownStart));
        assert!(kinds.contains(&PowerEventKind::Protected));
        assert_eq!(ctx.fan_stop_timer, ctx.config.fan_stop_delay_sec);
    }

    #[test]
    fn countdown_ticks_every_ten_and_last_five() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        ctx.config.shutdown_delay_sec = 21;
        fsm.start(&mut ctx);
        let mut ticks = Vec::new();
        for _ in 0..21 {
            ctx.actions.clear();
            feed(&mut fsm, &mut ctx, 12.0);
            if posted(&ctx).contains(&PowerEventKind::CountdownTick) {
                ticks.push(ctx.countdown_sec);
            }
        }
        assert_eq!(ticks, vec![20, 10, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn invalid_voltage_skips_transitions_not_timers() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        fsm.start(&mut ctx);
        feed(&mut fsm, &mut ctx, 12.0);
        let before = ctx.countdown_sec;
        ctx.voltage = None;
        fsm.tick(&mut ctx);
        assert_eq!(fsm.current_state(), PolicyState::LowVoltage);
        assert_eq!(ctx.countdown_sec, before - 1);
    }

    #[test]
    fn recovery_dip_returns_to_protected_or_low() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        fsm.start(&mut ctx);
        fsm.force_transition(PolicyState::Protected, &mut ctx);
        feed(&mut fsm, &mut ctx, 19.0);
        assert_eq!(fsm.current_state(), PolicyState::Recovery);
        feed(&mut fsm, &mut ctx, 15.0);
        assert_eq!(fsm.current_state(), PolicyState::Protected);
        assert_eq!(ctx.recovery_timer, 0);

        feed(&mut fsm, &mut ctx, 19.0);
        feed(&mut fsm, &mut ctx, 11.0);
        assert_eq!(fsm.current_state(), PolicyState::LowVoltage);
        assert_eq!(ctx.countdown_sec, ctx.config.shutdown_delay_sec - 1);
    }

    #[test]
    fn recovery_hold_requests_reboot() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        ctx.config.recovery_hold_sec = 3;
        fsm.start(&mut ctx);
        fsm.force_transition(PolicyState::Protected, &mut ctx);
        for _ in 0..3 {
            feed(&mut fsm, &mut ctx, 19.0);
        }
        assert!(ctx.actions.contains(&PolicyAction::Reboot));
        assert!(posted(&ctx).contains(&PowerEventKind::RecoveryComplete));
    }

    #[test]
    fn recovery_without_auto_recovery_holds() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        ctx.config.auto_recovery = false;
        fsm.start(&mut ctx);
        fsm.force_transition(PolicyState::Protected, &mut ctx);
        for _ in 0..20 {
            feed(&mut fsm, &mut ctx, 19.0);
        }
        assert_eq!(fsm.current_state(), PolicyState::Recovery);
        assert!(!ctx.actions.contains(&PolicyAction::Reboot));
    }

    #[test]
    fn fan_stop_fires_once() {
        let mut fsm = make_fsm();
        let mut ctx = make_ctx();
        ctx.config.fan_stop_delay_sec = 10;
        fsm.start(&mut ctx);
        fsm.force_transition(PolicyState::Protected, &mut ctx);
        ctx.fan_stop_timer = 10;
        for _ in 0..15 {
            feed(&mut fsm, &mut ctx, 14.0);
        }
        assert!(ctx.fans_stopped);
        let stops = ctx.actions.iter().filter(|a| **a == PolicyAction::StopFans).count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn state_names_round_trip_by_index() {
        for (i, s) in PolicyState::ALL.iter().enumerate() {
            assert_eq!(PolicyState::from_index(i), *s);
        }
        assert_eq!(PolicyState::LowVoltage.name(), "LOW_VOLTAGE");
    }
}

#[cfg(test)]
mod proptests {
    use super::context::FsmContext;
    use super::*;
    use crate::config::PowerPolicyConfig;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn shutdown_is_never_a_resting_state(
            volts in proptest::collection::vec(prop_oneof![Just(None), (0.0f32..30.0).prop_map(Some)], 1..200),
        ) {
            let mut fsm = Fsm::new(states::build_state_table(), PolicyState::Normal);
            let mut cfg = PowerPolicyConfig::default();
            cfg.shutdown_delay_sec = 10;
            cfg.fan_stop_delay_sec = 10;
            let mut ctx = FsmContext::new(cfg);
            fsm.start(&mut ctx);
            for v in volts {
                ctx.voltage = v;
                fsm.tick(&mut ctx);
                prop_assert_ne!(fsm.current_state(), PolicyState::Shutdown);
                prop_assert_eq!(fsm.current_state(), ctx.state);
            }
        }

        #[test]
        fn normal_survives_healthy_supply(volts in proptest::collection::vec(12.6f32..30.0, 1..100)) {
            let mut fsm = Fsm::new(states::build_state_table(), PolicyState::Normal);
            let mut ctx = FsmContext::new(PowerPolicyConfig::default());
            fsm.start(&mut ctx);
            for v in volts {
                ctx.voltage = Some(v);
                fsm.tick(&mut ctx);
                prop_assert_eq!(fsm.current_state(), PolicyState::Normal);
            }
        }
    }
}
