//! Temperature source manager.
//!
//! Keeps a fixed table of providers (one slot per [`SourceKind`]) and
//! decides which one supplies the effective temperature:
//!
//! 1. manual mode with a registered `Manual` provider
//! 2. the preferred source, when it is valid
//! 3. the first valid of `Variable`, `AgxAuto`, `SensorLocal`
//! 4. `Default` with the 25.0 °C sentinel
//!
//! Selection runs on every mutation and on every read. A change of
//! `(temp, source)` posts [`TempEvent::Updated`] after the table lock is
//! released. Updates are queued under a publish lock in evaluation order
//! and delivered once that lock is dropped.

pub mod source;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};

use crate::app::ports::{ClockPort, VariablePort};
use crate::config::{TEMP_RECORD, TempConfig, VARIABLE_NAME_MAX};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Filter, HandlerId, StorageEvent, TempEvent, TempUpdate, Topic};
use crate::store::{ConfigStore, Tier};

pub use source::{
    DATA_TIMEOUT_MS, DEFAULT_TEMP, MAX_VALID, MIN_VALID, Provider, SOURCE_COUNT, SourceKind,
    tenths_from_celsius,
};
use source::in_window;

/// A temperature as seen by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// 0.1 °C.
    pub value: i16,
    pub source: SourceKind,
    pub timestamp_ms: u64,
    /// Always true for the effective reading, where the `Default` sentinel
    /// counts as valid. For [`TempManager::get_by_source`] it is false once
    /// the provider's reading is stale.
    pub valid: bool,
}

/// Snapshot returned by [`TempManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempStatus {
    pub initialized: bool,
    pub active_source: SourceKind,
    pub current_temp: i16,
    pub manual_mode: bool,
    pub manual_temp: i16,
    pub preferred_source: SourceKind,
    pub bound_variable: Option<String>,
    /// Registered providers only, in table order.
    pub providers: Vec<Provider>,
}

struct State {
    manual_mode: bool,
    manual_temp: i16,
    current_temp: i16,
    active_source: SourceKind,
    /// `Default` means automatic selection.
    preferred: SourceKind,
    bound_variable: Option<String>,
    providers: [Provider; SOURCE_COUNT],
}

impl State {
    fn new() -> Self {
        Self {
            manual_mode: false,
            manual_temp: DEFAULT_TEMP,
            current_temp: DEFAULT_TEMP,
            active_source: SourceKind::Default,
            preferred: SourceKind::Default,
            bound_variable: None,
            providers: SourceKind::ALL.map(|kind| match kind {
                SourceKind::Default => Provider::default_slot(),
                other => Provider::vacant(other),
            }),
        }
    }

    fn slot(&mut self, kind: SourceKind) -> &mut Provider {
        &mut self.providers[kind.index()]
    }

    fn config(&self) -> TempConfig {
        TempConfig {
            preferred_source: self.preferred.to_preferred(),
            bound_variable: self.bound_variable.clone(),
        }
    }
}

pub struct TempManager {
    /// Taken before `state`; held until the evaluation's events are queued.
    publish: Mutex<()>,
    state: Mutex<State>,
    clock: Arc<dyn ClockPort>,
    vars: Arc<dyn VariablePort>,
    store: Arc<ConfigStore>,
    bus: Arc<EventBus>,
    post_timeout_ms: u32,
}

impl TempManager {
    pub fn new(
        clock: Arc<dyn ClockPort>,
        vars: Arc<dyn VariablePort>,
        store: Arc<ConfigStore>,
        bus: Arc<EventBus>,
        post_timeout_ms: u32,
    ) -> Self {
        Self {
            publish: Mutex::new(()),
            state: Mutex::new(State::new()),
            clock,
            vars,
            store,
            bus,
            post_timeout_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the persisted config whenever the SD card is mounted.
    pub fn watch_storage(self: &Arc<Self>) -> Result<HandlerId> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.register(
            Topic::Storage,
            Filter::Id(StorageEvent::SD_MOUNTED),
            move |_| {
                if let Some(mgr) = weak.upgrade() {
                    if let Err(e) = mgr.load_config() {
                        warn!("temp: reload after SD mount failed: {}", e);
                    }
                }
            },
        )
    }

    // ── Persistence ───────────────────────────────────────────

    /// Load the preferred source and variable binding (SD > NVS > defaults).
    /// A record read from the SD card is written back to NVS.
    pub fn load_config(&self) -> Result<()> {
        let (cfg, tier) = match self.store.load_json::<TempConfig>(TEMP_RECORD) {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                info!("temp: no stored config, automatic selection");
                return Ok(());
            }
            Err(e) => {
                warn!("temp: failed to load config: {}", e);
                return Err(e);
            }
        };
        cfg.validate()?;

        let preferred = SourceKind::from_preferred(cfg.preferred_source);
        let bound = cfg.bound_variable.clone();
        self.with_state(|st, _| {
            st.preferred = preferred;
            match &bound {
                Some(name) => {
                    if !st.slot(SourceKind::Variable).registered {
                        st.slot(SourceKind::Variable).reset(Some(name));
                    }
                    st.bound_variable = Some(name.clone());
                }
                None => {
                    st.bound_variable = None;
                    *st.slot(SourceKind::Variable) = Provider::vacant(SourceKind::Variable);
                }
            }
            Ok(())
        })?;

        if tier == Tier::Sd {
            if let Err(e) = self.store.save_json(TEMP_RECORD, &cfg) {
                warn!("temp: failed to mirror SD config to NVS: {}", e);
            }
        }
        info!(
            "temp: config loaded from {:?}, preferred={}, variable={}",
            tier,
            preferred.name(),
            bound.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    /// Write the preferred source and binding to both tiers.
    pub fn save_config(&self) -> Result<()> {
        let cfg = self.lock().config();
        self.store.save_json(TEMP_RECORD, &cfg)
    }

    fn persist(&self) {
        if let Err(e) = self.save_config() {
            warn!("temp: failed to persist config: {}", e);
        }
    }

    // ── Providers ─────────────────────────────────────────────

    /// Register (or re-register) a provider slot. Clears its reading.
    pub fn provider_register(&self, kind: SourceKind, name: Option<&str>) -> Result<()> {
        if kind == SourceKind::Default {
            return Ok(());
        }
        self.with_state(|st, _| {
            st.slot(kind).reset(name);
            Ok(())
        })?;
        info!("temp: provider registered: {}", name.unwrap_or(kind.name()));
        Ok(())
    }

    /// The `Default` provider cannot be removed.
    pub fn provider_unregister(&self, kind: SourceKind) -> Result<()> {
        if kind == SourceKind::Default {
            return Err(Error::InvalidState);
        }
        self.with_state(|st, _| {
            *st.slot(kind) = Provider::vacant(kind);
            Ok(())
        })?;
        info!("temp: provider unregistered: {}", kind.name());
        Ok(())
    }

    /// Feed a reading (0.1 °C) from a registered provider.
    pub fn provider_update(&self, kind: SourceKind, value: i16) -> Result<()> {
        if !in_window(value) {
            warn!("temp: rejected {} from {}", value, kind.name());
            return Err(Error::InvalidArg("temperature out of range"));
        }
        let now = self.clock.now_ms();
        self.with_state(|st, _| {
            let slot = st.slot(kind);
            if !slot.registered {
                return Err(Error::InvalidState);
            }
            slot.record(value, now);
            Ok(())
        })
    }

    // ── Manual override ───────────────────────────────────────

    /// Enable manual mode at `value` (0.1 °C), registering the `Manual`
    /// provider if needed.
    pub fn set_manual(&self, value: i16) -> Result<()> {
        if !in_window(value) {
            return Err(Error::InvalidArg("temperature out of range"));
        }
        let now = self.clock.now_ms();
        self.with_state(|st, events| {
            if !st.slot(SourceKind::Manual).registered {
                st.slot(SourceKind::Manual).reset(Some("manual"));
            }
            if !st.manual_mode {
                events.push(Event::Temp(TempEvent::ManualModeChanged { enabled: true }));
            }
            st.manual_mode = true;
            st.manual_temp = value;
            st.slot(SourceKind::Manual).record(value, now);
            Ok(())
        })
    }

    pub fn set_manual_mode(&self, enable: bool) -> Result<()> {
        let now = self.clock.now_ms();
        self.with_state(|st, events| {
            if enable && !st.slot(SourceKind::Manual).registered {
                let manual_temp = st.manual_temp;
                let slot = st.slot(SourceKind::Manual);
                slot.reset(Some("manual"));
                slot.record(manual_temp, now);
            }
            if st.manual_mode != enable {
                events.push(Event::Temp(TempEvent::ManualModeChanged { enabled: enable }));
            }
            st.manual_mode = enable;
            Ok(())
        })?;
        info!("temp: manual mode {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn is_manual_mode(&self) -> bool {
        self.lock().manual_mode
    }

    // ── Preferred source ──────────────────────────────────────

    /// Prefer `kind` over the default priority walk. `Default` restores
    /// automatic selection. Leaves manual mode and persists.
    pub fn set_preferred_source(&self, kind: SourceKind) -> Result<()> {
        if kind == SourceKind::Manual {
            return Err(Error::InvalidArg("manual is selected via manual mode"));
        }
        let old = self.with_state(|st, events| {
            let old = st.preferred;
            st.preferred = kind;
            if st.manual_mode {
                st.manual_mode = false;
                events.push(Event::Temp(TempEvent::ManualModeChanged { enabled: false }));
                info!("temp: manual mode disabled (switching to {})", kind.name());
            }
            Ok(old)
        })?;
        self.persist();
        info!("temp: preferred source {} -> {}", label(old), label(kind));
        Ok(())
    }

    pub fn clear_preferred_source(&self) -> Result<()> {
        self.set_preferred_source(SourceKind::Default)
    }

    pub fn preferred_source(&self) -> SourceKind {
        self.lock().preferred
    }

    // ── Variable binding ──────────────────────────────────────

    /// Bind the `Variable` source to a named scalar (°C). The variable
    /// need not exist yet.
    pub fn bind_variable(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArg("variable name is empty"));
        }
        if name.len() >= VARIABLE_NAME_MAX {
            return Err(Error::InvalidArg("variable name too long"));
        }
        if !self.vars.exists(name) {
            warn!("temp: variable {} does not exist yet, binding anyway", name);
        }
        self.with_state(|st, _| {
            st.bound_variable = Some(name.to_owned());
            let slot = st.slot(SourceKind::Variable);
            if !slot.registered {
                slot.reset(Some(name));
            } else {
                slot.name = name.to_owned();
            }
            Ok(())
        })?;
        self.persist();
        info!("temp: bound to variable {}", name);
        Ok(())
    }

    pub fn unbind_variable(&self) -> Result<()> {
        let was_bound = self.with_state(|st, _| {
            *st.slot(SourceKind::Variable) = Provider::vacant(SourceKind::Variable);
            Ok(st.bound_variable.take().is_some())
        })?;
        if was_bound {
            self.persist();
            info!("temp: variable binding removed");
        }
        Ok(())
    }

    pub fn bound_variable(&self) -> Option<String> {
        self.lock().bound_variable.clone()
    }

    // ── Consumers ─────────────────────────────────────────────

    /// Re-evaluate and return the effective temperature. Falls back to the
    /// `Default` sentinel, which is reported as valid.
    pub fn get_effective(&self) -> Reading {
        self.refresh();
        let st = self.lock();
        Reading {
            value: st.current_temp,
            source: st.active_source,
            timestamp_ms: st.providers[st.active_source.index()].last_update_ms,
            valid: true,
        }
    }

    /// Cached state of one provider. `NotFound` when unregistered; `valid`
    /// is false once the reading is stale.
    pub fn get_by_source(&self, kind: SourceKind) -> Result<Reading> {
        let now = self.clock.now_ms();
        let st = self.lock();
        let p = &st.providers[kind.index()];
        if !p.registered {
            return Err(Error::NotFound);
        }
        Ok(Reading {
            value: p.value,
            source: kind,
            timestamp_ms: p.last_update_ms,
            valid: p.is_fresh(now),
        })
    }

    pub fn active_source(&self) -> SourceKind {
        self.lock().active_source
    }

    /// Registered providers in table order.
    pub fn providers(&self) -> Vec<Provider> {
        self.lock().providers.iter().filter(|p| p.registered).cloned().collect()
    }

    /// Re-evaluate and snapshot the manager.
    pub fn status(&self) -> TempStatus {
        self.refresh();
        let st = self.lock();
        TempStatus {
            initialized: true,
            active_source: st.active_source,
            current_temp: st.current_temp,
            manual_mode: st.manual_mode,
            manual_temp: st.manual_temp,
            preferred_source: st.preferred,
            bound_variable: st.bound_variable.clone(),
            providers: st.providers.iter().filter(|p| p.registered).cloned().collect(),
        }
    }

    // ── Selection ─────────────────────────────────────────────

    /// Run `f` under the table lock, re-select on success, then queue the
    /// collected events and deliver them with both locks released.
    fn with_state<R>(&self, f: impl FnOnce(&mut State, &mut Vec<Event>) -> Result<R>) -> Result<R> {
        let result = {
            let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
            let mut events = Vec::new();
            let result = {
                let mut st = self.lock();
                let result = f(&mut st, &mut events);
                if result.is_ok() {
                    if let Some(update) = self.evaluate(&mut st) {
                        events.push(Event::Temp(TempEvent::Updated(update)));
                    }
                }
                result
            };
            for ev in events {
                if let Err(e) = self.bus.enqueue(ev, self.post_timeout_ms) {
                    debug!("temp: event not posted: {}", e);
                }
            }
            result
        };
        self.bus.flush();
        result
    }

    /// Re-select without mutating the table (staleness, variable reads).
    fn refresh(&self) {
        let _ = self.with_state(|_, _| Ok(()));
    }

    fn evaluate(&self, st: &mut State) -> Option<TempUpdate> {
        let now = self.clock.now_ms();
        let (source, temp) = self.select(st, now);
        if source == st.active_source && temp == st.current_temp {
            return None;
        }
        let update = TempUpdate {
            temp,
            source,
            prev_temp: st.current_temp,
            prev_source: st.active_source,
        };
        st.current_temp = temp;
        st.active_source = source;
        debug!(
            "temp: {} ({}) -> {} ({})",
            update.prev_temp,
            update.prev_source.name(),
            temp,
            source.name()
        );
        Some(update)
    }

    fn select(&self, st: &mut State, now: u64) -> (SourceKind, i16) {
        if st.manual_mode && st.providers[SourceKind::Manual.index()].registered {
            return (SourceKind::Manual, st.providers[SourceKind::Manual.index()].value);
        }

        let preferred = st.preferred;
        if preferred != SourceKind::Default && preferred != SourceKind::Manual {
            if let Some(v) = self.read_valid(st, preferred, now) {
                return (preferred, v);
            }
            debug!("temp: preferred {} unavailable, falling back", preferred.name());
        }

        for kind in SourceKind::PRIORITY {
            if let Some(v) = self.read_valid(st, kind, now) {
                return (kind, v);
            }
        }
        (SourceKind::Default, DEFAULT_TEMP)
    }

    /// Current value of `kind` when it is valid at `now`.
    fn read_valid(&self, st: &mut State, kind: SourceKind, now: u64) -> Option<i16> {
        if kind == SourceKind::Variable {
            let name = st.bound_variable.as_deref()?;
            let value = self.vars.get_float(name).and_then(tenths_from_celsius)?;
            let slot = &mut st.providers[kind.index()];
            if slot.registered {
                slot.value = value;
                slot.last_update_ms = now;
                slot.active = true;
            }
            return Some(value);
        }
        let p = &st.providers[kind.index()];
        p.is_fresh(now).then_some(p.value)
    }
}

fn label(kind: SourceKind) -> &'static str {
    if kind == SourceKind::Default { "auto" } else { kind.name() }
}
