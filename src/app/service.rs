//! Composition root.
//!
//! [`ControlPlane`] wires the subsystems together in dependency order and
//! owns everything that outlives a single request: the event bus, the
//! config store, the periodic tasks and the API registry.
//!
//! ```text
//!  EventBus ◀── ConfigStore ◀── TempManager ◀── FanController
//!     ▲                                             ▲
//!     └──────── DevicePower ◀──── PowerPolicy ──────┘
//!                                     ▲
//!                 Registry (api) ─────┘
//! ```
//!
//! Teardown runs in reverse: tasks stop first, then bus subscribers
//! detach, then the bus closes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};

use crate::adapters::log_sink::LogEventSink;
use crate::api::auth::{ClientId, Level};
use crate::api::handlers::{self, Services};
use crate::api::{Registry, SessionTable};
use crate::config::{CONTROLLER_RECORD, ControllerConfig, PowerPolicyConfig};
use crate::device::{AgxPins, DevicePower, LpmuPins};
use crate::drivers::tach::TachCounter;
use crate::error::Result;
use crate::events::{EventBus, HandlerId};
use crate::fan::{FAN_COUNT, FanController, FanHwConfig};
use crate::pins;
use crate::power::{PolicyDeps, PowerPolicy};
use crate::store::ConfigStore;
use crate::temp::TempManager;

use super::ports::{
    ClockPort, FilePort, GpioPort, IndicatorPort, NetProbePort, PwmPort, StoragePort,
    SystemPort, VariablePort, VoltagePort,
};
use super::task::{Core, PeriodicTask, TaskSpec};

const FAN_TASK: TaskSpec = TaskSpec {
    name: "fan_ctrl\0",
    core: Core::App,
    priority: 5,
    stack_kb: 8,
};

const POWER_TASK: TaskSpec = TaskSpec {
    name: "power_policy\0",
    core: Core::App,
    priority: 6,
    stack_kb: 8,
};

/// Adapters handed to [`ControlPlane::new`].
pub struct Ports {
    pub clock: Arc<dyn ClockPort>,
    pub pwm: Arc<dyn PwmPort>,
    pub gpio: Arc<dyn GpioPort>,
    pub voltage: Arc<dyn VoltagePort>,
    pub probe: Arc<dyn NetProbePort>,
    pub system: Arc<dyn SystemPort>,
    pub indicator: Arc<dyn IndicatorPort>,
    pub vars: Arc<dyn VariablePort>,
    pub nvs: Box<dyn StoragePort>,
    /// Mounted before any config is loaded when present.
    pub sd: Option<Box<dyn FilePort>>,
    /// Tachometer counters per fan slot.
    pub tach: [Option<&'static TachCounter>; FAN_COUNT],
}

pub struct ControlPlane {
    config: ControllerConfig,
    bus: Arc<EventBus>,
    store: Arc<ConfigStore>,
    temp: Arc<TempManager>,
    fans: Arc<FanController>,
    devices: Arc<DevicePower>,
    policy: Arc<PowerPolicy>,
    registry: Registry,
    sessions: Mutex<SessionTable>,
    temp_watch: Option<HandlerId>,
    log_sink: Option<LogEventSink>,
    tasks: Vec<PeriodicTask>,
}

impl ControlPlane {
    /// Build and wire every subsystem. `defaults` is used unless a valid
    /// controller record is stored (SD > NVS).
    pub fn new(ports: Ports, defaults: ControllerConfig) -> Result<Self> {
        defaults.validate()?;

        // ── 1. Bus and storage ────────────────────────────────
        let bus = Arc::new(EventBus::new());
        let log_sink = LogEventSink::attach(Arc::clone(&bus))?;
        let store = Arc::new(ConfigStore::new(ports.nvs, Arc::clone(&bus)));
        if let Some(card) = ports.sd {
            match store.mount_sd(card) {
                Ok(n) => info!("app: SD card mounted ({} record(s) synced)", n),
                Err(e) => warn!("app: SD mount failed, NVS only: {}", e),
            }
        }
        let config = load_controller_config(&store, defaults);
        let timeout = config.event_post_timeout_ms;

        // ── 2. Temperature ────────────────────────────────────
        let temp = Arc::new(TempManager::new(
            Arc::clone(&ports.clock),
            Arc::clone(&ports.vars),
            Arc::clone(&store),
            Arc::clone(&bus),
            timeout,
        ));
        if let Err(e) = temp.load_config() {
            warn!("app: temperature config ignored: {}", e);
        }
        let temp_watch = temp.watch_storage()?;

        // ── 3. Fans ───────────────────────────────────────────
        let fans = Arc::new(FanController::new(
            ports.pwm,
            Arc::clone(&ports.clock),
            Arc::clone(&temp),
            Arc::clone(&store),
            Arc::clone(&bus),
        ));
        for (id, gpio) in pins::FAN_PWM_GPIO.iter().enumerate() {
            if *gpio >= 0 {
                fans.configure(id, FanHwConfig::board(id, ports.tach[id]))?;
            }
        }
        match fans.load_config() {
            Ok(n) => info!("app: {} fan record(s) restored", n),
            Err(e) => warn!("app: fan config ignored: {}", e),
        }
        fans.subscribe()?;

        // ── 4. Devices ────────────────────────────────────────
        let devices = Arc::new(DevicePower::new(
            ports.gpio,
            Arc::clone(&ports.clock),
            Arc::clone(&bus),
            timeout,
        ));
        devices.configure_agx(AgxPins::default())?;
        devices.configure_lpmu(LpmuPins::default())?;

        // ── 5. Power policy ───────────────────────────────────
        let policy = Arc::new(PowerPolicy::new(
            PolicyDeps {
                clock: ports.clock,
                voltage: ports.voltage,
                probe: ports.probe,
                system: ports.system,
                indicator: ports.indicator,
                vars: ports.vars,
                devices: Arc::clone(&devices),
                fans: Arc::clone(&fans),
                store: Arc::clone(&store),
                bus: Arc::clone(&bus),
                post_timeout_ms: timeout,
            },
            PowerPolicyConfig::default(),
        )?);
        if let Err(e) = policy.load_config() {
            warn!("app: power policy config ignored: {}", e);
        }
        policy.watch_storage()?;
        if policy.config().enabled {
            policy.start();
        }

        // ── 6. API ────────────────────────────────────────────
        let mut registry = Registry::new();
        handlers::register_all(
            &mut registry,
            &Services {
                temp: Arc::clone(&temp),
                fans: Arc::clone(&fans),
                devices: Arc::clone(&devices),
                policy: Arc::clone(&policy),
            },
        )?;

        info!("app: control plane ready ({} endpoints)", registry.len());
        Ok(Self {
            config,
            bus,
            store,
            temp,
            fans,
            devices,
            policy,
            registry,
            sessions: Mutex::new(SessionTable::new()),
            temp_watch: Some(temp_watch),
            log_sink: Some(log_sink),
            tasks: Vec::new(),
        })
    }

    // ── Tasks ─────────────────────────────────────────────────

    /// Start the fan loop and the power monitor. Idempotent.
    pub fn spawn_tasks(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        let fans = Arc::clone(&self.fans);
        self.tasks.push(PeriodicTask::spawn(
            FAN_TASK,
            self.config.fan_update_interval_ms,
            move || fans.tick(),
        )?);
        let policy = Arc::clone(&self.policy);
        self.tasks.push(PeriodicTask::spawn(
            POWER_TASK,
            self.config.power_monitor_interval_ms,
            move || policy.tick(),
        )?);
        Ok(())
    }

    pub fn tasks_running(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_running()).count()
    }

    /// Reverse-order teardown. Safe to call more than once.
    pub fn shutdown(&mut self) {
        for mut task in self.tasks.drain(..).rev() {
            if let Err(e) = task.stop(self.config.task_stop_wait_ms) {
                warn!("app: task '{}' stop: {}", task.name(), e);
            }
        }
        self.fans.deinit();
        self.policy.deinit();
        if let Some(id) = self.temp_watch.take() {
            if let Err(e) = self.bus.unregister(id) {
                warn!("app: temp unsubscribe failed: {}", e);
            }
        }
        if let Some(sink) = self.log_sink.take() {
            sink.detach();
        }
        self.bus.shutdown();
        info!("app: control plane stopped");
    }

    // ── Requests ──────────────────────────────────────────────

    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, name: &str, password: &str, level: Level) -> Result<()> {
        self.sessions().add_user(name, password, level)
    }

    pub fn login(&self, client: ClientId, name: &str, password: &str) -> Result<u32> {
        self.sessions().login(client, name, password)
    }

    pub fn logout(&self, session: u32) -> bool {
        self.sessions().logout(session)
    }

    /// Dispatch a `{"method": ..., "params": ...}` request on behalf of
    /// `session` and return the JSON envelope.
    pub fn request(&self, request: &str, session: Option<u32>) -> String {
        let principal = session.and_then(|id| self.sessions().principal(id));
        self.registry.handle_request(request, principal.as_ref())
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn config(&self) -> ControllerConfig {
        self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn temp(&self) -> &Arc<TempManager> {
        &self.temp
    }

    pub fn fans(&self) -> &Arc<FanController> {
        &self.fans
    }

    pub fn devices(&self) -> &Arc<DevicePower> {
        &self.devices
    }

    pub fn policy(&self) -> &Arc<PowerPolicy> {
        &self.policy
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn load_controller_config(store: &ConfigStore, defaults: ControllerConfig) -> ControllerConfig {
    match store.load_json::<ControllerConfig>(CONTROLLER_RECORD) {
        Ok((cfg, tier)) => match cfg.validate() {
            Ok(()) => {
                info!("app: controller config loaded from {:?}", tier);
                cfg
            }
            Err(e) => {
                warn!("app: stored controller config rejected: {}", e);
                defaults
            }
        },
        Err(e) if e.is_not_found() => defaults,
        Err(e) => {
            warn!("app: controller config unreadable: {}", e);
            defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::hardware::{Chip, IcmpProbe, LedcPwm, SupplyAdc};
    use crate::adapters::nvs::NvsAdapter;
    use crate::adapters::sd::MemCard;
    use crate::adapters::time::SimClock;
    use crate::adapters::variables::VariableRegistry;
    use crate::app::ports::{HwError, IndicatorPattern, PinState};
    use crate::power::PolicyState;
    use serde_json::Value;

    struct Pins;

    impl GpioPort for Pins {
        fn configure_output(&self, _: i32, _: PinState) -> core::result::Result<(), HwError> {
            Ok(())
        }
        fn configure_input(&self, _: i32) -> core::result::Result<(), HwError> {
            Ok(())
        }
        fn write(&self, _: i32, _: PinState) -> core::result::Result<(), HwError> {
            Ok(())
        }
        fn read(&self, _: i32) -> core::result::Result<PinState, HwError> {
            Ok(PinState::Low)
        }
    }

    struct Led;

    impl IndicatorPort for Led {
        fn show(&self, _: IndicatorPattern) {}
    }

    fn ports(sd: Option<MemCard>) -> Ports {
        Ports {
            clock: Arc::new(SimClock::starting_at_ms(1000)),
            pwm: Arc::new(LedcPwm::new()),
            gpio: Arc::new(Pins),
            voltage: Arc::new(SupplyAdc),
            probe: Arc::new(IcmpProbe::new()),
            system: Arc::new(Chip::new()),
            indicator: Arc::new(Led),
            vars: Arc::new(VariableRegistry::new()),
            nvs: Box::new(NvsAdapter::new().unwrap()),
            sd: sd.map(|c| Box::new(c) as Box<dyn FilePort>),
            tach: [None; FAN_COUNT],
        }
    }

    fn envelope(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn builds_and_serves_requests() {
        let mut cp = ControlPlane::new(ports(None), ControllerConfig::default()).unwrap();
        assert!(cp.registry().len() > 20);
        assert!(cp.fans().is_configured(0));
        assert!(cp.policy().is_running());
        assert_eq!(cp.policy().state(), PolicyState::Normal);

        let r = envelope(&cp.request(r#"{"method":"fan.status","params":{"id":0}}"#, None));
        assert_eq!(r["code"], 0);
        assert_eq!(r["data"]["id"], 0);

        let r = envelope(&cp.request(r#"{"method":"fan.set","params":{"id":0,"duty":50}}"#, None));
        assert_eq!(r["code"], 10);

        cp.shutdown();
        assert_eq!(cp.bus().handler_count(), 0);
    }

    #[test]
    fn sessions_gate_mutating_endpoints() {
        let mut cp = ControlPlane::new(ports(None), ControllerConfig::default()).unwrap();
        cp.add_user("ops", "hunter2", Level::Admin).unwrap();
        let sid = cp.login(0, "ops", "hunter2").unwrap();

        let req = r#"{"method":"fan.set","params":{"id":0,"duty":50}}"#;
        assert_eq!(envelope(&cp.request(req, Some(sid)))["code"], 0);
        assert_eq!(cp.fans().get_status(0).unwrap().duty, 50);

        assert!(cp.logout(sid));
        assert_eq!(envelope(&cp.request(req, Some(sid)))["code"], 10);
        cp.shutdown();
    }

    #[test]
    fn stored_controller_config_overrides_defaults() {
        let card = MemCard::new();
        card.put(
            CONTROLLER_RECORD.path,
            br#"{"fan_update_interval_ms":250,"power_monitor_interval_ms":500}"#,
        );
        let mut cp = ControlPlane::new(ports(Some(card)), ControllerConfig::default()).unwrap();
        assert_eq!(cp.config().fan_update_interval_ms, 250);
        assert_eq!(cp.config().power_monitor_interval_ms, 500);
        assert_eq!(cp.config().task_stop_wait_ms, 5000);
        cp.shutdown();
    }

    #[test]
    fn invalid_stored_controller_config_falls_back() {
        let card = MemCard::new();
        card.put(CONTROLLER_RECORD.path, br#"{"fan_update_interval_ms":5}"#);
        let mut cp = ControlPlane::new(ports(Some(card)), ControllerConfig::default()).unwrap();
        assert_eq!(cp.config(), ControllerConfig::default());
        cp.shutdown();
    }

    #[test]
    fn tasks_start_and_stop() {
        let mut cp = ControlPlane::new(ports(None), ControllerConfig::default()).unwrap();
        cp.spawn_tasks().unwrap();
        cp.spawn_tasks().unwrap();
        assert_eq!(cp.tasks_running(), 2);
        cp.shutdown();
        assert_eq!(cp.tasks_running(), 0);
        cp.shutdown();
    }
}
