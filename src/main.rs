//! RackCtl firmware entry point.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Adapters (outer ring)                     │
//! │  LedcPwm  Gpio  SupplyAdc  IcmpProbe  LedIndicator  Chip      │
//! │  NvsAdapter  SdCard  SystemClock  VariableRegistry            │
//! │                                                               │
//! │  ─────────────── Port Trait Boundary ──────────────────       │
//! │                                                               │
//! │  ControlPlane: EventBus · ConfigStore · TempManager ·         │
//! │                FanController · DevicePower · PowerPolicy ·    │
//! │                API Registry                                   │
//! │                                                               │
//! │  Tasks: fan_ctrl (1 Hz) · power_policy (1 Hz)                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};

use rackctl::adapters::hardware::{Chip, Gpio, IcmpProbe, LedIndicator, LedcPwm, SupplyAdc};
use rackctl::adapters::nvs::NvsAdapter;
use rackctl::adapters::sd::{SD_MOUNT_POINT, SdCard};
use rackctl::adapters::time::SystemClock;
use rackctl::adapters::variables::VariableRegistry;
use rackctl::api::Level;
use rackctl::app::ports::{FilePort, IndicatorPattern, IndicatorPort};
use rackctl::app::{ControlPlane, Ports};
use rackctl::config::ControllerConfig;
use rackctl::drivers::{hw_init, tach::TachCounter};
use rackctl::fan::FAN_COUNT;

static TACH: [TachCounter; FAN_COUNT] = [const { TachCounter::new() }; FAN_COUNT];

/// Idle-loop heartbeat period.
const HEARTBEAT_SECS: u64 = 60;

/// Null indicator used when the status LED cannot be claimed.
struct NoLed;

impl IndicatorPort for NoLed {
    fn show(&self, _: IndicatorPattern) {}
}

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  RackCtl v{}                      ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    if let Err(e) = hw_init::init_peripherals() {
        error!("HAL init failed: {}", e);
        return Err(anyhow::anyhow!("peripheral init failed: {}", e));
    }

    // ── 2. Storage tiers ──────────────────────────────────────
    let nvs = NvsAdapter::new().map_err(|e| anyhow::anyhow!("NVS init failed: {}", e))?;
    let sd: Option<Box<dyn FilePort>> = if Path::new(SD_MOUNT_POINT).is_dir() {
        Some(Box::new(SdCard::new(SD_MOUNT_POINT)))
    } else {
        warn!("SD card not mounted at {}, NVS only", SD_MOUNT_POINT);
        None
    };

    // ── 3. Adapters ───────────────────────────────────────────
    let indicator: Arc<dyn IndicatorPort> = match LedIndicator::new() {
        Ok(led) => Arc::new(led),
        Err(e) => {
            warn!("status LED unavailable: {}", e);
            Arc::new(NoLed)
        }
    };
    let ports = Ports {
        clock: Arc::new(SystemClock::new()),
        pwm: Arc::new(LedcPwm::new()),
        gpio: Arc::new(Gpio),
        voltage: Arc::new(SupplyAdc),
        probe: Arc::new(IcmpProbe::new()),
        system: Arc::new(Chip::new()),
        indicator,
        vars: Arc::new(VariableRegistry::new()),
        nvs: Box::new(nvs),
        sd,
        tach: core::array::from_fn(|i| Some(&TACH[i])),
    };

    // ── 4. Control plane ──────────────────────────────────────
    let mut plane = ControlPlane::new(ports, ControllerConfig::default())
        .map_err(|e| anyhow::anyhow!("control plane init failed: {}", e))?;
    if let Some(pw) = option_env!("RACKCTL_ADMIN_PASSWORD") {
        plane
            .add_user("admin", pw, Level::Admin)
            .map_err(|e| anyhow::anyhow!("admin user: {}", e))?;
    } else {
        warn!("no admin password configured, mutating endpoints are unreachable");
    }
    plane
        .spawn_tasks()
        .map_err(|e| anyhow::anyhow!("task spawn failed: {}", e))?;

    info!("System ready.");

    // ── 5. Idle ───────────────────────────────────────────────
    loop {
        std::thread::sleep(Duration::from_secs(HEARTBEAT_SECS));
        let p = plane.policy().status();
        let s = plane.bus().stats();
        info!(
            "heartbeat: power={} {:.2}V, temp={}, events posted={} dropped={}",
            p.state.name(),
            p.voltage,
            plane.temp().get_effective().value,
            s.posted,
            s.dropped
        );
    }
}
