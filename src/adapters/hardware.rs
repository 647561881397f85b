//! Hardware adapter: bridges real peripherals to the port traits.
//!
//! This is the only module that touches the chip. Each port gets its own
//! small adapter so the composition root can share them independently as
//! `Arc<dyn Port>`. On non-espidf targets the underlying `hw_init` helpers
//! run against the in-memory pin model.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use log::{info, warn};

use crate::app::ports::{
    GpioPort, HwError, IndicatorPattern, IndicatorPort, NetProbePort, PinState, PwmPort,
    SystemPort, VoltagePort,
};
use crate::drivers::hw_init;
use crate::drivers::status_led::{self, StatusLed};
use crate::pins;

// ── PWM ───────────────────────────────────────────────────────

/// LEDC fan outputs on the shared 25 kHz timer.
pub struct LedcPwm {
    resolution_bits: AtomicU32,
}

impl Default for LedcPwm {
    fn default() -> Self {
        Self::new()
    }
}

impl LedcPwm {
    pub fn new() -> Self {
        Self {
            resolution_bits: AtomicU32::new(u32::from(pins::FAN_PWM_RESOLUTION_BITS)),
        }
    }
}

impl PwmPort for LedcPwm {
    fn configure(
        &self,
        channel: u8,
        gpio: i32,
        freq_hz: u32,
        resolution_bits: u8,
    ) -> Result<(), HwError> {
        if !pins::is_wired(gpio) {
            return Err(HwError::NotConfigured);
        }
        if freq_hz != pins::FAN_PWM_FREQ_HZ || resolution_bits != pins::FAN_PWM_RESOLUTION_BITS {
            warn!(
                "pwm: CH{} requested {}Hz/{}bit, fan timer runs {}Hz/{}bit",
                channel,
                freq_hz,
                resolution_bits,
                pins::FAN_PWM_FREQ_HZ,
                pins::FAN_PWM_RESOLUTION_BITS
            );
        }
        hw_init::ledc_bind(channel, gpio, hw_init::LEDC_TIMER_FAN)?;
        self.resolution_bits
            .store(u32::from(pins::FAN_PWM_RESOLUTION_BITS), Ordering::Relaxed);
        info!("pwm: CH{} -> GPIO{}", channel, gpio);
        Ok(())
    }

    fn set_duty(&self, channel: u8, percent: u8) -> Result<(), HwError> {
        let bits = self.resolution_bits.load(Ordering::Relaxed) as u8;
        hw_init::ledc_set_raw(channel, hw_init::percent_to_raw(percent, bits))
    }
}

// ── GPIO ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct Gpio;

impl GpioPort for Gpio {
    fn configure_output(&self, pin: i32, initial: PinState) -> Result<(), HwError> {
        hw_init::gpio_configure_output(pin, initial == PinState::High)
    }

    fn configure_input(&self, pin: i32) -> Result<(), HwError> {
        hw_init::gpio_configure_input(pin)
    }

    fn write(&self, pin: i32, level: PinState) -> Result<(), HwError> {
        hw_init::gpio_write(pin, level == PinState::High)
    }

    fn read(&self, pin: i32) -> Result<PinState, HwError> {
        hw_init::gpio_read(pin).map(PinState::from)
    }
}

// ── Supply voltage ────────────────────────────────────────────

#[derive(Default)]
pub struct SupplyAdc;

impl VoltagePort for SupplyAdc {
    fn read_supply_voltage(&self) -> Result<f32, HwError> {
        hw_init::adc_read_supply_raw().map(hw_init::raw_to_supply_volts)
    }
}

// ── Indicator ─────────────────────────────────────────────────

/// Status LED driven by the power policy.
pub struct LedIndicator {
    led: Mutex<StatusLed>,
}

impl LedIndicator {
    pub fn new() -> Result<Self, HwError> {
        Ok(Self {
            led: Mutex::new(StatusLed::new()?),
        })
    }

    pub fn colour(&self) -> status_led::Rgb {
        self.led.lock().unwrap_or_else(PoisonError::into_inner).current_colour()
    }
}

impl IndicatorPort for LedIndicator {
    fn show(&self, pattern: IndicatorPattern) {
        let colour = match pattern {
            IndicatorPattern::Normal => status_led::GREEN,
            IndicatorPattern::Warning => status_led::ORANGE,
        };
        let mut led = self.led.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = led.set_colour(colour) {
            warn!("led: failed to show {:?}: {}", pattern, e);
        }
    }
}

// ── Network probe ─────────────────────────────────────────────

/// ICMP echo through the ESP-IDF ping session.
#[derive(Default)]
pub struct IcmpProbe {
    /// Host simulation: reachability answer.
    #[cfg(not(target_os = "espidf"))]
    reachable: AtomicBool,
}

impl IcmpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }
}

impl NetProbePort for IcmpProbe {
    #[cfg(target_os = "espidf")]
    fn ping(&self, addr: &str, timeout_ms: u32) -> bool {
        use esp_idf_svc::ping::{Configuration, EspPing};

        let Ok(ip) = addr.parse::<core::net::Ipv4Addr>() else {
            warn!("ping: bad address {}", addr);
            return false;
        };
        let conf = Configuration {
            count: 1,
            timeout: core::time::Duration::from_millis(u64::from(timeout_ms)),
            ..Default::default()
        };
        match EspPing::default().ping(ip, &conf) {
            Ok(summary) => summary.received > 0,
            Err(e) => {
                warn!("ping: {} failed: {}", addr, e);
                false
            }
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn ping(&self, addr: &str, timeout_ms: u32) -> bool {
        let ok = self.reachable.load(Ordering::Relaxed);
        log::debug!("ping(sim): {} ({}ms) -> {}", addr, timeout_ms, ok);
        ok
    }
}

// ── System ────────────────────────────────────────────────────

#[derive(Default)]
pub struct Chip {
    restart_requested: AtomicBool,
}

impl Chip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Acquire)
    }
}

impl SystemPort for Chip {
    fn flush_logs(&self) {
        log::logger().flush();
    }

    fn restart(&self) {
        self.restart_requested.store(true, Ordering::Release);
        info!("system: restarting controller");
        platform_restart();
    }
}

#[cfg(target_os = "espidf")]
fn platform_restart() {
    // SAFETY: esp_restart never returns; all tasks are torn down by the ROM.
    unsafe { esp_idf_svc::sys::esp_restart() }
}

#[cfg(not(target_os = "espidf"))]
fn platform_restart() {}
