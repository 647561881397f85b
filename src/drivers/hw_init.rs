//! Raw peripheral access: GPIO, LEDC PWM and the supply-voltage ADC.
//!
//! Uses ESP-IDF sys calls directly. `init_peripherals()` runs once from
//! `main()` before any task starts; the per-call helpers are then used by
//! the port adapters in [`crate::adapters::hardware`].
//!
//! On host builds the helpers operate on an in-memory pin/channel model so
//! the adapter stays testable.

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

use crate::app::ports::HwError;
use crate::pins;

// ── Error type ────────────────────────────────────────────────

/// Errors during one-shot peripheral initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwInitError {
    AdcInitFailed(i32),
    GpioConfigFailed(i32),
    LedcInitFailed(i32),
    IsrInstallFailed(i32),
}

impl core::fmt::Display for HwInitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AdcInitFailed(rc) => write!(f, "ADC2 init failed (rc={})", rc),
            Self::GpioConfigFailed(rc) => write!(f, "GPIO config failed (rc={})", rc),
            Self::LedcInitFailed(rc) => write!(f, "LEDC timer config failed (rc={})", rc),
            Self::IsrInstallFailed(rc) => write!(f, "GPIO ISR service install failed (rc={})", rc),
        }
    }
}

/// LEDC timers. Fans share timer 0 (25 kHz/10-bit), the LED uses timer 1.
pub const LEDC_TIMER_FAN: u32 = 0;
pub const LEDC_TIMER_LED: u32 = 1;

/// LEDC channels. Fan `i` uses channel `i`.
pub const LEDC_CH_LED_R: u8 = 4;
pub const LEDC_CH_LED_G: u8 = 5;
pub const LEDC_CH_LED_B: u8 = 6;
pub const LEDC_CHANNELS: usize = 8;

// ── Init ──────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
use log::info;

#[cfg(target_os = "espidf")]
pub fn init_peripherals() -> Result<(), HwInitError> {
    // SAFETY: called once from main() before any task is spawned.
    unsafe {
        init_adc()?;
        init_ledc_timers()?;
        let ret = gpio_install_isr_service(0);
        if ret != ESP_OK as i32 && ret != ESP_ERR_INVALID_STATE as i32 {
            return Err(HwInitError::IsrInstallFailed(ret));
        }
    }
    info!("hw_init: all peripherals configured");
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn init_peripherals() -> Result<(), HwInitError> {
    log::info!("hw_init(sim): peripheral init skipped");
    Ok(())
}

// ── ADC (oneshot, ADC2) ───────────────────────────────────────

#[cfg(target_os = "espidf")]
static mut ADC2_HANDLE: adc_oneshot_unit_handle_t = core::ptr::null_mut();

#[cfg(target_os = "espidf")]
unsafe fn init_adc() -> Result<(), HwInitError> {
    let init_cfg = adc_oneshot_unit_init_cfg_t {
        unit_id: adc_unit_t_ADC_UNIT_2,
        ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
        ..Default::default()
    };
    // SAFETY: ADC2_HANDLE is only written here, once at boot.
    let ret = unsafe { adc_oneshot_new_unit(&init_cfg, &raw mut ADC2_HANDLE) };
    if ret != ESP_OK as i32 {
        return Err(HwInitError::AdcInitFailed(ret));
    }

    let chan_cfg = adc_oneshot_chan_cfg_t {
        atten: adc_atten_t_ADC_ATTEN_DB_12,
        bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
    };
    let ret = unsafe { adc_oneshot_config_channel(ADC2_HANDLE, pins::POWER_ADC_CHANNEL, &chan_cfg) };
    if ret != ESP_OK as i32 {
        return Err(HwInitError::AdcInitFailed(ret));
    }

    info!("hw_init: ADC2 CH{} configured (supply voltage)", pins::POWER_ADC_CHANNEL);
    Ok(())
}

/// Raw 12-bit reading of the supply-voltage channel.
#[cfg(target_os = "espidf")]
pub fn adc_read_supply_raw() -> Result<u16, HwError> {
    let mut raw: i32 = 0;
    // SAFETY: ADC2_HANDLE is written once during init_adc() before any reader runs.
    let ret = unsafe { adc_oneshot_read(ADC2_HANDLE, pins::POWER_ADC_CHANNEL, &mut raw) };
    if ret != ESP_OK as i32 {
        return Err(HwError::AdcReadFailed);
    }
    Ok(raw.clamp(0, 4095) as u16)
}

#[cfg(not(target_os = "espidf"))]
pub fn adc_read_supply_raw() -> Result<u16, HwError> {
    Ok(sim::adc_raw())
}

/// Convert a raw ADC reading to volts at the rack input.
pub fn raw_to_supply_volts(raw: u16) -> f32 {
    let mv = u32::from(raw) * pins::POWER_ADC_FULL_SCALE_MV / 4095;
    mv as f32 / 1000.0 * pins::POWER_DIVIDER_RATIO
}

// ── GPIO ──────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub fn gpio_configure_output(pin: i32, high: bool) -> Result<(), HwError> {
    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pin,
        mode: gpio_mode_t_GPIO_MODE_INPUT_OUTPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    // SAFETY: pin comes from the board pin map; gpio_config is re-entrant per pin.
    unsafe {
        if gpio_config(&cfg) != ESP_OK as i32 {
            return Err(HwError::GpioConfigFailed);
        }
        if gpio_set_level(pin, u32::from(high)) != ESP_OK as i32 {
            return Err(HwError::GpioWriteFailed);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn gpio_configure_output(pin: i32, high: bool) -> Result<(), HwError> {
    sim::configure(pin, true)?;
    sim::set_level(pin, high)
}

#[cfg(target_os = "espidf")]
pub fn gpio_configure_input(pin: i32) -> Result<(), HwError> {
    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pin,
        mode: gpio_mode_t_GPIO_MODE_INPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_ENABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    // SAFETY: see gpio_configure_output.
    if unsafe { gpio_config(&cfg) } != ESP_OK as i32 {
        return Err(HwError::GpioConfigFailed);
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn gpio_configure_input(pin: i32) -> Result<(), HwError> {
    sim::configure(pin, false)
}

#[cfg(target_os = "espidf")]
pub fn gpio_write(pin: i32, high: bool) -> Result<(), HwError> {
    // SAFETY: register write on a configured output pin.
    if unsafe { gpio_set_level(pin, u32::from(high)) } != ESP_OK as i32 {
        return Err(HwError::GpioWriteFailed);
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn gpio_write(pin: i32, high: bool) -> Result<(), HwError> {
    sim::set_level(pin, high)
}

#[cfg(target_os = "espidf")]
pub fn gpio_read(pin: i32) -> Result<bool, HwError> {
    if !(0..64).contains(&pin) {
        return Err(HwError::GpioReadFailed);
    }
    // SAFETY: read-only register access.
    Ok(unsafe { gpio_get_level(pin) } != 0)
}

#[cfg(not(target_os = "espidf"))]
pub fn gpio_read(pin: i32) -> Result<bool, HwError> {
    sim::level(pin)
}

// ── LEDC PWM ──────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
unsafe fn init_ledc_timers() -> Result<(), HwInitError> {
    let fan_timer = ledc_timer_config_t {
        speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
        timer_num: LEDC_TIMER_FAN,
        duty_resolution: u32::from(pins::FAN_PWM_RESOLUTION_BITS),
        freq_hz: pins::FAN_PWM_FREQ_HZ,
        clk_cfg: soc_periph_ledc_clk_src_legacy_t_LEDC_AUTO_CLK,
        ..Default::default()
    };
    let ret = unsafe { ledc_timer_config(&fan_timer) };
    if ret != ESP_OK as i32 {
        return Err(HwInitError::LedcInitFailed(ret));
    }

    let led_timer = ledc_timer_config_t {
        speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
        timer_num: LEDC_TIMER_LED,
        duty_resolution: ledc_timer_bit_t_LEDC_TIMER_8_BIT,
        freq_hz: pins::LED_PWM_FREQ_HZ,
        clk_cfg: soc_periph_ledc_clk_src_legacy_t_LEDC_AUTO_CLK,
        ..Default::default()
    };
    let ret = unsafe { ledc_timer_config(&led_timer) };
    if ret != ESP_OK as i32 {
        return Err(HwInitError::LedcInitFailed(ret));
    }

    info!(
        "hw_init: LEDC timers configured (fan={}Hz/{}bit, led={}Hz)",
        pins::FAN_PWM_FREQ_HZ,
        pins::FAN_PWM_RESOLUTION_BITS,
        pins::LED_PWM_FREQ_HZ
    );
    Ok(())
}

/// Bind an LEDC channel to a GPIO on the given timer, duty 0.
#[cfg(target_os = "espidf")]
pub fn ledc_bind(channel: u8, gpio: i32, timer: u32) -> Result<(), HwError> {
    let cfg = ledc_channel_config_t {
        speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
        channel: u32::from(channel),
        timer_sel: timer,
        gpio_num: gpio,
        duty: 0,
        hpoint: 0,
        ..Default::default()
    };
    // SAFETY: channel/timer indices are in range; called from config paths only.
    if unsafe { ledc_channel_config(&cfg) } != ESP_OK as i32 {
        return Err(HwError::PwmConfigFailed);
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn ledc_bind(channel: u8, gpio: i32, _timer: u32) -> Result<(), HwError> {
    sim::bind_channel(channel, gpio)
}

/// Set a channel's duty in raw counts.
#[cfg(target_os = "espidf")]
pub fn ledc_set_raw(channel: u8, duty: u32) -> Result<(), HwError> {
    // SAFETY: channel was bound by ledc_bind(); duty writes are per-channel.
    unsafe {
        if ledc_set_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, u32::from(channel), duty) != ESP_OK as i32 {
            return Err(HwError::PwmWriteFailed);
        }
        if ledc_update_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, u32::from(channel)) != ESP_OK as i32 {
            return Err(HwError::PwmWriteFailed);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn ledc_set_raw(channel: u8, duty: u32) -> Result<(), HwError> {
    sim::set_duty(channel, duty)
}

/// Percent (0–100) to raw counts at `resolution_bits`.
pub fn percent_to_raw(percent: u8, resolution_bits: u8) -> u32 {
    let max = (1u32 << resolution_bits) - 1;
    u32::from(percent.min(100)) * max / 100
}

// ── Host model ────────────────────────────────────────────────

/// In-memory pin and channel model used on host builds.
#[cfg(not(target_os = "espidf"))]
pub mod sim {
    use std::sync::{Mutex, PoisonError};

    use crate::app::ports::HwError;

    struct Model {
        outputs: u64,
        configured: u64,
        levels: u64,
        channels: [Option<(i32, u32)>; super::LEDC_CHANNELS],
        adc_raw: u16,
    }

    static MODEL: Mutex<Model> = Mutex::new(Model {
        outputs: 0,
        configured: 0,
        levels: 0,
        channels: [None; super::LEDC_CHANNELS],
        adc_raw: 0,
    });

    fn with<T>(f: impl FnOnce(&mut Model) -> T) -> T {
        f(&mut MODEL.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn bit(pin: i32) -> Result<u64, HwError> {
        if (0..64).contains(&pin) {
            Ok(1u64 << pin)
        } else {
            Err(HwError::NotConfigured)
        }
    }

    pub(super) fn configure(pin: i32, output: bool) -> Result<(), HwError> {
        let b = bit(pin).map_err(|_| HwError::GpioConfigFailed)?;
        with(|m| {
            m.configured |= b;
            if output {
                m.outputs |= b;
            } else {
                m.outputs &= !b;
            }
        });
        Ok(())
    }

    pub(super) fn set_level(pin: i32, high: bool) -> Result<(), HwError> {
        let b = bit(pin).map_err(|_| HwError::GpioWriteFailed)?;
        with(|m| {
            if m.outputs & b == 0 {
                return Err(HwError::NotConfigured);
            }
            if high {
                m.levels |= b;
            } else {
                m.levels &= !b;
            }
            Ok(())
        })
    }

    pub(super) fn level(pin: i32) -> Result<bool, HwError> {
        let b = bit(pin).map_err(|_| HwError::GpioReadFailed)?;
        with(|m| {
            if m.configured & b == 0 {
                return Err(HwError::NotConfigured);
            }
            Ok(m.levels & b != 0)
        })
    }

    /// Drive an input pin from a test.
    pub fn drive_input(pin: i32, high: bool) {
        if let Ok(b) = bit(pin) {
            with(|m| {
                if high {
                    m.levels |= b;
                } else {
                    m.levels &= !b;
                }
            });
        }
    }

    pub(super) fn bind_channel(channel: u8, gpio: i32) -> Result<(), HwError> {
        with(|m| {
            let slot = m
                .channels
                .get_mut(usize::from(channel))
                .ok_or(HwError::PwmConfigFailed)?;
            *slot = Some((gpio, 0));
            Ok(())
        })
    }

    pub(super) fn set_duty(channel: u8, duty: u32) -> Result<(), HwError> {
        with(|m| match m.channels.get_mut(usize::from(channel)) {
            Some(Some((_, d))) => {
                *d = duty;
                Ok(())
            }
            _ => Err(HwError::NotConfigured),
        })
    }

    /// Raw duty of a bound channel.
    pub fn duty(channel: u8) -> Option<u32> {
        with(|m| m.channels.get(usize::from(channel)).copied().flatten().map(|(_, d)| d))
    }

    pub(super) fn adc_raw() -> u16 {
        with(|m| m.adc_raw)
    }

    /// Set the simulated supply-voltage ADC reading.
    pub fn set_adc_raw(raw: u16) {
        with(|m| m.adc_raw = raw.min(4095));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_maps_to_10_bit_counts() {
        assert_eq!(percent_to_raw(0, 10), 0);
        assert_eq!(percent_to_raw(100, 10), 1023);
        assert_eq!(percent_to_raw(50, 10), 511);
        assert_eq!(percent_to_raw(150, 10), 1023);
    }

    #[test]
    fn supply_conversion_uses_divider() {
        assert!(raw_to_supply_volts(0).abs() < f32::EPSILON);
        let full = raw_to_supply_volts(4095);
        assert!((full - 3.1 * pins::POWER_DIVIDER_RATIO).abs() < 0.01);
    }

    #[test]
    fn sim_gpio_requires_configuration() {
        assert_eq!(gpio_write(60, true), Err(HwError::NotConfigured));
        gpio_configure_output(60, false).unwrap();
        gpio_write(60, true).unwrap();
        assert_eq!(gpio_read(60), Ok(true));
    }

    #[test]
    fn sim_ledc_tracks_duty() {
        ledc_bind(7, 33, LEDC_TIMER_LED).unwrap();
        ledc_set_raw(7, 512).unwrap();
        assert_eq!(sim::duty(7), Some(512));
    }
}
