//! Fan tachometer pulse counter.
//!
//! The ISR increments an [`AtomicU32`]; the fan update loop samples and
//! clears it once per tick. No lock is taken in interrupt context.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::pins;

#[derive(Debug, Default)]
pub struct TachCounter {
    pulses: AtomicU32,
}

impl TachCounter {
    pub const fn new() -> Self {
        Self {
            pulses: AtomicU32::new(0),
        }
    }

    /// Record one pulse. ISR-safe.
    #[inline]
    pub fn on_pulse(&self) {
        self.pulses.fetch_add(1, Ordering::Relaxed);
    }

    /// Inject `n` pulses (host simulation and tests).
    pub fn add(&self, n: u32) {
        self.pulses.fetch_add(n, Ordering::Relaxed);
    }

    /// Read and zero the counter.
    pub fn take(&self) -> u32 {
        self.pulses.swap(0, Ordering::Relaxed)
    }
}

/// RPM from `pulses` counted over `elapsed_us`.
pub fn rpm_from_pulses(pulses: u32, elapsed_us: u64) -> u32 {
    if elapsed_us == 0 {
        return 0;
    }
    let rpm = u64::from(pulses) * 60 * 1_000_000
        / (elapsed_us * u64::from(pins::FAN_TACH_PULSES_PER_REV));
    rpm.min(u64::from(u32::MAX)) as u32
}

#[cfg(target_os = "espidf")]
unsafe extern "C" fn tach_isr(arg: *mut core::ffi::c_void) {
    // SAFETY: arg is the &'static TachCounter registered in attach_isr().
    let counter = unsafe { &*(arg as *const TachCounter) };
    counter.on_pulse();
}

/// Configure `gpio` as a falling-edge input feeding `counter`.
#[cfg(target_os = "espidf")]
pub fn attach_isr(gpio: i32, counter: &'static TachCounter) -> Result<(), crate::app::ports::HwError> {
    use crate::app::ports::HwError;
    use esp_idf_svc::sys::*;

    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << gpio,
        mode: gpio_mode_t_GPIO_MODE_INPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_ENABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_NEGEDGE,
    };
    // SAFETY: the ISR service is installed by hw_init::init_peripherals();
    // the counter outlives the handler.
    unsafe {
        if gpio_config(&cfg) != ESP_OK as i32 {
            return Err(HwError::GpioConfigFailed);
        }
        let arg = counter as *const TachCounter as *mut core::ffi::c_void;
        if gpio_isr_handler_add(gpio, Some(tach_isr), arg) != ESP_OK as i32 {
            return Err(HwError::GpioConfigFailed);
        }
    }
    log::info!("tach: ISR attached on GPIO{}", gpio);
    Ok(())
}

/// No interrupts on host; tests inject pulses with [`TachCounter::add`].
#[cfg(not(target_os = "espidf"))]
pub fn attach_isr(gpio: i32, _counter: &'static TachCounter) -> Result<(), crate::app::ports::HwError> {
    log::debug!("tach(sim): GPIO{} uses injected pulses", gpio);
    Ok(())
}
