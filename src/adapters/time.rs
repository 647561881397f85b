//! Clock adapters implementing [`ClockPort`].
//!
//! - **`target_os = "espidf"`**: [`SystemClock`] wraps `esp_timer_get_time()`
//!   (microsecond precision, monotonic) and sleeps through FreeRTOS.
//! - **`not(target_os = "espidf")`**: `std::time::Instant` and
//!   `std::thread::sleep`.
//!
//! [`SimClock`] is a manually advanced clock for deterministic tests;
//! `sleep_ms` advances it instead of blocking.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::app::ports::ClockPort;

/// Monotonic clock backed by the platform timer.
pub struct SystemClock {
    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
        }
    }
}

impl ClockPort for SystemClock {
    #[cfg(target_os = "espidf")]
    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }

    #[cfg(not(target_os = "espidf"))]
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    #[cfg(target_os = "espidf")]
    fn now_us(&self) -> u64 {
        (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64
    }

    #[cfg(not(target_os = "espidf"))]
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    #[cfg(target_os = "espidf")]
    fn sleep_ms(&self, ms: u32) {
        esp_idf_hal::delay::FreeRtos::delay_ms(ms);
    }

    #[cfg(not(target_os = "espidf"))]
    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

/// Manually driven clock (microsecond resolution).
#[derive(Debug, Default)]
pub struct SimClock {
    now_us: AtomicU64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at_ms(ms: u64) -> Self {
        Self {
            now_us: AtomicU64::new(ms * 1000),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.fetch_add(ms * 1000, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_us.store(ms * 1000, Ordering::SeqCst);
    }
}

impl ClockPort for SimClock {
    fn now_ms(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst) / 1000
    }

    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u32) {
        self.advance_ms(u64::from(ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_sleep_advances() {
        let c = SimClock::starting_at_ms(100);
        c.sleep_ms(500);
        assert_eq!(c.now_ms(), 600);
        assert_eq!(c.now_us(), 600_000);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let c = SystemClock::new();
        let a = c.now_us();
        let b = c.now_us();
        assert!(b >= a);
    }
}
