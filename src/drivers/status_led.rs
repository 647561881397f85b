//! RGB status LED driver.
//!
//! Three LEDC PWM channels drive a discrete common-cathode RGB LED on the
//! 1 kHz LED timer.
//!
//! On ESP-IDF: drives the channels via hw_init.
//! On host/test: the hw_init model records the duties.

use crate::app::ports::HwError;
use crate::drivers::hw_init;
use crate::pins;

/// Colour as (R, G, B), each 0–255.
pub type Rgb = (u8, u8, u8);

pub const GREEN: Rgb = (0, 160, 40);
pub const ORANGE: Rgb = (255, 100, 0);

pub struct StatusLed {
    current: Rgb,
}

impl StatusLed {
    /// Bind the three channels and switch the LED off.
    pub fn new() -> Result<Self, HwError> {
        hw_init::ledc_bind(hw_init::LEDC_CH_LED_R, pins::LED_R_GPIO, hw_init::LEDC_TIMER_LED)?;
        hw_init::ledc_bind(hw_init::LEDC_CH_LED_G, pins::LED_G_GPIO, hw_init::LEDC_TIMER_LED)?;
        hw_init::ledc_bind(hw_init::LEDC_CH_LED_B, pins::LED_B_GPIO, hw_init::LEDC_TIMER_LED)?;
        let mut led = Self { current: (0, 0, 0) };
        led.off()?;
        Ok(led)
    }

    pub fn set_colour(&mut self, (r, g, b): Rgb) -> Result<(), HwError> {
        hw_init::ledc_set_raw(hw_init::LEDC_CH_LED_R, u32::from(r))?;
        hw_init::ledc_set_raw(hw_init::LEDC_CH_LED_G, u32::from(g))?;
        hw_init::ledc_set_raw(hw_init::LEDC_CH_LED_B, u32::from(b))?;
        self.current = (r, g, b);
        Ok(())
    }

    pub fn off(&mut self) -> Result<(), HwError> {
        self.set_colour((0, 0, 0))
    }

    pub fn current_colour(&self) -> Rgb {
        self.current
    }
}
