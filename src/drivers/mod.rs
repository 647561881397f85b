//! Raw peripheral access: GPIO, LEDC PWM, ADC, tach ISR counters and the
//! status LED.

pub mod hw_init;
pub mod status_led;
pub mod tach;
