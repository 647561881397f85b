//! GPIO / peripheral pin assignments for the rack controller board
//! (ESP32-S3).
//!
//! Single source of truth: every driver and adapter references this
//! module rather than hard-coding pin numbers. `-1` marks a function
//! that is not wired on this board revision.

// ---------------------------------------------------------------------------
// Fans
// ---------------------------------------------------------------------------

/// Number of fan slots the controller supports.
pub const FAN_COUNT: usize = 4;

/// Fan PWM outputs (25 kHz). Only fan 0 is populated.
pub const FAN_PWM_GPIO: [i32; FAN_COUNT] = [41, -1, -1, -1];
/// Fan tachometer inputs (open-drain, 2 pulses per revolution).
pub const FAN_TACH_GPIO: [i32; FAN_COUNT] = [-1, -1, -1, -1];

/// LEDC PWM frequency for fans.
pub const FAN_PWM_FREQ_HZ: u32 = 25_000;
/// LEDC timer resolution for fans (bits). 10-bit gives 0 – 1023.
pub const FAN_PWM_RESOLUTION_BITS: u8 = 10;
/// Tach pulses per fan revolution.
pub const FAN_TACH_PULSES_PER_REV: u32 = 2;

// ---------------------------------------------------------------------------
// AGX compute module
// ---------------------------------------------------------------------------

/// Power enable. LOW = on, HIGH = off (forced shutdown).
pub const AGX_POWER_GPIO: i32 = 3;
/// Reset. HIGH = in reset.
pub const AGX_RESET_GPIO: i32 = 1;
/// Force-recovery strap. HIGH = recovery; also pulsed for force-off.
pub const AGX_FORCE_RECOVERY_GPIO: i32 = 40;
/// Power-good input. Not wired on this revision.
pub const AGX_POWER_GOOD_GPIO: i32 = -1;

// ---------------------------------------------------------------------------
// LPMU
// ---------------------------------------------------------------------------

/// Power button (pulse HIGH toggles power).
pub const LPMU_POWER_GPIO: i32 = 46;
/// Reset (pulse HIGH).
pub const LPMU_RESET_GPIO: i32 = 2;

/// Management address of the LPMU on the internal network.
pub const LPMU_ADDR: &str = "10.10.99.99";

// ---------------------------------------------------------------------------
// Supply voltage (ADC2 channel 7)
// ---------------------------------------------------------------------------

pub const POWER_ADC_GPIO: i32 = 18;
pub const POWER_ADC_CHANNEL: u32 = 7;
/// Resistor divider between the rack input and the ADC pin.
pub const POWER_DIVIDER_RATIO: f32 = 11.4;
/// Full-scale ADC input at 12 dB attenuation (mV).
pub const POWER_ADC_FULL_SCALE_MV: u32 = 3100;

// ---------------------------------------------------------------------------
// Status LED (discrete RGB on LEDC)
// ---------------------------------------------------------------------------

pub const LED_R_GPIO: i32 = 21;
pub const LED_G_GPIO: i32 = 14;
pub const LED_B_GPIO: i32 = 13;
/// LEDC frequency for the status LED.
pub const LED_PWM_FREQ_HZ: u32 = 1_000;

// ---------------------------------------------------------------------------
// SD card (SDMMC 4-bit)
// ---------------------------------------------------------------------------

pub const SD_CMD_GPIO: i32 = 15;
pub const SD_CLK_GPIO: i32 = 16;
pub const SD_D0_GPIO: i32 = 4;
pub const SD_D1_GPIO: i32 = 5;
pub const SD_D2_GPIO: i32 = 6;
pub const SD_D3_GPIO: i32 = 7;

/// True when `gpio` names a wired pin.
pub const fn is_wired(gpio: i32) -> bool {
    gpio >= 0
}
