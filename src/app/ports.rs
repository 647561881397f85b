//! Port traits: the hexagonal boundary between the control plane and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ TempManager / FanController / PowerPolicy
//! ```
//!
//! Driven adapters (PWM, GPIO, ADC, storage tiers, clocks) implement these
//! traits. Subsystems hold them as `Arc<dyn Port>` so the same object can be
//! shared between the periodic tasks and the API handlers; every method
//! therefore takes `&self` and implementations use interior mutability.
//!
//! Storage ports are the exception: they are owned by the
//! [`ConfigStore`](crate::store::ConfigStore) behind its lock and take
//! `&mut self` for writes.

pub use embedded_hal::digital::PinState;

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic time source.
pub trait ClockPort: Send + Sync {
    /// Milliseconds since boot.
    fn now_ms(&self) -> u64;

    /// Microseconds since boot.
    fn now_us(&self) -> u64 {
        self.now_ms() * 1000
    }

    /// Block the calling task for `ms` milliseconds.
    fn sleep_ms(&self, ms: u32);
}

// ───────────────────────────────────────────────────────────────
// PWM port (fan drive)
// ───────────────────────────────────────────────────────────────

/// LEDC-style PWM output.
pub trait PwmPort: Send + Sync {
    /// Bind `channel` to `gpio` at the given frequency/resolution.
    fn configure(&self, channel: u8, gpio: i32, freq_hz: u32, resolution_bits: u8)
        -> Result<(), HwError>;

    /// Set the duty cycle of `channel` in percent (0–100).
    fn set_duty(&self, channel: u8, percent: u8) -> Result<(), HwError>;
}

// ───────────────────────────────────────────────────────────────
// GPIO port (device pulses)
// ───────────────────────────────────────────────────────────────

/// Digital I/O used by the device-power facade.
pub trait GpioPort: Send + Sync {
    fn configure_output(&self, pin: i32, initial: PinState) -> Result<(), HwError>;
    fn configure_input(&self, pin: i32) -> Result<(), HwError>;
    fn write(&self, pin: i32, level: PinState) -> Result<(), HwError>;
    fn read(&self, pin: i32) -> Result<PinState, HwError>;
}

// ───────────────────────────────────────────────────────────────
// Supply voltage port
// ───────────────────────────────────────────────────────────────

/// Supply-voltage measurement (ADC behind a fixed divider).
pub trait VoltagePort: Send + Sync {
    /// Volts at the rack input.
    fn read_supply_voltage(&self) -> Result<f32, HwError>;
}

// ───────────────────────────────────────────────────────────────
// Network probe port
// ───────────────────────────────────────────────────────────────

/// ICMP-style reachability probe.
pub trait NetProbePort: Send + Sync {
    fn ping(&self, addr: &str, timeout_ms: u32) -> bool;
}

// ───────────────────────────────────────────────────────────────
// System port
// ───────────────────────────────────────────────────────────────

/// Controller-level primitives.
pub trait SystemPort: Send + Sync {
    /// Flush pending log output before a restart.
    fn flush_logs(&self) {}

    /// Restart the controller. Does not return on target.
    fn restart(&self);
}

// ───────────────────────────────────────────────────────────────
// Indicator port
// ───────────────────────────────────────────────────────────────

/// Front-panel feedback patterns driven by the power policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorPattern {
    /// Normal operation.
    Normal,
    /// Low voltage, shutdown or protected: orange breathe.
    Warning,
}

pub trait IndicatorPort: Send + Sync {
    fn show(&self, pattern: IndicatorPattern);
}

// ───────────────────────────────────────────────────────────────
// Variable registry port
// ───────────────────────────────────────────────────────────────

/// Named scalar registry (automation variables) the `VARIABLE`
/// temperature source binds to.
pub trait VariablePort: Send + Sync {
    fn get_float(&self, name: &str) -> Option<f64>;

    fn exists(&self, name: &str) -> bool {
        self.get_float(name).is_some()
    }

    /// Export a value under `name` for other consumers (automation rules,
    /// dashboards). Registries that are read-only ignore it.
    fn publish(&self, _name: &str, _value: f64) {}
}

// ───────────────────────────────────────────────────────────────
// Storage ports
// ───────────────────────────────────────────────────────────────

/// On-device key-value storage (NVS).
///
/// Keys are namespaced to prevent collisions between subsystems. Write
/// operations MUST be atomic, with no partial writes on power loss. The
/// ESP-IDF NVS API guarantees this natively; in-memory simulation
/// achieves it trivially.
pub trait StoragePort: Send {
    /// Read a value. Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

/// Removable file storage (SD card). Paths are relative to the card root.
pub trait FilePort: Send {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    fn exists(&self, path: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from driver-level ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwError {
    /// PWM duty write failed.
    PwmWriteFailed,
    /// PWM channel/timer configuration failed.
    PwmConfigFailed,
    /// GPIO set failed.
    GpioWriteFailed,
    /// GPIO read failed.
    GpioReadFailed,
    /// GPIO direction/pull configuration failed.
    GpioConfigFailed,
    /// ADC read failed or timed out.
    AdcReadFailed,
    /// Channel or pin was never configured.
    NotConfigured,
}

impl core::fmt::Display for HwError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PwmWriteFailed => write!(f, "PWM write failed"),
            Self::PwmConfigFailed => write!(f, "PWM config failed"),
            Self::GpioWriteFailed => write!(f, "GPIO write failed"),
            Self::GpioReadFailed => write!(f, "GPIO read failed"),
            Self::GpioConfigFailed => write!(f, "GPIO config failed"),
            Self::AdcReadFailed => write!(f, "ADC read failed"),
            Self::NotConfigured => write!(f, "not configured"),
        }
    }
}

/// Errors from [`StoragePort`] / [`FilePort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key or file does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
    /// The SD card is not mounted.
    NotMounted,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
            Self::NotMounted => write!(f, "SD card not mounted"),
        }
    }
}

/// Errors from loading or validating a persisted config record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// No record in either tier (first boot).
    NotFound,
    /// Stored record failed deserialization.
    Corrupted,
    /// A field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// Underlying storage failed.
    Storage(StorageError),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => Self::NotFound,
            other => Self::Storage(other),
        }
    }
}
