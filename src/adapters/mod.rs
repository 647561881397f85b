//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter      | Implements                     | Connects to               |
//! |--------------|--------------------------------|---------------------------|
//! | `hardware`   | PwmPort, GpioPort, VoltagePort | ESP32 LEDC, GPIO, ADC2    |
//! |              | IndicatorPort, NetProbePort    | RGB LED, ICMP ping        |
//! |              | SystemPort                     | esp_restart               |
//! | `log_sink`   | bus subscriber                 | Serial log output         |
//! | `nvs`        | StoragePort                    | NVS / in-memory store     |
//! | `sd`         | FilePort                       | FAT on SD / in-memory     |
//! | `time`       | ClockPort                      | esp_timer / sim clock     |
//! | `variables`  | VariablePort                   | automation variable table |

pub mod hardware;
pub mod log_sink;
pub mod nvs;
pub mod sd;
pub mod time;
pub mod variables;
