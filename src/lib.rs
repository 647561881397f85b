//! RackCtl supervisory controller firmware library.
//!
//! Exposes the control plane (temperature fusion, fan control, power
//! policy, device power, API dispatch) for integration testing and for
//! the firmware binary. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod adapters;
pub mod api;
pub mod app;
pub mod config;
pub mod device;
pub mod drivers;
pub mod error;
pub mod events;
pub mod fan;
pub mod fsm;
pub mod pins;
pub mod power;
pub mod store;
pub mod temp;

pub use error::{Error, Result};
