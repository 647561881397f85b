//! Application layer: the port traits every adapter implements, the
//! periodic task runner and the [`ControlPlane`](service::ControlPlane)
//! composition root.
//!
//! Subsystems only see hardware through [`ports`], so the whole control
//! plane runs on the host against simulated adapters.

pub mod ports;
pub mod service;
pub mod task;

pub use service::{ControlPlane, Ports};
