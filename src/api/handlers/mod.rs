//! Endpoint handlers.
//!
//! Thin adapters between JSON parameters and the control-plane
//! components. Each submodule returns its endpoint table; the composition
//! root registers them all through [`register_all`].

pub mod device;
pub mod fan;
pub mod power;
pub mod system;
pub mod temp;

use std::sync::Arc;

use crate::device::DevicePower;
use crate::error::Result;
use crate::fan::FanController;
use crate::power::PowerPolicy;
use crate::temp::TempManager;

use super::Registry;

/// Components reachable from the API.
#[derive(Clone)]
pub struct Services {
    pub temp: Arc<TempManager>,
    pub fans: Arc<FanController>,
    pub devices: Arc<DevicePower>,
    pub policy: Arc<PowerPolicy>,
}

pub fn register_all(registry: &mut Registry, svc: &Services) -> Result<()> {
    registry.register_multiple(device::endpoints(svc))?;
    registry.register_multiple(fan::endpoints(svc))?;
    registry.register_multiple(temp::endpoints(svc))?;
    registry.register_multiple(power::endpoints(svc))?;
    registry.register_multiple(system::endpoints(registry.catalog()))?;
    registry.log_summary();
    Ok(())
}

/// Tenths of a degree as °C for JSON output.
pub(crate) fn celsius(tenths: i16) -> f64 {
    f64::from(tenths) / 10.0
}
