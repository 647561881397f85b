//! In-memory automation variable registry.
//!
//! Backs [`VariablePort`]: the temperature manager reads the bound
//! scalar from here and the power policy exports its state into it
//! (`power_policy.state`, `power_policy.voltage`, ...).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::app::ports::VariablePort;

#[derive(Default)]
pub struct VariableRegistry {
    values: RwLock<HashMap<String, f64>>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: f64) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), value);
    }

    pub fn remove(&self, name: &str) -> Option<f64> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VariablePort for VariableRegistry {
    fn get_float(&self, name: &str) -> Option<f64> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .filter(|v| v.is_finite())
    }

    fn publish(&self, name: &str, value: f64) {
        self.set(name, value);
    }
}
