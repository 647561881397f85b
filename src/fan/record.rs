//! Persisted per-fan record (NVS `fan_config` / `fan{i}`).
//!
//! Encoded with postcard. The version is the first field so a stale
//! layout can be detected before the rest is decoded.

use serde::{Deserialize, Serialize};

use super::FanMode;
use super::curve::Curve;
use crate::app::ports::ConfigError;

pub const RECORD_VERSION: u32 = 2;
pub const NVS_NAMESPACE: &str = "fan_config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanRecord {
    pub version: u32,
    pub mode: FanMode,
    pub duty: u8,
    pub enabled: bool,
    pub curve: Curve,
    /// 0.1 °C.
    pub hysteresis: i16,
    pub min_interval_ms: u32,
    pub min_duty: u8,
    pub max_duty: u8,
    pub invert_pwm: bool,
}

pub fn key(id: usize) -> String {
    format!("fan{}", id)
}

impl FanRecord {
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Corrupted)
    }

    /// Decode a stored blob. A different version is reported before the
    /// body is parsed.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        let (version, _) =
            postcard::take_from_bytes::<u32>(bytes).map_err(|_| ConfigError::Corrupted)?;
        if version != RECORD_VERSION {
            return Err(ConfigError::ValidationFailed("fan record version mismatch"));
        }
        let rec: Self = postcard::from_bytes(bytes).map_err(|_| ConfigError::Corrupted)?;
        rec.validate()?;
        Ok(rec)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.duty > 100 || self.max_duty > 100 || self.min_duty > self.max_duty {
            return Err(ConfigError::ValidationFailed("fan duty limits out of range"));
        }
        if self.curve.windows(2).any(|w| w[0].temp >= w[1].temp) {
            return Err(ConfigError::ValidationFailed("fan curve not sorted"));
        }
        Ok(())
    }
}
