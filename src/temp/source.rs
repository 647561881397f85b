//! Temperature source kinds and the provider table entry.

use crate::config::PreferredSource;

/// Lowest accepted reading (0.1 °C).
pub const MIN_VALID: i16 = -400;
/// Highest accepted reading (0.1 °C).
pub const MAX_VALID: i16 = 1500;
/// Sentinel reported when no source is available (25.0 °C).
pub const DEFAULT_TEMP: i16 = 250;
/// Age after which a provider's reading is stale.
pub const DATA_TIMEOUT_MS: u64 = 10_000;

pub const SOURCE_COUNT: usize = 5;

/// Closed set of temperature sources. The discriminant indexes the
/// provider table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Default,
    SensorLocal,
    AgxAuto,
    Variable,
    Manual,
}

impl SourceKind {
    pub const ALL: [SourceKind; SOURCE_COUNT] = [
        Self::Default,
        Self::SensorLocal,
        Self::AgxAuto,
        Self::Variable,
        Self::Manual,
    ];

    /// Walk order used when no preferred source is valid.
    pub const PRIORITY: [SourceKind; 3] = [Self::Variable, Self::AgxAuto, Self::SensorLocal];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Wire name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::SensorLocal => "sensor",
            Self::AgxAuto => "agx",
            Self::Variable => "variable",
            Self::Manual => "manual",
        }
    }

    /// Parse a wire name, accepting the long and persisted aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" | "auto" => Some(Self::Default),
            "sensor" | "local" | "sensor_local" => Some(Self::SensorLocal),
            "agx" | "agx_auto" => Some(Self::AgxAuto),
            "variable" => Some(Self::Variable),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Preferred source as persisted. `Default` persists as `auto`.
    pub const fn to_preferred(self) -> PreferredSource {
        match self {
            Self::Default => PreferredSource::Auto,
            Self::SensorLocal => PreferredSource::Local,
            Self::AgxAuto => PreferredSource::Agx,
            Self::Variable => PreferredSource::Variable,
            Self::Manual => PreferredSource::Manual,
        }
    }

    /// Persisted `manual` loads as auto; manual mode is never restored
    /// from storage.
    pub const fn from_preferred(p: PreferredSource) -> Self {
        match p {
            PreferredSource::Auto | PreferredSource::Manual => Self::Default,
            PreferredSource::Local => Self::SensorLocal,
            PreferredSource::Agx => Self::AgxAuto,
            PreferredSource::Variable => Self::Variable,
        }
    }
}

/// `true` when `t` lies in `[MIN_VALID, MAX_VALID]`.
pub const fn in_window(t: i16) -> bool {
    t >= MIN_VALID && t <= MAX_VALID
}

/// Convert °C to tenths, rejecting non-finite and out-of-window values.
pub fn tenths_from_celsius(celsius: f64) -> Option<i16> {
    if !celsius.is_finite() {
        return None;
    }
    let tenths = (celsius * 10.0).round();
    if tenths < f64::from(MIN_VALID) || tenths > f64::from(MAX_VALID) {
        return None;
    }
    Some(tenths as i16)
}

/// One slot of the provider table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub kind: SourceKind,
    pub name: String,
    pub value: i16,
    pub last_update_ms: u64,
    pub update_count: u32,
    pub registered: bool,
    pub active: bool,
}

impl Provider {
    pub(crate) fn vacant(kind: SourceKind) -> Self {
        Self {
            kind,
            name: kind.name().to_owned(),
            value: DEFAULT_TEMP,
            last_update_ms: 0,
            update_count: 0,
            registered: false,
            active: false,
        }
    }

    /// The always-present fallback slot.
    pub(crate) fn default_slot() -> Self {
        Self {
            registered: true,
            active: true,
            ..Self::vacant(SourceKind::Default)
        }
    }

    /// (Re)register: clears the reading and statistics.
    pub(crate) fn reset(&mut self, name: Option<&str>) {
        *self = Self {
            name: name.unwrap_or(self.kind.name()).to_owned(),
            registered: true,
            ..Self::vacant(self.kind)
        };
    }

    pub(crate) fn record(&mut self, value: i16, now_ms: u64) {
        self.value = value;
        self.last_update_ms = now_ms;
        self.update_count = self.update_count.wrapping_add(1);
        self.active = true;
    }

    /// Registered, active and younger than [`DATA_TIMEOUT_MS`]. The
    /// default slot never goes stale.
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        if !self.registered || !self.active {
            return false;
        }
        self.kind == SourceKind::Default
            || now_ms.saturating_sub(self.last_update_ms) < DATA_TIMEOUT_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_with_aliases() {
        for kind in SourceKind::ALL {
            assert_eq!(SourceKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(SourceKind::parse("local"), Some(SourceKind::SensorLocal));
        assert_eq!(SourceKind::parse("agx_auto"), Some(SourceKind::AgxAuto));
        assert_eq!(SourceKind::parse("bogus"), None);
    }

    #[test]
    fn persisted_manual_loads_as_auto() {
        assert_eq!(SourceKind::from_preferred(PreferredSource::Manual), SourceKind::Default);
        assert_eq!(SourceKind::Default.to_preferred(), PreferredSource::Auto);
    }

    #[test]
    fn celsius_conversion_respects_window() {
        assert_eq!(tenths_from_celsius(45.0), Some(450));
        assert_eq!(tenths_from_celsius(-40.0), Some(-400));
        assert_eq!(tenths_from_celsius(150.1), None);
        assert_eq!(tenths_from_celsius(f64::NAN), None);
    }

    #[test]
    fn provider_goes_stale() {
        let mut p = Provider::vacant(SourceKind::AgxAuto);
        p.reset(None);
        assert!(!p.is_fresh(0), "registered but never updated");
        p.record(420, 1_000);
        assert!(p.is_fresh(10_999));
        assert!(!p.is_fresh(11_000));
    }

    #[test]
    fn default_slot_is_always_fresh() {
        assert!(Provider::default_slot().is_fresh(u64::MAX));
    }
}
