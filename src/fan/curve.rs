//! Temperature → duty curves.
//!
//! A curve is up to [`MAX_CURVE_POINTS`] `(temp, duty)` breakpoints sorted
//! by temperature. Evaluation is piecewise linear in integer arithmetic
//! and flat beyond either end.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_CURVE_POINTS: usize = 8;

/// One breakpoint: temperature in 0.1 °C, duty in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub temp: i16,
    pub duty: u8,
}

impl CurvePoint {
    pub const fn new(temp: i16, duty: u8) -> Self {
        Self { temp, duty }
    }
}

pub type Curve = heapless::Vec<CurvePoint, MAX_CURVE_POINTS>;

/// 30 °C → 20 %, 50 °C → 40 %, 70 °C → 80 %, 80 °C → 100 %.
pub const DEFAULT_POINTS: [CurvePoint; 4] = [
    CurvePoint::new(300, 20),
    CurvePoint::new(500, 40),
    CurvePoint::new(700, 80),
    CurvePoint::new(800, 100),
];

pub fn default_curve() -> Curve {
    DEFAULT_POINTS.iter().copied().collect()
}

/// Build a curve from unsorted points.
///
/// Rejects more than [`MAX_CURVE_POINTS`], duties above 100 and repeated
/// temperatures.
pub fn build(points: &[CurvePoint]) -> Result<Curve> {
    if points.len() > MAX_CURVE_POINTS {
        return Err(Error::InvalidArg("Too many curve points"));
    }
    if points.iter().any(|p| p.duty > 100) {
        return Err(Error::InvalidArg("Curve duty must be 0-100"));
    }
    let mut curve: Curve = points.iter().copied().collect();
    curve.sort_by_key(|p| p.temp);
    if curve.windows(2).any(|w| w[0].temp == w[1].temp) {
        return Err(Error::InvalidArg("Curve temperatures must be distinct"));
    }
    Ok(curve)
}

/// Raw curve value at `temp`. An empty curve yields `None`.
pub fn evaluate(curve: &[CurvePoint], temp: i16) -> Option<u8> {
    let first = curve.first()?;
    let last = curve.last()?;
    if temp <= first.temp {
        return Some(first.duty);
    }
    if temp >= last.temp {
        return Some(last.duty);
    }
    curve
        .windows(2)
        .find(|w| temp >= w[0].temp && temp < w[1].temp)
        .map(|w| {
            let (lo, hi) = (w[0], w[1]);
            let t_off = i32::from(temp) - i32::from(lo.temp);
            let t_range = i32::from(hi.temp) - i32::from(lo.temp);
            let d_range = i32::from(hi.duty) - i32::from(lo.duty);
            (i32::from(lo.duty) + t_off * d_range / t_range) as u8
        })
}

/// Clamp into `[min, max]`; a computed 0 stays 0.
pub fn clamp_duty(duty: u8, min: u8, max: u8) -> u8 {
    if duty == 0 {
        0
    } else {
        duty.max(min).min(max)
    }
}

/// Clamped duty for `temp`. An empty curve runs at `max`.
pub fn duty_for(curve: &[CurvePoint], temp: i16, min: u8, max: u8) -> u8 {
    clamp_duty(evaluate(curve, temp).unwrap_or(max), min, max)
}
