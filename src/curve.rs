// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve definitions and interpolation.
//!
//! A curve maps temperature readings to fan duty percentages (0-100).
//! Points are linearly interpolated between defined thresholds and clamped
//! to the first/last point outside the defined range.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest duty a curve point may request.
pub const MAX_DUTY_PERCENT: u8 = 100;

/// A single point on a fan curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CurvePoint {
    /// Temperature in degrees Celsius
    pub temp_c: f64,
    /// Fan duty in percent (0-100)
    pub duty: u8,
}

impl CurvePoint {
    pub fn new(temp_c: f64, duty: u8) -> Self {
        Self { temp_c, duty }
    }
}

/// An ordered, non-empty list of temperature-to-duty points.
///
/// The invariants (at least one point, strictly increasing temperatures,
/// duty within 0-100) are checked on construction and on deserialization, so
/// a `FanCurve` held anywhere in the crate is always valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CurvePoint>", into = "Vec<CurvePoint>")]
pub struct FanCurve {
    points: Vec<CurvePoint>,
}

impl FanCurve {
    /// Build a curve from points. Points are sorted by temperature first;
    /// duplicate temperatures are rejected rather than merged.
    pub fn new(mut points: Vec<CurvePoint>) -> Result<Self> {
        if points.iter().any(|p| !p.temp_c.is_finite()) {
            return Err(Error::InvalidCurve(
                "temperatures must be finite numbers".to_string(),
            ));
        }
        points.sort_by(|a, b| a.temp_c.total_cmp(&b.temp_c));
        let curve = Self { points };
        curve.validate()?;
        Ok(curve)
    }

    /// A one-point curve that yields `duty` at every temperature.
    pub fn constant(duty: u8) -> Result<Self> {
        Self::new(vec![CurvePoint::new(0.0, duty)])
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Interpolate the duty percentage for a given temperature.
    ///
    /// - Below the lowest point: returns the lowest point's duty
    /// - Above the highest point: returns the highest point's duty
    /// - Between two points: linear interpolation, rounded to the nearest percent
    ///
    /// # Panics
    ///
    /// Panics if the curve is empty, which construction rules out.
    pub fn interpolate(&self, temp_c: f64) -> u8 {
        let first = self
            .points
            .first()
            .expect("fan curve invariant violated: no points");
        if self.points.len() == 1 || temp_c <= first.temp_c {
            return first.duty;
        }

        let last = &self.points[self.points.len() - 1];
        if temp_c >= last.temp_c {
            return last.duty;
        }

        for window in self.points.windows(2) {
            let lo = &window[0];
            let hi = &window[1];

            if temp_c >= lo.temp_c && temp_c <= hi.temp_c {
                let frac = (temp_c - lo.temp_c) / (hi.temp_c - lo.temp_c);
                let duty_f = lo.duty as f64 + frac * (hi.duty as f64 - lo.duty as f64);
                return duty_f.round().clamp(0.0, MAX_DUTY_PERCENT as f64) as u8;
            }
        }

        // NaN temperatures fall through every comparison above.
        last.duty
    }

    /// Check point count, ordering and duty range.
    pub fn validate(&self) -> Result<()> {
        if self.points.is_empty() {
            return Err(Error::InvalidCurve(
                "curve must have at least 1 point".to_string(),
            ));
        }
        for (i, p) in self.points.iter().enumerate() {
            if p.duty > MAX_DUTY_PERCENT {
                return Err(Error::InvalidCurve(format!(
                    "duty {}% at point {i} exceeds {MAX_DUTY_PERCENT}%",
                    p.duty
                )));
            }
            if i > 0 && p.temp_c <= self.points[i - 1].temp_c {
                return Err(Error::InvalidCurve(format!(
                    "points must have strictly increasing temperatures (point {i})"
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<Vec<CurvePoint>> for FanCurve {
    type Error = Error;

    fn try_from(points: Vec<CurvePoint>) -> Result<Self> {
        FanCurve::new(points)
    }
}

impl From<FanCurve> for Vec<CurvePoint> {
    fn from(curve: FanCurve) -> Self {
        curve.points
    }
}

fn builtin(points: &[(f64, u8)]) -> FanCurve {
    FanCurve {
        points: points
            .iter()
            .map(|&(temp_c, duty)| CurvePoint { temp_c, duty })
            .collect(),
    }
}

/// The "Max" curve: a single point at full duty.
pub fn max_curve() -> FanCurve {
    builtin(&[(0.0, MAX_DUTY_PERCENT)])
}

/// The "Auto" curve: quiet at idle, full speed at 90C.
pub fn default_auto_curve() -> FanCurve {
    builtin(&[
        (40.0, 25),
        (55.0, 35),
        (65.0, 50),
        (75.0, 70),
        (90.0, 100),
    ])
}

/// Starting point for user-authored curves: lower floor, later ramp.
pub fn default_manual_curve() -> FanCurve {
    builtin(&[
        (45.0, 20),
        (60.0, 30),
        (70.0, 45),
        (80.0, 70),
        (90.0, 100),
    ])
}
