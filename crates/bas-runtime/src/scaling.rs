//! Linear scaling between device-native values and engineering units.

use bas_common::config::AnalogRange;
use serde::Serialize;

/// Result of an analog read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalogReading {
    /// Value in engineering units, clamped to `[min, max]`.
    pub value: f64,
    /// Lower end of the engineering window.
    pub min: f64,
    /// Upper end of the engineering window.
    pub max: f64,
}

impl AnalogReading {
    /// Reading of `value` within the window of `range`.
    #[must_use]
    pub fn new(value: f64, range: &AnalogRange) -> Self {
        Self {
            value,
            min: range.min,
            max: range.max,
        }
    }
}

fn clamp_between(value: f64, a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if value.is_nan() {
        return lo;
    }
    value.clamp(lo, hi)
}

fn map(value: f64, from: (f64, f64), to: (f64, f64)) -> f64 {
    let span = from.1 - from.0;
    if span.abs() < f64::EPSILON {
        return to.0;
    }
    let scaled = to.0 + (value - from.0) * (to.1 - to.0) / span;
    clamp_between(scaled, to.0, to.1)
}

/// Device-native value to engineering units.
#[must_use]
pub fn to_engineering(raw: f64, range: &AnalogRange) -> f64 {
    map(
        raw,
        (range.native_min, range.native_max),
        (range.min, range.max),
    )
}

/// Engineering value to device-native units.
#[must_use]
pub fn to_native(value: f64, range: &AnalogRange) -> f64 {
    map(
        value,
        (range.min, range.max),
        (range.native_min, range.native_max),
    )
}

/// Native value rounded into a 16-bit register.
#[must_use]
pub fn to_register(native: f64) -> u16 {
    if native.is_nan() {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let word = native.round().clamp(0.0, f64::from(u16::MAX)) as u16;
    word
}
