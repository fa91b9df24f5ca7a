// Scaled-integer arithmetic for the control core
//
// Every division here truncates toward zero. Products are widened to i64 (or
// i128 for rational scales) before dividing and saturated back to i32.

use std::fmt;
use std::ops::Mul;

use serde::{Deserialize, Serialize};

/// Clamp `value` to the symmetric range `[-limit, limit]`
pub fn clamp(value: i32, limit: i32) -> i32 {
    value.clamp(-limit, limit)
}

/// Sign of `value` as -1, 0 or 1
pub fn sign(value: i32) -> i32 {
    value.signum()
}

/// Saturate a wide intermediate back to i32
pub fn saturate(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Multiply by a gain expressed per 1000 units of `value`
///
/// Gains are given per degree while errors are in millidegrees.
pub fn mul_by_gain(value: i32, gain: i32) -> i32 {
    saturate(value as i64 * gain as i64 / 1000)
}

/// Signed 16.16 fixed-point number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Fix16(i32);

impl Fix16 {
    pub const ONE: Fix16 = Fix16(1 << 16);

    pub const fn from_raw(raw: i32) -> Self {
        Fix16(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whole-number value; saturates outside the 16.16 range
    pub const fn from_int(value: i32) -> Self {
        let wide = (value as i64) << 16;
        if wide > i32::MAX as i64 {
            Fix16(i32::MAX)
        } else if wide < i32::MIN as i64 {
            Fix16(i32::MIN)
        } else {
            Fix16(wide as i32)
        }
    }

    /// `num / den`, truncated to the nearest representable value toward zero
    pub fn from_ratio(num: i32, den: i32) -> Option<Self> {
        if den == 0 {
            return None;
        }
        Some(Fix16(saturate(((num as i64) << 16) / den as i64)))
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// `value * self`, truncated toward zero
    pub fn mul_int(self, value: i32) -> i32 {
        saturate(value as i64 * self.0 as i64 / 65536)
    }

    /// `value / self`, truncated toward zero; zero divisors yield zero
    pub fn div_int(self, value: i32) -> i32 {
        if self.0 == 0 {
            return 0;
        }
        saturate(((value as i64) << 16) / self.0 as i64)
    }
}

impl Mul for Fix16 {
    type Output = Fix16;

    fn mul(self, rhs: Fix16) -> Fix16 {
        Fix16(saturate(self.0 as i64 * rhs.0 as i64 / 65536))
    }
}

impl From<f64> for Fix16 {
    fn from(value: f64) -> Self {
        // `as` saturates on overflow and maps NaN to zero
        Fix16((value * 65536.0).round() as i32)
    }
}

impl From<Fix16> for f64 {
    fn from(value: Fix16) -> f64 {
        value.0 as f64 / 65536.0
    }
}

impl fmt::Display for Fix16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", f64::from(*self))
    }
}

/// Rational scale factor `num / den` applied with an i128 intermediate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    num: i64,
    den: i64,
}

impl Scale {
    /// Returns `None` unless both terms are positive
    pub fn new(num: i64, den: i64) -> Option<Self> {
        (num > 0 && den > 0).then_some(Scale { num, den })
    }

    pub fn apply(self, value: i64) -> i64 {
        let scaled = value as i128 * self.num as i128 / self.den as i128;
        scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Apply and saturate to i32
    pub fn apply_i32(self, value: i32) -> i32 {
        saturate(self.apply(value as i64))
    }

    pub fn inverse(self) -> Scale {
        Scale {
            num: self.den,
            den: self.num,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_and_sign() {
        assert_eq!(clamp(15000, 12000), 12000);
        assert_eq!(clamp(-15000, 12000), -12000);
        assert_eq!(clamp(42, 12000), 42);
        assert_eq!(sign(-7), -1);
        assert_eq!(sign(0), 0);
        assert_eq!(sign(3), 1);
    }

    #[test]
    fn test_mul_by_gain_truncates() {
        // 1999 mdeg at 1 mV/deg is 1.999 mV, truncated toward zero
        assert_eq!(mul_by_gain(1999, 1), 1);
        assert_eq!(mul_by_gain(-1999, 1), -1);
        assert_eq!(mul_by_gain(i32::MAX, 1_000_000), i32::MAX);
    }

    #[test]
    fn test_fix16_products() {
        let two = Fix16::from_int(2);
        let three = Fix16::from_int(3);
        assert_eq!(two * three, Fix16::from_int(6));
        assert_eq!((two * three).mul_int(100), 600);
        assert_eq!((two * three).div_int(600), 100);

        // 7 / 6 = 1.1666..., truncated
        assert_eq!(Fix16::from_int(6).div_int(7), 1);
        assert_eq!(Fix16::from_int(6).div_int(-7), -1);
        assert_eq!(Fix16::from_raw(0).div_int(7), 0);
    }

    #[test]
    fn test_fix16_from_float_boundary() {
        assert_eq!(Fix16::from(1.5), Fix16::from_raw(0x18000));
        assert_eq!(f64::from(Fix16::from_ratio(1, 4).unwrap()), 0.25);
        assert!(Fix16::from_ratio(1, 0).is_none());

        let parsed: Fix16 = serde_json::from_str("2.5").unwrap();
        assert_eq!(parsed, Fix16::from_raw(0x28000));
    }

    #[test]
    fn test_scale_round_trip_direction() {
        let scale = Scale::new(3, 2).unwrap();
        assert_eq!(scale.apply(10), 15);
        assert_eq!(scale.apply(-11), -16);
        assert_eq!(scale.inverse().apply(15), 10);
        assert!(Scale::new(0, 2).is_none());
        assert!(Scale::new(1, -2).is_none());
    }
}
