// Two-part angle: whole rotations plus millidegrees within the rotation
//
// Accumulated motor rotation is unbounded, so a single millidegree field would
// overflow after about 6000 turns. Splitting it keeps every field small.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use super::math::saturate;

/// Millidegrees in one full rotation
pub const MDEG_PER_ROTATION: i32 = 360_000;

/// Angle as `rotations * 360 deg + millidegrees`
///
/// `millidegrees` is always in `[0, 360000)`. Serialized as total millidegrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub struct Angle {
    rotations: i32,
    millidegrees: i32,
}

impl Angle {
    pub const ZERO: Angle = Angle {
        rotations: 0,
        millidegrees: 0,
    };

    /// Build from a (possibly large or negative) millidegree value
    ///
    /// The rotation count saturates beyond the i32 range.
    pub fn from_mdeg(mdeg: i64) -> Self {
        let rotation = MDEG_PER_ROTATION as i64;
        Angle {
            rotations: saturate(mdeg.div_euclid(rotation)),
            millidegrees: mdeg.rem_euclid(rotation) as i32,
        }
    }

    pub fn from_degrees(degrees: i32) -> Self {
        Self::from_mdeg(degrees as i64 * 1000)
    }

    pub fn rotations(&self) -> i32 {
        self.rotations
    }

    pub fn millidegrees(&self) -> i32 {
        self.millidegrees
    }

    /// Total angle in millidegrees
    pub fn to_mdeg(&self) -> i64 {
        self.rotations as i64 * MDEG_PER_ROTATION as i64 + self.millidegrees as i64
    }

    /// Total angle in whole degrees, truncated toward zero
    pub fn to_degrees(&self) -> i32 {
        saturate(self.to_mdeg() / 1000)
    }

    /// Add a signed millidegree delta, carrying into the rotation count
    pub fn add_mdeg(&mut self, delta: i32) {
        let sum = self.millidegrees as i64 + delta as i64;
        let rotation = MDEG_PER_ROTATION as i64;
        self.rotations = self.rotations.wrapping_add(sum.div_euclid(rotation) as i32);
        self.millidegrees = sum.rem_euclid(rotation) as i32;
    }

    /// This angle moved by a wide millidegree offset
    pub fn offset(self, delta: i64) -> Angle {
        let rotation = MDEG_PER_ROTATION as i64;
        let sum = self.millidegrees as i64 + delta.rem_euclid(rotation);
        Angle {
            rotations: self
                .rotations
                .wrapping_add(delta.div_euclid(rotation) as i32)
                .wrapping_add(sum.div_euclid(rotation) as i32),
            millidegrees: sum.rem_euclid(rotation) as i32,
        }
    }

    /// `self - other` in millidegrees along the accumulated path, saturated to i32
    pub fn diff_mdeg(&self, other: &Angle) -> i32 {
        saturate(*self - *other)
    }
}

impl Add<i32> for Angle {
    type Output = Angle;

    fn add(mut self, delta: i32) -> Angle {
        self.add_mdeg(delta);
        self
    }
}

impl AddAssign<i32> for Angle {
    fn add_assign(&mut self, delta: i32) {
        self.add_mdeg(delta);
    }
}

impl Sub for Angle {
    type Output = i64;

    fn sub(self, other: Angle) -> i64 {
        (self.rotations as i64 - other.rotations as i64) * MDEG_PER_ROTATION as i64
            + (self.millidegrees as i64 - other.millidegrees as i64)
    }
}

impl From<i64> for Angle {
    fn from(mdeg: i64) -> Self {
        Angle::from_mdeg(mdeg)
    }
}

impl From<Angle> for i64 {
    fn from(angle: Angle) -> i64 {
        angle.to_mdeg()
    }
}

impl fmt::Display for Angle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mdeg = self.to_mdeg();
        let sign = if mdeg < 0 { "-" } else { "" };
        write!(f, "{}{}.{:03} deg", sign, (mdeg / 1000).abs(), (mdeg % 1000).abs())
    }
}
