// Tachometer: calibrated angle and rate on top of a raw encoder counter
//
// calibrated = (direction * raw - offset) / counts_per_output_unit
//
// Resets only move the offset. The hardware counter is never written, so the
// raw count stays monotonic for anyone else reading it.

use tracing::debug;

use super::angle::Angle;
use super::device::{Counter, Direction, Hardware};
use super::math::{Fix16, saturate};
use crate::error::{Error, Result};

pub struct Tacho {
    counter: Box<dyn Counter>,
    direction: Direction,
    counts_per_degree: Fix16,
    gear_ratio: Fix16,
    counts_per_output_unit: Fix16,
    offset: i32,
}

impl Tacho {
    /// Set up a tachometer on hardware counter `counter_id`
    ///
    /// Scale factors must be positive. If the counter knows its absolute
    /// position, the calibrated reading starts there; otherwise at zero.
    pub fn setup(
        hardware: &mut dyn Hardware,
        counter_id: u8,
        direction: Direction,
        counts_per_degree: Fix16,
        gear_ratio: Fix16,
    ) -> Result<Self> {
        validate_scale(counts_per_degree, gear_ratio)?;
        let counter = hardware.counter(counter_id)?;
        Self::with_counter(counter, direction, counts_per_degree, gear_ratio)
    }

    /// Set up a tachometer on an already opened counter
    pub fn with_counter(
        mut counter: Box<dyn Counter>,
        direction: Direction,
        counts_per_degree: Fix16,
        gear_ratio: Fix16,
    ) -> Result<Self> {
        let counts_per_output_unit = validate_scale(counts_per_degree, gear_ratio)?;

        let abs_count = match counter.abs_count() {
            Ok(count) => direction.apply(count),
            Err(Error::NotSupported) => 0,
            Err(e) => return Err(e),
        };

        let mut tacho = Self {
            counter,
            direction,
            counts_per_degree,
            gear_ratio,
            counts_per_output_unit,
            offset: 0,
        };
        tacho.reset_count(abs_count)?;

        debug!(
            "Tacho ready: {} counts/deg, gear ratio {}, starting at {} counts",
            counts_per_degree, gear_ratio, abs_count
        );
        Ok(tacho)
    }

    /// Raw count with direction applied but no offset
    fn raw_count(&mut self) -> Result<i32> {
        Ok(self.direction.apply(self.counter.count()?))
    }

    /// Calibrated count
    pub fn get_count(&mut self) -> Result<i32> {
        Ok(self.raw_count()?.wrapping_sub(self.offset))
    }

    /// Make the next `get_count` return `count`
    pub fn reset_count(&mut self, count: i32) -> Result<()> {
        let raw = self.raw_count()?;
        self.offset = raw.wrapping_sub(count);
        Ok(())
    }

    /// Output angle in whole degrees
    pub fn get_angle(&mut self) -> Result<i32> {
        let count = self.get_count()?;
        Ok(self.counts_per_output_unit.div_int(count))
    }

    /// Output angle with millidegree resolution
    pub fn get_angle_mdeg(&mut self) -> Result<Angle> {
        let count = self.get_count()? as i64;
        let mdeg = (count * 1000 * 65536) / self.counts_per_output_unit.raw() as i64;
        Ok(Angle::from_mdeg(mdeg))
    }

    /// Make the next `get_angle` return `angle` degrees
    pub fn reset_angle(&mut self, angle: i32) -> Result<()> {
        self.reset_count(self.counts_per_output_unit.mul_int(angle))
    }

    /// Make the next `get_angle_mdeg` return `angle`
    pub fn reset_angle_mdeg(&mut self, angle: &Angle) -> Result<()> {
        let counts = angle.to_mdeg() as i128 * self.counts_per_output_unit.raw() as i128
            / (1000 * 65536);
        self.reset_count(saturate(counts.clamp(i64::MIN as i128, i64::MAX as i128) as i64))
    }

    /// Counter rate in counts per second
    pub fn get_rate(&mut self) -> Result<i32> {
        Ok(self.direction.apply(self.counter.rate()?))
    }

    /// Output rate in degrees per second
    pub fn get_angular_rate(&mut self) -> Result<i32> {
        let rate = self.get_rate()?;
        Ok(self.counts_per_output_unit.div_int(rate))
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn counts_per_degree(&self) -> Fix16 {
        self.counts_per_degree
    }

    pub fn gear_ratio(&self) -> Fix16 {
        self.gear_ratio
    }
}

/// Checks both factors and returns their product
fn validate_scale(counts_per_degree: Fix16, gear_ratio: Fix16) -> Result<Fix16> {
    if !counts_per_degree.is_positive() {
        return Err(Error::InvalidArgument("counts per degree must be positive"));
    }
    if !gear_ratio.is_positive() {
        return Err(Error::InvalidArgument("gear ratio must be positive"));
    }
    let counts_per_output_unit = counts_per_degree * gear_ratio;
    if !counts_per_output_unit.is_positive() {
        return Err(Error::InvalidArgument("counts per output unit underflows"));
    }
    Ok(counts_per_output_unit)
}
