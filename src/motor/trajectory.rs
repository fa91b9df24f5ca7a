// Trapezoidal reference trajectories in scaled integers
//
// Time is in ms relative to the trajectory start. Positions are millidegree
// offsets from the start angle, speeds mdeg/s, accelerations mdeg/s^2.
// Profiles are computed in a forward frame and mirrored for negative moves.
// Squared speeds and products with the distance are evaluated in i128.

use super::angle::Angle;
use super::math::saturate;
use crate::error::{Error, Result};

/// Reference state at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub angle: Angle,
    pub speed: i32,
    pub acceleration: i32,
}

/// Point-to-point or continuous motion profile
///
/// Phases: change speed from `w0` to `wc` until `t1`, cruise at `wc` until
/// `t2`, then decelerate to rest at `t3`. Unbounded profiles cruise forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trajectory {
    start_time: u32,
    start_angle: Angle,
    forward: bool,
    bounded: bool,
    w0: i64,
    wc: i64,
    a1: i64,
    a3: i64,
    t1: i64,
    t2: i64,
    t3: i64,
    th1: i64,
    th2: i64,
    th3: i64,
}

fn isqrt(value: i128) -> i64 {
    if value <= 0 {
        return 0;
    }
    (value as u128).isqrt().min(i64::MAX as u128) as i64
}

impl Trajectory {
    /// Stand still at `angle`; done immediately
    pub fn hold(time: u32, angle: Angle) -> Self {
        Self {
            start_time: time,
            start_angle: angle,
            forward: true,
            bounded: true,
            w0: 0,
            wc: 0,
            a1: 0,
            a3: 0,
            t1: 0,
            t2: 0,
            t3: 0,
            th1: 0,
            th2: 0,
            th3: 0,
        }
    }

    /// Ramp from `speed` to `target_speed` and keep going
    pub fn forever(
        time: u32,
        angle: Angle,
        speed: i32,
        target_speed: i32,
        acceleration: i32,
    ) -> Result<Self> {
        if acceleration <= 0 {
            return Err(Error::InvalidArgument("acceleration must be positive"));
        }
        let forward = target_speed >= 0;
        let sign = if forward { 1 } else { -1 };
        let w0 = speed as i64 * sign;
        let wc = target_speed as i64 * sign;
        let a = acceleration as i64;

        let a1 = if wc >= w0 { a } else { -a };
        let t1 = (wc - w0) * 1000 / a1;
        let th1 = (w0 + wc) * t1 / 2000;

        Ok(Self {
            start_time: time,
            start_angle: angle,
            forward,
            bounded: false,
            w0,
            wc,
            a1,
            a3: a,
            t1,
            t2: t1,
            t3: t1,
            th1,
            th2: th1,
            th3: th1,
        })
    }

    /// Move from `angle` (currently at `speed`) to `target`, cruising at up to
    /// `max_speed` with `acceleration` for both ramps
    pub fn to_target(
        time: u32,
        angle: Angle,
        speed: i32,
        target: Angle,
        max_speed: i32,
        acceleration: i32,
    ) -> Result<Self> {
        if max_speed == 0 {
            return Err(Error::InvalidArgument("speed must be nonzero"));
        }
        if acceleration <= 0 {
            return Err(Error::InvalidArgument("acceleration must be positive"));
        }
        let distance = target - angle;
        let forward = distance >= 0;
        let sign = if forward { 1 } else { -1 };
        let d = distance.abs();
        let vmax = (max_speed as i64).abs();
        let a = acceleration as i64;

        // Start no faster than the cruise limit, and slow enough to stop in time
        let mut w0 = (speed as i64 * sign).clamp(-vmax, vmax);
        let stop_limit = isqrt(2 * a as i128 * d as i128);
        if w0 > stop_limit {
            w0 = stop_limit;
        }

        // Cruise at vmax if both ramps fit, otherwise peak where they meet
        let ramps = 2 * (vmax as i128).pow(2) - (w0 as i128).pow(2);
        let wc = if ramps <= 2 * a as i128 * d as i128 {
            vmax
        } else {
            isqrt((2 * a as i128 * d as i128 + (w0 as i128).pow(2)) / 2).max(w0)
        };

        let t1 = (wc - w0) * 1000 / a;
        let th1 = (w0 + wc) * t1 / 2000;
        let t_decel = wc * 1000 / a;
        let d_decel = wc * t_decel / 2000;
        let cruise = (d - th1 - d_decel).max(0);
        let t2 = t1 + if wc > 0 { cruise * 1000 / wc } else { 0 };

        Ok(Self {
            start_time: time,
            start_angle: angle,
            forward,
            bounded: true,
            w0,
            wc,
            a1: a,
            a3: a,
            t1,
            t2,
            t3: t2 + t_decel,
            th1,
            th2: th1 + cruise,
            th3: d,
        })
    }

    /// Decelerate from `speed` to rest with `deceleration`
    pub fn stop(time: u32, angle: Angle, speed: i32, deceleration: i32) -> Result<Self> {
        if deceleration <= 0 {
            return Err(Error::InvalidArgument("deceleration must be positive"));
        }
        if speed == 0 {
            return Ok(Self::hold(time, angle));
        }
        let w = speed as i64;
        let distance = w * w.abs() / (2 * deceleration as i64);
        Self::to_target(
            time,
            angle,
            speed,
            angle.offset(distance),
            speed.saturating_abs(),
            deceleration,
        )
    }

    fn elapsed(&self, time: u32) -> i64 {
        time.wrapping_sub(self.start_time) as i64
    }

    fn orient(&self, value: i64) -> i64 {
        if self.forward { value } else { -value }
    }

    /// Reference angle, speed and acceleration at `time`
    pub fn reference(&self, time: u32) -> Reference {
        let t = self.elapsed(time);
        let (th, w, acc) = if self.bounded && t >= self.t3 {
            (self.th3, 0, 0)
        } else if t < self.t1 {
            (
                self.w0 * t / 1000 + self.a1 * t * t / 2_000_000,
                self.w0 + self.a1 * t / 1000,
                self.a1,
            )
        } else if !self.bounded || t < self.t2 {
            (self.th1 + self.wc * (t - self.t1) / 1000, self.wc, 0)
        } else {
            let remaining = self.t3 - t;
            (
                self.th3 - self.a3 * remaining * remaining / 2_000_000,
                self.a3 * remaining / 1000,
                -self.a3,
            )
        };

        Reference {
            angle: self.start_angle.offset(self.orient(th)),
            speed: saturate(self.orient(w)),
            acceleration: saturate(self.orient(acc)),
        }
    }

    /// Whether a bounded profile has reached its end point
    pub fn is_done(&self, time: u32) -> bool {
        self.bounded && self.elapsed(time) >= self.t3
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded
    }

    pub fn start_angle(&self) -> Angle {
        self.start_angle
    }

    /// Final angle of a bounded profile
    pub fn end_angle(&self) -> Option<Angle> {
        self.bounded
            .then(|| self.start_angle.offset(self.orient(self.th3)))
    }

    /// Duration of a bounded profile in ms
    pub fn duration(&self) -> Option<u32> {
        self.bounded.then_some(self.t3.clamp(0, u32::MAX as i64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_is_done_immediately() {
        let traj = Trajectory::hold(100, Angle::from_degrees(45));
        assert!(traj.is_done(100));
        let reference = traj.reference(5000);
        assert_eq!(reference.angle, Angle::from_degrees(45));
        assert_eq!(reference.speed, 0);
    }

    #[test]
    fn test_trapezoid_reaches_target() {
        // 360 deg at up to 500 deg/s with 1000 deg/s^2: 0.5 s ramps, 0.22 s cruise
        let start = Angle::from_degrees(10);
        let target = Angle::from_degrees(370);
        let traj = Trajectory::to_target(0, start, 0, target, 500_000, 1_000_000).unwrap();

        assert_eq!(traj.end_angle(), Some(target));
        assert_eq!(traj.duration(), Some(1220));
        assert!(!traj.is_done(1219));
        assert!(traj.is_done(1220));

        assert_eq!(traj.reference(0).angle, start);
        assert_eq!(traj.reference(250).speed, 250_000);
        assert_eq!(traj.reference(600).speed, 500_000);
        assert_eq!(traj.reference(600).acceleration, 0);
        assert_eq!(traj.reference(2000).angle, target);
        assert_eq!(traj.reference(2000).speed, 0);
    }

    #[test]
    fn test_short_move_peaks_below_max_speed() {
        let traj =
            Trajectory::to_target(0, Angle::ZERO, 0, Angle::from_degrees(10), 1_000_000, 1_000_000)
                .unwrap();
        let peak = (0..=traj.duration().unwrap())
            .map(|t| traj.reference(t).speed)
            .max()
            .unwrap();
        // sqrt(a * d) = 100 deg/s
        assert!(peak <= 100_000);
        assert!(peak >= 99_000);
    }

    #[test]
    fn test_negative_move_is_mirrored() {
        let traj = Trajectory::to_target(
            0,
            Angle::ZERO,
            0,
            Angle::from_degrees(-360),
            -500_000,
            1_000_000,
        )
        .unwrap();
        assert_eq!(traj.reference(250).speed, -250_000);
        assert_eq!(traj.reference(250).acceleration, -1_000_000);
        assert_eq!(traj.reference(5000).angle, Angle::from_degrees(-360));
    }

    #[test]
    fn test_reference_is_monotonic_and_continuous() {
        let traj =
            Trajectory::to_target(0, Angle::ZERO, 0, Angle::from_degrees(720), 800_000, 2_000_000)
                .unwrap();
        let mut previous = traj.reference(0);
        for t in 1..=traj.duration().unwrap() + 10 {
            let reference = traj.reference(t);
            let step = reference.angle - previous.angle;
            assert!(step >= 0, "moved backward at {} ms", t);
            // 800 deg/s covers at most 800 mdeg per ms, plus rounding at phase edges
            assert!(step <= 1_000, "jumped {} mdeg at {} ms", step, t);
            previous = reference;
        }
    }

    #[test]
    fn test_forever_ramps_then_cruises() {
        let traj = Trajectory::forever(1000, Angle::ZERO, 0, -200_000, 400_000).unwrap();
        assert!(!traj.is_done(u32::MAX));
        assert_eq!(traj.end_angle(), None);
        assert_eq!(traj.reference(1250).speed, -100_000);
        assert_eq!(traj.reference(1500).speed, -200_000);
        // 50 deg during the ramp, then 200 deg/s for a second
        assert_eq!(traj.reference(2500).angle, Angle::from_degrees(-250));
    }

    #[test]
    fn test_stop_decelerates_from_speed() {
        let traj = Trajectory::stop(0, Angle::ZERO, 300_000, 600_000).unwrap();
        // v^2 / 2a = 75 deg in 0.5 s
        assert_eq!(traj.end_angle(), Some(Angle::from_degrees(75)));
        assert_eq!(traj.duration(), Some(500));
        assert_eq!(traj.reference(0).speed, 300_000);
        assert!(Trajectory::stop(0, Angle::ZERO, 0, 600_000).unwrap().is_done(0));
    }

    #[test]
    fn test_invalid_profiles_rejected() {
        assert!(Trajectory::to_target(0, Angle::ZERO, 0, Angle::ZERO, 0, 1).is_err());
        assert!(Trajectory::to_target(0, Angle::ZERO, 0, Angle::ZERO, 1, 0).is_err());
        assert!(Trajectory::forever(0, Angle::ZERO, 0, 1, -5).is_err());
        assert!(Trajectory::stop(0, Angle::ZERO, 10, 0).is_err());
    }
}
