// Feedback control of one loop along a reference trajectory
//
// Used once per servo and twice per drivebase (distance and heading). The loop
// only produces a torque; the owner turns it into a voltage and applies it.

use serde::{Deserialize, Serialize};

use super::angle::Angle;
use super::math::{clamp, saturate};
use super::observer::{MAX_NUM_TORQUE, ObserverModel};
use super::trajectory::{Reference, Trajectory};
use crate::config::LOOP_TIME_MS;
use crate::error::{Error, Result};

/// Loop limits and gains
///
/// Angles in mdeg, speeds mdeg/s, torques uNm. `kp` is uNm per deg of
/// position error, `kd` uNm per deg/s of speed error, `ki` uNm per deg*s of
/// accumulated position error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSettings {
    pub speed_max: i32,
    pub acceleration: i32,
    pub position_tolerance: i32,
    pub speed_tolerance: i32,
    pub kp: i32,
    pub ki: i32,
    pub kd: i32,
    pub actuation_max: i32,
}

impl ControlSettings {
    pub fn validate(&self) -> Result<()> {
        if self.speed_max <= 0 {
            return Err(Error::InvalidArgument("maximum speed must be positive"));
        }
        if self.acceleration <= 0 {
            return Err(Error::InvalidArgument("acceleration must be positive"));
        }
        if self.position_tolerance < 0 || self.speed_tolerance < 0 {
            return Err(Error::InvalidArgument("tolerances must not be negative"));
        }
        if self.kp < 0 || self.ki < 0 || self.kd < 0 {
            return Err(Error::InvalidArgument("gains must not be negative"));
        }
        if self.actuation_max <= 0 || self.actuation_max > MAX_NUM_TORQUE {
            return Err(Error::InvalidArgument("actuation limit out of range"));
        }
        Ok(())
    }
}

/// What the motor does once a finite move completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stop {
    #[default]
    Coast,
    Brake,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// No trajectory; the owner decides the actuation
    #[default]
    Idle,
    /// Bounded move in progress
    Finite,
    /// Unbounded move in progress
    Continuous,
    /// Decelerating after a stop request
    Stopping,
    /// Keeping position at the end of a move
    Holding,
}

pub struct Control {
    settings: ControlSettings,
    mode: ControlMode,
    trajectory: Trajectory,
    after_stop: Stop,
    // Accumulated position error in mdeg*s
    integral: i64,
}

impl Control {
    pub fn new(settings: ControlSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            mode: ControlMode::Idle,
            trajectory: Trajectory::hold(0, Angle::ZERO),
            after_stop: Stop::Coast,
            integral: 0,
        })
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: ControlSettings) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.mode != ControlMode::Idle
    }

    /// Moving toward a target or along an unbounded profile
    pub fn is_busy(&self) -> bool {
        matches!(
            self.mode,
            ControlMode::Finite | ControlMode::Continuous | ControlMode::Stopping
        )
    }

    pub fn trajectory(&self) -> Option<&Trajectory> {
        self.is_active().then_some(&self.trajectory)
    }

    pub fn reference(&self, time: u32) -> Option<Reference> {
        self.is_active().then(|| self.trajectory.reference(time))
    }

    /// Where a new trajectory should start to stay continuous with this one
    ///
    /// While active that is the current reference; otherwise the measured state.
    pub fn start_point(&self, time: u32, angle: &Angle, speed: i32) -> (Angle, i32) {
        match self.reference(time) {
            Some(reference) => (reference.angle, reference.speed),
            None => (*angle, speed),
        }
    }

    /// Follow `trajectory`, then apply `after_stop` if it is bounded
    pub fn start_trajectory(&mut self, trajectory: Trajectory, after_stop: Stop) {
        if !self.is_active() {
            self.integral = 0;
        }
        self.mode = if trajectory.is_bounded() {
            ControlMode::Finite
        } else {
            ControlMode::Continuous
        };
        self.trajectory = trajectory;
        self.after_stop = after_stop;
    }

    /// Move to `target` with the configured limits, cruising at up to `speed`
    pub fn start_target(
        &mut self,
        time: u32,
        angle: &Angle,
        speed_now: i32,
        target: Angle,
        speed: i32,
        after_stop: Stop,
    ) -> Result<()> {
        let (start, start_speed) = self.start_point(time, angle, speed_now);
        let speed = clamp(speed, self.settings.speed_max);
        let trajectory = Trajectory::to_target(
            time,
            start,
            start_speed,
            target,
            speed,
            self.settings.acceleration,
        )?;
        self.start_trajectory(trajectory, after_stop);
        Ok(())
    }

    /// Ramp to `speed` and keep going
    pub fn start_forever(&mut self, time: u32, angle: &Angle, speed_now: i32, speed: i32) -> Result<()> {
        let (start, start_speed) = self.start_point(time, angle, speed_now);
        let speed = clamp(speed, self.settings.speed_max);
        let trajectory =
            Trajectory::forever(time, start, start_speed, speed, self.settings.acceleration)?;
        self.start_trajectory(trajectory, Stop::Coast);
        Ok(())
    }

    /// Hold position at `angle`
    pub fn start_hold(&mut self, time: u32, angle: Angle) {
        if !self.is_active() {
            self.integral = 0;
        }
        self.trajectory = Trajectory::hold(time, angle);
        self.after_stop = Stop::Hold;
        self.mode = ControlMode::Holding;
    }

    /// Decelerate to standstill, then apply `after_stop`
    pub fn decelerate(&mut self, time: u32, angle: &Angle, speed_now: i32, after_stop: Stop) -> Result<()> {
        let (start, start_speed) = self.start_point(time, angle, speed_now);
        self.trajectory = Trajectory::stop(time, start, start_speed, self.settings.acceleration)?;
        self.after_stop = after_stop;
        self.mode = ControlMode::Stopping;
        Ok(())
    }

    /// Drop the trajectory without a motion profile
    pub fn stop(&mut self) {
        self.mode = ControlMode::Idle;
        self.integral = 0;
    }

    /// Bounded trajectory elapsed and the loop settled near its end point
    pub fn on_target(&self, time: u32, angle: &Angle, speed: i32) -> bool {
        if !matches!(self.mode, ControlMode::Finite | ControlMode::Stopping) {
            return false;
        }
        if !self.trajectory.is_done(time) {
            return false;
        }
        let Some(end) = self.trajectory.end_angle() else {
            return false;
        };
        (end - *angle).abs() <= self.settings.position_tolerance as i64
            && speed.saturating_abs() <= self.settings.speed_tolerance
    }

    /// Finish the move if the loop is on target
    ///
    /// Returns the completion policy once, on the tick the move completes.
    /// Holding keeps the loop active at the end angle; the other policies make
    /// it idle and leave the actuation to the owner.
    pub fn complete(&mut self, time: u32, angle: &Angle, speed: i32) -> Option<Stop> {
        if !self.on_target(time, angle, speed) {
            return None;
        }
        let after_stop = self.after_stop;
        match after_stop {
            Stop::Hold => {
                let end = self.trajectory.end_angle().unwrap_or(*angle);
                self.start_hold(time, end);
            }
            Stop::Coast | Stop::Brake => self.stop(),
        }
        Some(after_stop)
    }

    /// Torque (uNm) for this tick, or `None` when idle
    ///
    /// `angle` is the measured loop angle, `speed` the estimated loop speed.
    pub fn update(&mut self, time: u32, angle: &Angle, speed: i32, model: &ObserverModel) -> Option<i32> {
        let reference = self.reference(time)?;
        let settings = &self.settings;

        let position_error = saturate(reference.angle - *angle);
        let speed_error = reference.speed.saturating_sub(speed);

        // Anti-windup: keep the integral term within the actuation limit
        if settings.ki > 0 {
            let limit = settings.actuation_max as i64 * 1000 / settings.ki as i64;
            self.integral = (self.integral + position_error as i64 * LOOP_TIME_MS as i64 / 1000)
                .clamp(-limit, limit);
        }

        let proportional = position_error as i64 * settings.kp as i64 / 1000;
        let integral = self.integral * settings.ki as i64 / 1000;
        let derivative = speed_error as i64 * settings.kd as i64 / 1000;
        let feedforward = model.feedforward_torque(reference.speed, reference.acceleration) as i64;

        Some(clamp(
            saturate(proportional + integral + derivative + feedforward),
            settings.actuation_max,
        ))
    }
}
