// Two servos driven as one differential drivebase
//
// The drivebase runs two control loops over the wheel angles: distance on
// their mean and heading on their half-difference. Each loop produces a
// torque; the left wheel gets distance + heading and the right wheel
// distance - heading. While any drivebase motion is active both servos are
// claimed and reject commands of their own.
//
// User units are mm for distance and degrees for heading. Loop units are
// wheel millidegrees; the conversion uses pi = 355/113.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::angle::Angle;
use super::control::{Control, ControlSettings, Stop};
use super::device::Actuation;
use super::math::{Fix16, Scale, clamp, saturate};
use super::observer::MAX_NUM_SPEED;
use super::registry::{MotorRegistry, Port};
use super::servo::Servo;
use super::trajectory::Trajectory;
use crate::error::{Error, Result};

/// Radius that makes `drive_curve` drive straight
pub const RADIUS_INF: i32 = i32::MAX;

const PI_NUM: i64 = 355;
const PI_DEN: i64 = 113;

/// Default speeds and accelerations
///
/// Drive values in mm/s and mm/s^2, turn values in deg/s and deg/s^2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveSettings {
    pub drive_speed: i32,
    pub drive_acceleration: i32,
    pub turn_rate: i32,
    pub turn_acceleration: i32,
}

impl DriveSettings {
    pub fn validate(&self) -> Result<()> {
        if self.drive_speed <= 0 || self.turn_rate <= 0 {
            return Err(Error::InvalidArgument("speeds must be positive"));
        }
        if self.drive_acceleration <= 0 || self.turn_acceleration <= 0 {
            return Err(Error::InvalidArgument("accelerations must be positive"));
        }
        Ok(())
    }
}

/// Measured drivebase state in user units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriveState {
    /// mm travelled since setup
    pub distance: i32,
    /// mm/s
    pub drive_speed: i32,
    /// degrees turned clockwise since setup
    pub angle: i32,
    /// deg/s
    pub turn_rate: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrivebaseState {
    #[default]
    Idle,
    FiniteMove,
    ContinuousMove,
    Stopping,
}

/// Loop angles and speeds in wheel mdeg
struct Loops {
    distance: Angle,
    distance_speed: i32,
    heading: Angle,
    heading_speed: i32,
}

impl Loops {
    fn measure(left: &Servo, right: &Servo) -> Self {
        let l = left.measured_angle().to_mdeg();
        let r = right.measured_angle().to_mdeg();
        let ls = left.estimated_state().speed as i64;
        let rs = right.estimated_state().speed as i64;
        Self {
            distance: Angle::from_mdeg((l + r) / 2),
            distance_speed: saturate((ls + rs) / 2),
            heading: Angle::from_mdeg((l - r) / 2),
            heading_speed: saturate((ls - rs) / 2),
        }
    }
}

/// One loop's share of a point-to-point move
#[derive(Clone, Copy)]
struct Leg {
    start: Angle,
    speed: i32,
    target: Angle,
    max_speed: i32,
    acceleration: i32,
}

impl Leg {
    fn length(&self) -> i64 {
        (self.target - self.start).abs()
    }

    fn plan(&self, time: u32) -> Result<Trajectory> {
        Trajectory::to_target(
            time,
            self.start,
            self.speed,
            self.target,
            self.max_speed.max(1),
            self.acceleration.max(1),
        )
    }
}

/// Plan both legs on one shared profile so they start and finish together
///
/// The common speed and acceleration are the tighter of the two loops' limits
/// relative to each leg's length.
fn synchronized(time: u32, mut distance: Leg, mut heading: Leg) -> Result<(Trajectory, Trajectory)> {
    if let Some(ratio) = Scale::new(heading.length(), distance.length()) {
        heading.max_speed = heading.max_speed.min(ratio.apply_i32(distance.max_speed));
        heading.acceleration = heading
            .acceleration
            .min(ratio.apply_i32(distance.acceleration));
        distance.max_speed = ratio.inverse().apply_i32(heading.max_speed);
        distance.acceleration = ratio.inverse().apply_i32(heading.acceleration);
    }
    Ok((distance.plan(time)?, heading.plan(time)?))
}

pub struct Drivebase {
    left: Port,
    right: Port,
    // mm to wheel mdeg
    distance_scale: Scale,
    // robot heading mdeg to wheel mdeg
    heading_scale: Scale,
    control_distance: Control,
    control_heading: Control,
    settings: DriveSettings,
    state: DrivebaseState,
    targets: Option<(i32, i32)>,
    origin: (Angle, Angle),
    claimed: bool,
    time: u32,
}

impl Drivebase {
    /// Bind the servos on `left` and `right` into a drivebase
    ///
    /// `wheel_diameter` and `axle_track` are in mm and must be positive. Loop
    /// gains and tolerances are taken from the left servo.
    pub fn setup(
        motors: &mut MotorRegistry,
        left: Port,
        right: Port,
        wheel_diameter: Fix16,
        axle_track: Fix16,
        settings: DriveSettings,
    ) -> Result<Self> {
        if !wheel_diameter.is_positive() {
            return Err(Error::InvalidArgument("wheel diameter must be positive"));
        }
        if !axle_track.is_positive() {
            return Err(Error::InvalidArgument("axle track must be positive"));
        }
        settings.validate()?;

        let (left_servo, right_servo) = motors.pair_mut(left, right)?;
        if left_servo.is_claimed() || right_servo.is_claimed() {
            return Err(Error::Busy);
        }

        let diameter = wheel_diameter.raw() as i64;
        let distance_scale = Scale::new(
            360_000 * 65_536 * PI_DEN,
            PI_NUM * diameter,
        )
        .ok_or(Error::InvalidArgument("wheel diameter must be positive"))?;
        let heading_scale = Scale::new(axle_track.raw() as i64, diameter)
            .ok_or(Error::InvalidArgument("axle track must be positive"))?;

        let base = *left_servo.control_settings();
        let (distance_settings, heading_settings) =
            loop_settings(&base, &settings, distance_scale, heading_scale);
        let control_distance = Control::new(distance_settings)?;
        let control_heading = Control::new(heading_settings)?;

        let loops = Loops::measure(left_servo, right_servo);
        let time = left_servo.time();

        info!(
            "Drivebase on ports {} and {}: wheel diameter {} mm, axle track {} mm",
            left, right, wheel_diameter, axle_track
        );
        Ok(Self {
            left,
            right,
            distance_scale,
            heading_scale,
            control_distance,
            control_heading,
            settings,
            state: DrivebaseState::Idle,
            targets: None,
            origin: (loops.distance, loops.heading),
            claimed: false,
            time,
        })
    }

    pub fn ports(&self) -> (Port, Port) {
        (self.left, self.right)
    }

    /// Drive along an arc of `radius` mm through `angle_or_distance` degrees,
    /// or straight for `angle_or_distance` mm if `radius` is [`RADIUS_INF`]
    ///
    /// Positive angles turn clockwise. A negative radius drives the arc in
    /// reverse. Returns at once; `is_busy` reports progress.
    pub fn drive_curve(
        &mut self,
        motors: &mut MotorRegistry,
        radius: i32,
        angle_or_distance: i32,
        drive_speed: i32,
        turn_rate: i32,
        after_stop: Stop,
    ) -> Result<()> {
        let (distance, heading) = if radius == RADIUS_INF {
            (angle_or_distance as i64, 0)
        } else {
            let angle = angle_or_distance as i64;
            (radius as i64 * angle * PI_NUM / (PI_DEN * 180), angle)
        };

        let time = self.time;
        let (left, right) = motors.pair_mut(self.left, self.right)?;
        let loops = Loops::measure(left, right);

        let (start, speed) =
            self.control_distance
                .start_point(time, &loops.distance, loops.distance_speed);
        let distance_leg = Leg {
            start,
            speed,
            target: start.offset(self.distance_scale.apply(distance)),
            max_speed: self.wheel_speed(drive_speed as i64),
            acceleration: self.control_distance.settings().acceleration,
        };
        let (start, speed) =
            self.control_heading
                .start_point(time, &loops.heading, loops.heading_speed);
        let heading_leg = Leg {
            start,
            speed,
            target: start.offset(self.heading_scale.apply(heading * 1000)),
            max_speed: self.turn_speed(turn_rate as i64),
            acceleration: self.control_heading.settings().acceleration,
        };
        if distance_leg.length() != 0 && drive_speed == 0 {
            return Err(Error::InvalidArgument("drive speed must be nonzero"));
        }
        if heading_leg.length() != 0 && turn_rate == 0 {
            return Err(Error::InvalidArgument("turn rate must be nonzero"));
        }

        let (distance_trajectory, heading_trajectory) =
            synchronized(time, distance_leg, heading_leg)?;

        claim_pair(left, right, true);
        self.claimed = true;
        self.control_distance
            .start_trajectory(distance_trajectory, after_stop);
        self.control_heading
            .start_trajectory(heading_trajectory, after_stop);
        self.state = DrivebaseState::FiniteMove;
        self.targets = Some((saturate(distance), saturate(heading)));

        debug!(
            "Drivebase curve: {} mm, {} deg, {:?} after",
            distance, heading, after_stop
        );
        Ok(())
    }

    /// Drive `speed` mm/s while turning at `turn_rate` deg/s until stopped
    pub fn drive_forever(
        &mut self,
        motors: &mut MotorRegistry,
        speed: i32,
        turn_rate: i32,
    ) -> Result<()> {
        let time = self.time;
        let (left, right) = motors.pair_mut(self.left, self.right)?;
        let loops = Loops::measure(left, right);

        let (start, start_speed) =
            self.control_distance
                .start_point(time, &loops.distance, loops.distance_speed);
        let distance_trajectory = Trajectory::forever(
            time,
            start,
            start_speed,
            clamp(saturate(self.distance_scale.apply(speed as i64)), MAX_NUM_SPEED),
            self.control_distance.settings().acceleration,
        )?;
        let (start, start_speed) =
            self.control_heading
                .start_point(time, &loops.heading, loops.heading_speed);
        let heading_trajectory = Trajectory::forever(
            time,
            start,
            start_speed,
            clamp(
                saturate(self.heading_scale.apply(turn_rate as i64 * 1000)),
                MAX_NUM_SPEED,
            ),
            self.control_heading.settings().acceleration,
        )?;

        claim_pair(left, right, true);
        self.claimed = true;
        self.control_distance
            .start_trajectory(distance_trajectory, Stop::Coast);
        self.control_heading
            .start_trajectory(heading_trajectory, Stop::Coast);
        self.state = DrivebaseState::ContinuousMove;
        self.targets = None;

        debug!("Drivebase forever: {} mm/s, {} deg/s", speed, turn_rate);
        Ok(())
    }

    /// Stop driving, then apply `after_stop`
    ///
    /// A moving drivebase decelerates with the configured accelerations
    /// first. An idle one applies the policy at once.
    pub fn stop(&mut self, motors: &mut MotorRegistry, after_stop: Stop) -> Result<()> {
        let time = self.time;
        let (left, right) = motors.pair_mut(self.left, self.right)?;
        let loops = Loops::measure(left, right);

        if self.is_busy() {
            self.control_distance.decelerate(
                time,
                &loops.distance,
                loops.distance_speed,
                after_stop,
            )?;
            self.control_heading
                .decelerate(time, &loops.heading, loops.heading_speed, after_stop)?;
            self.state = DrivebaseState::Stopping;
            debug!("Drivebase stopping, {:?} after", after_stop);
            return Ok(());
        }

        self.state = DrivebaseState::Idle;
        match after_stop {
            Stop::Hold => {
                claim_pair(left, right, true);
                self.claimed = true;
                self.control_distance.start_hold(time, loops.distance);
                self.control_heading.start_hold(time, loops.heading);
                Ok(())
            }
            Stop::Coast | Stop::Brake => {
                self.control_distance.stop();
                self.control_heading.stop();
                self.claimed = false;
                passive(left, right, after_stop)
            }
        }
    }

    /// Drop both trajectories, coast and release the servos
    pub fn stop_control(&mut self, motors: &mut MotorRegistry) {
        self.control_distance.stop();
        self.control_heading.stop();
        self.state = DrivebaseState::Idle;
        self.claimed = false;
        if let Ok((left, right)) = motors.pair_mut(self.left, self.right) {
            claim_pair(left, right, false);
            left.coast_quietly();
            right.coast_quietly();
        }
    }

    /// Take exclusive control of both servos, or give it back
    ///
    /// Releasing ends any drivebase motion; the servos keep their last
    /// actuation.
    pub fn claim_servos(&mut self, motors: &mut MotorRegistry, claim: bool) -> Result<()> {
        let (left, right) = motors.pair_mut(self.left, self.right)?;
        claim_pair(left, right, claim);
        self.claimed = claim;
        if !claim {
            self.control_distance.stop();
            self.control_heading.stop();
            self.state = DrivebaseState::Idle;
        }
        Ok(())
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    pub fn is_busy(&self) -> bool {
        self.control_distance.is_busy() || self.control_heading.is_busy()
    }

    pub fn state(&self) -> DrivebaseState {
        self.state
    }

    /// Requested distance (mm) and heading change (deg) of the last curve
    pub fn targets(&self) -> Option<(i32, i32)> {
        self.targets
    }

    pub fn distance_trajectory(&self) -> Option<&Trajectory> {
        self.control_distance.trajectory()
    }

    pub fn heading_trajectory(&self) -> Option<&Trajectory> {
        self.control_heading.trajectory()
    }

    /// Distance, drive speed, heading and turn rate since setup
    pub fn get_state_user(&self, motors: &MotorRegistry) -> Result<DriveState> {
        let left = motors.get(self.left)?;
        let right = motors.get(self.right)?;
        let loops = Loops::measure(left, right);
        let to_mm = self.distance_scale.inverse();
        let to_mdeg = self.heading_scale.inverse();
        Ok(DriveState {
            distance: saturate(to_mm.apply(loops.distance - self.origin.0)),
            drive_speed: saturate(to_mm.apply(loops.distance_speed as i64)),
            angle: saturate(to_mdeg.apply(loops.heading - self.origin.1) / 1000),
            turn_rate: saturate(to_mdeg.apply(loops.heading_speed as i64) / 1000),
        })
    }

    pub fn get_drive_settings(&self) -> DriveSettings {
        self.settings
    }

    /// Replace the default speeds and accelerations
    ///
    /// Nothing changes unless every value is valid.
    pub fn set_drive_settings(&mut self, settings: DriveSettings) -> Result<()> {
        settings.validate()?;
        let (distance, heading) = loop_settings(
            self.control_distance.settings(),
            &settings,
            self.distance_scale,
            self.heading_scale,
        );
        distance.validate()?;
        heading.validate()?;
        self.control_distance.set_settings(distance)?;
        self.control_heading.set_settings(heading)?;
        self.settings = settings;
        Ok(())
    }

    /// Advance both loops one tick; servos must already be updated for `time`
    pub fn update(&mut self, motors: &mut MotorRegistry, time: u32) -> Result<()> {
        self.time = time;
        if !self.control_distance.is_active() && !self.control_heading.is_active() {
            return Ok(());
        }
        let (left, right) = motors.pair_mut(self.left, self.right)?;
        let loops = Loops::measure(left, right);

        let finishing = matches!(
            self.state,
            DrivebaseState::FiniteMove | DrivebaseState::Stopping
        );
        if finishing
            && self
                .control_distance
                .on_target(time, &loops.distance, loops.distance_speed)
            && self
                .control_heading
                .on_target(time, &loops.heading, loops.heading_speed)
        {
            let after_stop = self
                .control_distance
                .complete(time, &loops.distance, loops.distance_speed);
            self.control_heading
                .complete(time, &loops.heading, loops.heading_speed);
            self.state = DrivebaseState::Idle;
            debug!("Drivebase move complete at {} ms", time);

            if let Some(after_stop @ (Stop::Coast | Stop::Brake)) = after_stop {
                self.claimed = false;
                return passive(left, right, after_stop);
            }
        }

        let model = *left.model();
        let distance_torque =
            self.control_distance
                .update(time, &loops.distance, loops.distance_speed, &model);
        let heading_torque =
            self.control_heading
                .update(time, &loops.heading, loops.heading_speed, &model);
        if distance_torque.is_none() && heading_torque.is_none() {
            return Ok(());
        }
        let distance_torque = distance_torque.unwrap_or(0);
        let heading_torque = heading_torque.unwrap_or(0);
        left.actuate_torque(distance_torque.saturating_add(heading_torque))?;
        right.actuate_torque(distance_torque.saturating_sub(heading_torque))?;
        Ok(())
    }

    /// Stop control, release and coast the servos
    pub fn release(&mut self, motors: &mut MotorRegistry) {
        self.stop_control(motors);
        info!("Drivebase on ports {} and {} released", self.left, self.right);
    }

    /// Wheel speed (mdeg/s) for a drive speed in mm/s
    fn wheel_speed(&self, speed: i64) -> i32 {
        clamp(saturate(self.distance_scale.apply(speed.abs())), MAX_NUM_SPEED)
    }

    /// Wheel speed (mdeg/s) for a turn rate in deg/s
    fn turn_speed(&self, rate: i64) -> i32 {
        clamp(
            saturate(self.heading_scale.apply(rate.abs() * 1000)),
            MAX_NUM_SPEED,
        )
    }
}

fn loop_settings(
    base: &ControlSettings,
    settings: &DriveSettings,
    distance_scale: Scale,
    heading_scale: Scale,
) -> (ControlSettings, ControlSettings) {
    let distance = ControlSettings {
        speed_max: saturate(distance_scale.apply(settings.drive_speed as i64)),
        acceleration: saturate(distance_scale.apply(settings.drive_acceleration as i64)),
        ..*base
    };
    let heading = ControlSettings {
        speed_max: saturate(heading_scale.apply(settings.turn_rate as i64 * 1000)),
        acceleration: saturate(heading_scale.apply(settings.turn_acceleration as i64 * 1000)),
        ..*base
    };
    (distance, heading)
}

fn claim_pair(left: &mut Servo, right: &mut Servo, claim: bool) {
    left.claim(claim);
    right.claim(claim);
}

/// Coast or brake both servos and hand them back
fn passive(left: &mut Servo, right: &mut Servo, after_stop: Stop) -> Result<()> {
    let actuation = match after_stop {
        Stop::Brake => Actuation::Brake,
        Stop::Coast | Stop::Hold => Actuation::Coast,
    };
    claim_pair(left, right, false);
    // Both wheels get the stop even if one of them fails
    let left_result = left.actuate(actuation);
    let right_result = right.actuate(actuation);
    left_result.and(right_result)
}
