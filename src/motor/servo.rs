// Single-actuator controller
//
// One per attached motor. Every tick the servo reads its tachometer, advances
// the observer with the actuation applied during the previous tick, and, unless
// a drivebase has claimed it, runs its own control loop.

use tracing::{debug, info, warn};

use super::angle::Angle;
use super::control::{Control, ControlMode, ControlSettings, Stop};
use super::device::{Actuation, Actuator, Direction, Hardware};
use super::math::clamp;
use super::observer::{EstimatedState, MAX_NUM_VOLTAGE, Observer, ObserverModel};
use super::tacho::Tacho;
use crate::config::MotorConfig;
use crate::error::{Error, Result};

pub struct Servo {
    tacho: Tacho,
    actuator: Box<dyn Actuator>,
    observer: Observer,
    control: Control,
    // Last applied actuation, user frame
    actuation: Actuation,
    claimed: bool,
    time: u32,
    angle: Angle,
}

impl Servo {
    /// Set up a servo on hardware device `id`
    pub fn setup(hardware: &mut dyn Hardware, id: u8, config: &MotorConfig) -> Result<Self> {
        config.model.validate()?;
        let control = Control::new(config.control)?;
        let mut tacho = Tacho::setup(
            hardware,
            id,
            config.direction,
            config.counts_per_degree,
            config.gear_ratio,
        )?;
        let actuator = hardware.actuator(id)?;
        let angle = tacho.get_angle_mdeg()?;

        let mut servo = Self {
            tacho,
            actuator,
            observer: Observer::new(config.model, config.observer, &angle),
            control,
            actuation: Actuation::Coast,
            claimed: false,
            time: 0,
            angle,
        };
        servo.actuate(Actuation::Coast)?;

        info!("Servo on device {} ready at {}", id, angle);
        Ok(servo)
    }

    /// Advance one tick
    pub fn update(&mut self, time: u32) -> Result<()> {
        self.time = time;
        self.angle = self.tacho.get_angle_mdeg()?;
        self.observer.update(time, &self.angle, self.actuation);

        if self.claimed {
            return Ok(());
        }

        let speed = self.observer.get_estimated_state().speed;
        match self.control.complete(time, &self.angle, speed) {
            Some(Stop::Coast) => self.actuate(Actuation::Coast)?,
            Some(Stop::Brake) => self.actuate(Actuation::Brake)?,
            Some(Stop::Hold) | None => {}
        }

        let model = *self.observer.model();
        if let Some(torque) = self.control.update(time, &self.angle, speed, &model) {
            self.actuate_torque(torque)?;
        }
        Ok(())
    }

    fn check_unclaimed(&self) -> Result<()> {
        if self.claimed {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Run at `speed` (deg/s) until told otherwise
    pub fn run(&mut self, speed: i32) -> Result<()> {
        self.check_unclaimed()?;
        let estimate = self.observer.get_estimated_state();
        self.control
            .start_forever(self.time, &self.angle, estimate.speed, speed.saturating_mul(1000))?;
        debug!("Servo running at {} deg/s", speed);
        Ok(())
    }

    /// Move to `target` degrees at up to `speed` deg/s
    pub fn run_target(&mut self, speed: i32, target: i32, after_stop: Stop) -> Result<()> {
        self.check_unclaimed()?;
        self.start_target(speed, Angle::from_degrees(target), after_stop)
    }

    /// Move by `angle` degrees relative to where the motor is headed now
    ///
    /// A negative speed reverses the move.
    pub fn run_angle(&mut self, speed: i32, angle: i32, after_stop: Stop) -> Result<()> {
        self.check_unclaimed()?;
        let estimate = self.observer.get_estimated_state();
        let (start, _) = self.control.start_point(self.time, &self.angle, estimate.speed);
        let delta = angle as i64 * 1000 * if speed < 0 { -1 } else { 1 };
        self.start_target(speed, start.offset(delta), after_stop)
    }

    fn start_target(&mut self, speed: i32, target: Angle, after_stop: Stop) -> Result<()> {
        let estimate = self.observer.get_estimated_state();
        self.control.start_target(
            self.time,
            &self.angle,
            estimate.speed,
            target,
            speed.saturating_abs().saturating_mul(1000),
            after_stop,
        )?;
        debug!("Servo moving to {} ({:?} after)", target, after_stop);
        Ok(())
    }

    /// Stop the motor
    ///
    /// A moving servo decelerates along a profile first; an idle one applies
    /// `after_stop` right away.
    pub fn stop(&mut self, after_stop: Stop) -> Result<()> {
        self.check_unclaimed()?;
        if self.control.is_busy() {
            let speed = self.observer.get_estimated_state().speed;
            return self
                .control
                .decelerate(self.time, &self.angle, speed, after_stop);
        }
        self.apply_stop(after_stop)
    }

    /// Apply a stop policy immediately, without a profile
    pub(crate) fn apply_stop(&mut self, after_stop: Stop) -> Result<()> {
        match after_stop {
            Stop::Coast => {
                self.control.stop();
                self.actuate(Actuation::Coast)
            }
            Stop::Brake => {
                self.control.stop();
                self.actuate(Actuation::Brake)
            }
            Stop::Hold => {
                self.control.start_hold(self.time, self.angle);
                Ok(())
            }
        }
    }

    /// Apply a constant voltage (mV), ending any control
    pub fn set_voltage(&mut self, voltage: i32) -> Result<()> {
        self.check_unclaimed()?;
        self.control.stop();
        self.actuate(Actuation::Voltage(clamp(voltage, MAX_NUM_VOLTAGE)))
    }

    /// Redefine the current angle as `angle` degrees
    ///
    /// Any control in progress ends and the motor coasts, since its targets
    /// refer to the old zero point.
    pub fn reset_angle(&mut self, angle: i32) -> Result<()> {
        self.check_unclaimed()?;
        if self.control.is_active() {
            self.control.stop();
            self.actuate(Actuation::Coast)?;
        }
        self.tacho.reset_angle(angle)?;
        self.angle = self.tacho.get_angle_mdeg()?;
        self.observer.reset(&self.angle);
        Ok(())
    }

    /// Measured angle in degrees
    pub fn angle(&mut self) -> Result<i32> {
        self.tacho.get_angle()
    }

    /// Measured speed in deg/s
    pub fn speed(&mut self) -> Result<i32> {
        self.tacho.get_angular_rate()
    }

    pub fn is_busy(&self) -> bool {
        self.control.is_busy()
    }

    /// Stall duration in ms once the motor has been stalled long enough
    pub fn is_stalled(&self) -> Option<u32> {
        self.observer.is_stalled(self.time)
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    pub fn control_mode(&self) -> ControlMode {
        self.control.mode()
    }

    pub fn control_settings(&self) -> &ControlSettings {
        self.control.settings()
    }

    pub fn set_control_settings(&mut self, settings: ControlSettings) -> Result<()> {
        self.check_unclaimed()?;
        self.control.set_settings(settings)
    }

    pub fn estimated_state(&self) -> EstimatedState {
        self.observer.get_estimated_state()
    }

    pub fn model(&self) -> &ObserverModel {
        self.observer.model()
    }

    pub fn direction(&self) -> Direction {
        self.tacho.direction()
    }

    pub fn actuation(&self) -> Actuation {
        self.actuation
    }

    /// Angle measured on the last tick
    pub fn measured_angle(&self) -> Angle {
        self.angle
    }

    /// Time of the last tick in ms
    pub fn time(&self) -> u32 {
        self.time
    }

    /// Hand control to (or take it back from) a drivebase
    pub(crate) fn claim(&mut self, claim: bool) {
        if claim && !self.claimed {
            self.control.stop();
        }
        self.claimed = claim;
    }

    pub(crate) fn actuate_torque(&mut self, torque: i32) -> Result<()> {
        let voltage = self.observer.model().torque_to_voltage(torque);
        self.actuate(Actuation::Voltage(clamp(voltage, MAX_NUM_VOLTAGE)))
    }

    pub(crate) fn actuate(&mut self, actuation: Actuation) -> Result<()> {
        let direction = self.tacho.direction();
        self.actuator.actuate(actuation.oriented(direction))?;
        self.actuation = actuation;
        Ok(())
    }

    /// Coast, logging instead of failing
    pub(crate) fn coast_quietly(&mut self) {
        if let Err(e) = self.actuate(Actuation::Coast) {
            warn!("Failed to coast servo: {}", e);
        }
    }
}
