// Model-based motor state observer
//
// Predicts angle, speed and current from the applied voltage with a discrete
// linear model, x(k+1) = A x(k) + B u(k), and pulls the prediction toward the
// measured angle with a proportional feedback voltage. A persistent negative
// feedback under load is reported as a stall.
//
// All arithmetic is scaled integer. Each model coefficient is stored as a
// divisor: the term is `PRESCALE * value / divisor`, where PRESCALE * MAX of
// the value fits an i32 and the product is evaluated in i64.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::angle::Angle;
use super::device::Actuation;
use super::math::{clamp, mul_by_gain, saturate, sign};
use crate::config::LOOP_TIME_MS;
use crate::error::{Error, Result};

/// Physical maxima of the model quantities
pub const MAX_NUM_SPEED: i32 = 2_500_000; // mdeg/s
pub const MAX_NUM_ACCELERATION: i32 = 2_500_000; // mdeg/s^2
pub const MAX_NUM_CURRENT: i32 = 30_000; // mA
pub const MAX_NUM_VOLTAGE: i32 = 12_000; // mV
pub const MAX_NUM_TORQUE: i32 = 1_000_000; // uNm

const PRESCALE_SPEED: i64 = 858;
const PRESCALE_ACCELERATION: i64 = 858;
const PRESCALE_CURRENT: i64 = 71_582;
const PRESCALE_VOLTAGE: i64 = 178_956;
const PRESCALE_TORQUE: i64 = 2_147;

/// Number of samples spanned by the numeric speed estimate
pub const DIFFERENTIATOR_WINDOW: usize = 8;

/// Identified model of one motor type
///
/// Each `d_x_d_y` field is `PRESCALE_Y / (dx/dy)`, so small divisors mean
/// strong coupling. Divisors must be nonzero, see [`ObserverModel::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverModel {
    pub d_angle_d_speed: i32,
    pub d_angle_d_current: i32,
    pub d_angle_d_voltage: i32,
    pub d_angle_d_torque: i32,
    pub d_speed_d_speed: i32,
    pub d_speed_d_current: i32,
    pub d_speed_d_voltage: i32,
    pub d_speed_d_torque: i32,
    pub d_current_d_speed: i32,
    pub d_current_d_current: i32,
    pub d_current_d_voltage: i32,
    pub d_current_d_torque: i32,
    pub d_voltage_d_torque: i32,
    pub d_torque_d_voltage: i32,
    pub d_torque_d_speed: i32,
    pub d_torque_d_acceleration: i32,
    /// Coulomb friction torque in uNm
    pub torque_friction: i32,
}

/// Model state: angle in mdeg, speed in mdeg/s, current in mA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelState {
    pub angle: Angle,
    pub speed: i32,
    pub current: i32,
}

fn term(prescale: i64, value: i32, divisor: i32) -> i64 {
    prescale * value as i64 / divisor as i64
}

impl ObserverModel {
    /// Rejects models with a zero divisor
    pub fn validate(&self) -> Result<()> {
        let divisors = [
            self.d_angle_d_speed,
            self.d_angle_d_current,
            self.d_angle_d_voltage,
            self.d_angle_d_torque,
            self.d_speed_d_speed,
            self.d_speed_d_current,
            self.d_speed_d_voltage,
            self.d_speed_d_torque,
            self.d_current_d_speed,
            self.d_current_d_current,
            self.d_current_d_voltage,
            self.d_current_d_torque,
            self.d_voltage_d_torque,
            self.d_torque_d_voltage,
            self.d_torque_d_speed,
            self.d_torque_d_acceleration,
        ];
        if divisors.contains(&0) {
            return Err(Error::InvalidArgument("model coefficients must be nonzero"));
        }
        Ok(())
    }

    /// One discrete step of the model under `voltage` (mV)
    ///
    /// Friction is a step function of the current speed sign. If removing the
    /// friction contribution would flip the sign of the new speed, the speed
    /// lands on zero instead of chattering through it.
    pub fn predict(&self, state: &ModelState, voltage: i32) -> ModelState {
        let torque = if state.speed > 0 {
            self.torque_friction / 2
        } else {
            -self.torque_friction / 2
        };

        let mut angle = state.angle;
        angle.add_mdeg(saturate(
            term(PRESCALE_SPEED, state.speed, self.d_angle_d_speed)
                + term(PRESCALE_CURRENT, state.current, self.d_angle_d_current)
                + term(PRESCALE_VOLTAGE, voltage, self.d_angle_d_voltage)
                + term(PRESCALE_TORQUE, torque, self.d_angle_d_torque),
        ));

        let mut speed = clamp(
            saturate(
                term(PRESCALE_SPEED, state.speed, self.d_speed_d_speed)
                    + term(PRESCALE_CURRENT, state.current, self.d_speed_d_current)
                    + term(PRESCALE_VOLTAGE, voltage, self.d_speed_d_voltage)
                    + term(PRESCALE_TORQUE, torque, self.d_speed_d_torque),
            ),
            MAX_NUM_SPEED,
        );

        let current = clamp(
            saturate(
                term(PRESCALE_SPEED, state.speed, self.d_current_d_speed)
                    + term(PRESCALE_CURRENT, state.current, self.d_current_d_current)
                    + term(PRESCALE_VOLTAGE, voltage, self.d_current_d_voltage)
                    + term(PRESCALE_TORQUE, torque, self.d_current_d_torque),
            ),
            MAX_NUM_CURRENT,
        );

        let friction_speed = term(PRESCALE_TORQUE, torque, self.d_speed_d_torque);
        if (speed < 0) != ((speed as i64 - friction_speed) < 0) {
            speed = 0;
        }

        ModelState {
            angle,
            speed,
            current,
        }
    }

    /// Torque needed to follow a reference rate (mdeg/s) and acceleration (mdeg/s^2)
    pub fn feedforward_torque(&self, rate_ref: i32, acceleration_ref: i32) -> i32 {
        let friction_compensation = self.torque_friction as i64 / 2 * sign(rate_ref) as i64;
        let back_emf_compensation = term(
            PRESCALE_SPEED,
            clamp(rate_ref, MAX_NUM_SPEED),
            self.d_torque_d_speed,
        );
        let acceleration_torque = term(
            PRESCALE_ACCELERATION,
            clamp(acceleration_ref, MAX_NUM_ACCELERATION),
            self.d_torque_d_acceleration,
        );
        clamp(
            saturate(friction_compensation + back_emf_compensation + acceleration_torque),
            MAX_NUM_TORQUE,
        )
    }

    /// Voltage (mV) that produces `torque` (uNm) at standstill
    pub fn torque_to_voltage(&self, torque: i32) -> i32 {
        saturate(term(
            PRESCALE_TORQUE,
            clamp(torque, MAX_NUM_TORQUE),
            self.d_voltage_d_torque,
        ))
    }

    /// Torque (uNm) produced by `voltage` (mV) at standstill
    pub fn voltage_to_torque(&self, voltage: i32) -> i32 {
        saturate(term(
            PRESCALE_VOLTAGE,
            clamp(voltage, MAX_NUM_VOLTAGE),
            self.d_torque_d_voltage,
        ))
    }
}

/// Per-motor observer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverSettings {
    /// Model speed (mdeg/s) below which the motor may count as stalled
    pub stall_speed_limit: i32,
    /// Time (ms) the stall condition must persist before it is reported
    pub stall_time: u32,
    /// Correction voltage per degree of estimation error (mV/deg)
    pub feedback_gain: i32,
}

/// Speed from a finite difference over the last few measured angles
#[derive(Debug, Clone)]
pub struct Differentiator {
    history: [Angle; DIFFERENTIATOR_WINDOW],
    index: usize,
}

impl Differentiator {
    pub fn new(angle: &Angle) -> Self {
        Self {
            history: [*angle; DIFFERENTIATOR_WINDOW],
            index: 0,
        }
    }

    pub fn reset(&mut self, angle: &Angle) {
        self.history = [*angle; DIFFERENTIATOR_WINDOW];
        self.index = 0;
    }

    /// Push a sample and return the speed in mdeg/s across the window
    pub fn get_speed(&mut self, angle: &Angle) -> i32 {
        let oldest = self.history[self.index];
        self.history[self.index] = *angle;
        self.index = (self.index + 1) % DIFFERENTIATOR_WINDOW;

        let span_ms = (DIFFERENTIATOR_WINDOW as i64) * LOOP_TIME_MS as i64;
        saturate((*angle - oldest) * 1000 / span_ms)
    }
}

/// Snapshot returned by [`Observer::get_estimated_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatedState {
    /// Finite-difference speed of the measured angle (mdeg/s)
    pub speed_numeric: i32,
    pub angle: Angle,
    pub speed: i32,
}

pub struct Observer {
    model: ObserverModel,
    settings: ObserverSettings,
    state: ModelState,
    speed_numeric: i32,
    stalled: bool,
    stall_start: u32,
    differentiator: Differentiator,
}

impl Observer {
    pub fn new(model: ObserverModel, settings: ObserverSettings, angle: &Angle) -> Self {
        Self {
            model,
            settings,
            state: ModelState {
                angle: *angle,
                ..ModelState::default()
            },
            speed_numeric: 0,
            stalled: false,
            stall_start: 0,
            differentiator: Differentiator::new(angle),
        }
    }

    /// Jump to `angle` at rest, dropping stall state
    pub fn reset(&mut self, angle: &Angle) {
        self.state = ModelState {
            angle: *angle,
            speed: 0,
            current: 0,
        };
        self.speed_numeric = 0;
        self.stalled = false;
        self.differentiator.reset(angle);
    }

    pub fn get_estimated_state(&self) -> EstimatedState {
        EstimatedState {
            speed_numeric: self.speed_numeric,
            angle: self.state.angle,
            speed: self.state.speed,
        }
    }

    pub fn current(&self) -> i32 {
        self.state.current
    }

    pub fn model(&self) -> &ObserverModel {
        &self.model
    }

    pub fn settings(&self) -> &ObserverSettings {
        &self.settings
    }

    /// Voltage (mV) that steers the model toward `angle`
    pub fn get_feedback_voltage(&self, angle: &Angle) -> i32 {
        let error = angle.diff_mdeg(&self.state.angle);
        clamp(mul_by_gain(error, self.settings.feedback_gain), MAX_NUM_VOLTAGE)
    }

    fn update_stall_state(&mut self, time: u32, actuation: Actuation, feedback_voltage: i32) {
        // Only voltage actuation is part of the model
        let Actuation::Voltage(voltage) = actuation else {
            self.stalled = false;
            return;
        };

        // Work in the forward direction of the applied voltage
        let (speed, voltage, feedback_voltage) = if voltage < 0 {
            (
                self.state.speed.saturating_neg(),
                voltage.saturating_neg(),
                feedback_voltage.saturating_neg(),
            )
        } else {
            (self.state.speed, voltage, feedback_voltage)
        };

        let friction_voltage = self.model.torque_to_voltage(self.model.torque_friction / 2);
        let stalled = speed < self.settings.stall_speed_limit
            // Model ahead of reality: an unmodeled load pushes back
            && feedback_voltage < 0
            // Most of the applied voltage is cancelled by the correction
            && -(feedback_voltage as i64) > (voltage as i64 * 3) / 4
            // Effort well above what friction alone would need
            && voltage as i64 > 5 * friction_voltage as i64;

        if stalled && !self.stalled {
            debug!("Stall condition raised at {} ms", time);
            self.stall_start = time;
        }
        self.stalled = stalled;
    }

    /// Advance the model one tick and correct it with the measured angle
    pub fn update(&mut self, time: u32, angle: &Angle, actuation: Actuation) {
        self.speed_numeric = self.differentiator.get_speed(angle);

        let feedback_voltage = self.get_feedback_voltage(angle);
        self.update_stall_state(time, actuation, feedback_voltage);

        let voltage = actuation.model_voltage().saturating_add(feedback_voltage);
        self.state = self.model.predict(&self.state, voltage);
    }

    /// Stall duration (ms), once the stall has lasted longer than the configured time
    pub fn is_stalled(&self, time: u32) -> Option<u32> {
        let duration = time.wrapping_sub(self.stall_start);
        (self.stalled && duration > self.settings.stall_time).then_some(duration)
    }
}
