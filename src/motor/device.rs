// Hardware-facing contracts: encoder counters and motor actuation
//
// Real drivers and the simulator both sit behind these traits. Errors follow
// the core convention: NoDevice when nothing is attached, Io on bus failures.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Positive rotation direction of a motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Clockwise,
    Counterclockwise,
}

impl Direction {
    /// Map a hardware-frame value into the user frame (and back)
    pub fn apply(self, value: i32) -> i32 {
        match self {
            Direction::Clockwise => value,
            Direction::Counterclockwise => value.wrapping_neg(),
        }
    }
}

/// What is applied to the motor terminals for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuation {
    #[default]
    Coast,
    Brake,
    /// Terminal voltage in mV
    Voltage(i32),
}

impl Actuation {
    /// Voltage seen by the motor model
    ///
    /// Coast and brake feed zero input; friction then dominates the model.
    pub fn model_voltage(self) -> i32 {
        match self {
            Actuation::Voltage(voltage) => voltage,
            Actuation::Coast | Actuation::Brake => 0,
        }
    }

    /// The same actuation with its voltage sign flipped by `direction`
    pub fn oriented(self, direction: Direction) -> Actuation {
        match self {
            Actuation::Voltage(voltage) => Actuation::Voltage(direction.apply(voltage)),
            other => other,
        }
    }
}

/// Raw encoder counter
pub trait Counter: Send {
    /// Accumulated count since power-up
    fn count(&mut self) -> Result<i32>;

    /// Absolute position within one rotation, in counts
    fn abs_count(&mut self) -> Result<i32> {
        Err(Error::NotSupported)
    }

    /// Counts per second
    fn rate(&mut self) -> Result<i32>;
}

/// Motor power stage
pub trait Actuator: Send {
    fn actuate(&mut self, actuation: Actuation) -> Result<()>;
}

/// Source of counters and actuators, indexed by device id
pub trait Hardware: Send {
    fn counter(&mut self, id: u8) -> Result<Box<dyn Counter>>;

    fn actuator(&mut self, id: u8) -> Result<Box<dyn Actuator>>;

    /// Advance driver state to `time` (ms); called once at the start of every tick
    fn poll(&mut self, _time: u32) -> Result<()> {
        Ok(())
    }
}
