// Per-port servo table
//
// One slot per motor port, owned by the runtime. Servos are attached and
// detached explicitly; teardown coasts everything that is still attached.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::servo::Servo;
use crate::config::{MotorConfig, NUM_MOTOR_PORTS};
use crate::error::{Error, Result};
use crate::motor::device::Hardware;

/// Motor port letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub enum Port {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Port {
    pub const ALL: [Port; NUM_MOTOR_PORTS] = [Port::A, Port::B, Port::C, Port::D, Port::E, Port::F];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }
}

impl TryFrom<char> for Port {
    type Error = Error;

    fn try_from(letter: char) -> Result<Self> {
        Port::ALL
            .into_iter()
            .find(|port| port.letter() == letter.to_ascii_uppercase())
            .ok_or(Error::InvalidPort(letter))
    }
}

impl From<Port> for char {
    fn from(port: Port) -> char {
        port.letter()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

pub struct MotorRegistry {
    servos: [Option<Servo>; NUM_MOTOR_PORTS],
}

impl MotorRegistry {
    pub fn new() -> Self {
        Self {
            servos: std::array::from_fn(|_| None),
        }
    }

    /// Set up a servo for `config.port`, replacing any unclaimed one there
    pub fn attach(&mut self, hardware: &mut dyn Hardware, config: &MotorConfig) -> Result<()> {
        let port = config.port;
        if self.servos[port.index()]
            .as_ref()
            .is_some_and(Servo::is_claimed)
        {
            return Err(Error::Busy);
        }
        let servo = Servo::setup(hardware, port.index() as u8, config)?;
        self.servos[port.index()] = Some(servo);
        info!("Motor attached on port {}", port);
        Ok(())
    }

    /// Coast and remove the servo on `port`
    pub fn detach(&mut self, port: Port) -> Result<()> {
        let servo = self.get_mut(port)?;
        if servo.is_claimed() {
            return Err(Error::Busy);
        }
        servo.coast_quietly();
        self.servos[port.index()] = None;
        info!("Motor detached from port {}", port);
        Ok(())
    }

    pub fn is_attached(&self, port: Port) -> bool {
        self.servos[port.index()].is_some()
    }

    pub fn get(&self, port: Port) -> Result<&Servo> {
        self.servos[port.index()].as_ref().ok_or(Error::NoDevice)
    }

    pub fn get_mut(&mut self, port: Port) -> Result<&mut Servo> {
        self.servos[port.index()].as_mut().ok_or(Error::NoDevice)
    }

    /// Two distinct servos at once
    pub fn pair_mut(&mut self, first: Port, second: Port) -> Result<(&mut Servo, &mut Servo)> {
        if first == second {
            return Err(Error::InvalidArgument("ports must differ"));
        }
        let (low, high) = (first.index().min(second.index()), first.index().max(second.index()));
        let (head, tail) = self.servos.split_at_mut(high);
        let low_servo = head[low].as_mut().ok_or(Error::NoDevice)?;
        let high_servo = tail[0].as_mut().ok_or(Error::NoDevice)?;
        if first.index() < second.index() {
            Ok((low_servo, high_servo))
        } else {
            Ok((high_servo, low_servo))
        }
    }

    /// Update every attached servo; all are updated even if one fails
    pub fn update(&mut self, time: u32) -> Result<()> {
        let mut first_error = None;
        for (port, servo) in Port::ALL.iter().zip(self.servos.iter_mut()) {
            let Some(servo) = servo else { continue };
            if let Err(e) = servo.update(time) {
                warn!("Update failed on port {}: {}", port, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Port, &Servo)> {
        Port::ALL
            .into_iter()
            .zip(self.servos.iter())
            .filter_map(|(port, servo)| servo.as_ref().map(|servo| (port, servo)))
    }

    /// Release claims, coast and remove every servo
    pub fn teardown(&mut self) {
        for servo in self.servos.iter_mut().flatten() {
            servo.claim(false);
            servo.coast_quietly();
        }
        self.servos = std::array::from_fn(|_| None);
        info!("Motor registry torn down");
    }
}

impl Default for MotorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MODEL_MEDIUM_MOTOR;
    use crate::motor::device::{Actuation, Direction};
    use crate::motor::math::Fix16;
    use crate::sim::{SimHardware, SimMotor};

    fn hardware_with(ports: &[Port]) -> SimHardware {
        let mut hardware = SimHardware::new();
        for port in ports {
            hardware.attach(port.index() as u8, SimMotor::new(MODEL_MEDIUM_MOTOR, Fix16::ONE));
        }
        hardware
    }

    #[test]
    fn test_port_letters() {
        assert_eq!(Port::try_from('c'), Ok(Port::C));
        assert_eq!(Port::try_from('G'), Err(Error::InvalidPort('G')));
        assert_eq!(Port::F.to_string(), "F");
        assert_eq!(serde_json::to_string(&Port::B).unwrap(), "\"B\"");
        assert!(serde_json::from_str::<Port>("\"Z\"").is_err());
    }

    #[test]
    fn test_attach_and_lookup() {
        let mut hardware = hardware_with(&[Port::A, Port::D]);
        let mut registry = MotorRegistry::new();
        registry
            .attach(&mut hardware, &MotorConfig::new(Port::D, Direction::Clockwise))
            .unwrap();

        assert!(registry.get(Port::D).is_ok());
        assert!(matches!(registry.get(Port::A), Err(Error::NoDevice)));
        // Nothing plugged into C
        let result = registry.attach(&mut hardware, &MotorConfig::new(Port::C, Direction::Clockwise));
        assert_eq!(result.err(), Some(Error::NoDevice));
        assert_eq!(registry.iter().count(), 1);
    }

    #[test]
    fn test_pair_mut_returns_requested_order() {
        let mut hardware = hardware_with(&[Port::B, Port::E]);
        let mut registry = MotorRegistry::new();
        registry
            .attach(&mut hardware, &MotorConfig::new(Port::B, Direction::Clockwise))
            .unwrap();
        registry
            .attach(&mut hardware, &MotorConfig::new(Port::E, Direction::Counterclockwise))
            .unwrap();

        let (first, second) = registry.pair_mut(Port::E, Port::B).unwrap();
        assert_eq!(first.direction(), Direction::Counterclockwise);
        assert_eq!(second.direction(), Direction::Clockwise);

        assert!(matches!(
            registry.pair_mut(Port::B, Port::B),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.pair_mut(Port::B, Port::C),
            Err(Error::NoDevice)
        ));
    }

    #[test]
    fn test_claimed_port_cannot_be_replaced_or_detached() {
        let mut hardware = hardware_with(&[Port::A]);
        let mut registry = MotorRegistry::new();
        let config = MotorConfig::new(Port::A, Direction::Clockwise);
        registry.attach(&mut hardware, &config).unwrap();
        registry.get_mut(Port::A).unwrap().claim(true);

        assert_eq!(registry.attach(&mut hardware, &config).err(), Some(Error::Busy));
        assert_eq!(registry.detach(Port::A).err(), Some(Error::Busy));

        registry.get_mut(Port::A).unwrap().claim(false);
        registry.detach(Port::A).unwrap();
        assert!(!registry.is_attached(Port::A));
        assert_eq!(registry.detach(Port::A).err(), Some(Error::NoDevice));
    }

    #[test]
    fn test_teardown_coasts_everything() {
        let mut hardware = hardware_with(&[Port::A, Port::B]);
        let mut registry = MotorRegistry::new();
        for port in [Port::A, Port::B] {
            registry
                .attach(&mut hardware, &MotorConfig::new(port, Direction::Clockwise))
                .unwrap();
            registry.get_mut(port).unwrap().set_voltage(4000).unwrap();
        }
        registry.update(0).unwrap();
        registry.teardown();

        for port in [Port::A, Port::B] {
            let motor = hardware.motor(port.index() as u8).unwrap();
            assert_eq!(motor.actuation(), Actuation::Coast);
            assert!(!registry.is_attached(port));
        }
    }
}
