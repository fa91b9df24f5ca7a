// Loop timing, default motor parameters, runtime configuration file
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::motor::control::ControlSettings;
use crate::motor::device::Direction;
use crate::motor::drivebase::DriveSettings;
use crate::motor::math::Fix16;
use crate::motor::observer::{ObserverModel, ObserverSettings};
use crate::motor::registry::Port;

// Control loop period
pub const LOOP_TIME_MS: u32 = 5;

// Number of motor ports in the registry
pub const NUM_MOTOR_PORTS: usize = 6;

// Identified model of the reference medium motor (5 ms sample time)
pub const MODEL_MEDIUM_MOTOR: ObserverModel = ObserverModel {
    d_angle_d_speed: 224_551,
    d_angle_d_current: 353_289,
    d_angle_d_voltage: 1_059_631,
    d_angle_d_torque: -706_292,
    d_speed_d_speed: 1_623,
    d_speed_d_current: 2_195,
    d_speed_d_voltage: 2_650,
    d_speed_d_torque: -1_961,
    d_current_d_speed: -1_295_297,
    d_current_d_current: -1_754_619,
    d_current_d_voltage: 1_886_104,
    d_current_d_torque: 1_821_388,
    d_voltage_d_torque: 143_133,
    d_torque_d_voltage: 2_684,
    d_torque_d_speed: 1_843,
    d_torque_d_acceleration: 245_799,
    torque_friction: 20_000,
};

pub const DEFAULT_OBSERVER_SETTINGS: ObserverSettings = ObserverSettings {
    stall_speed_limit: 20_000,
    stall_time: 200,
    feedback_gain: 500,
};

pub const DEFAULT_CONTROL_SETTINGS: ControlSettings = ControlSettings {
    speed_max: 1_000_000,
    acceleration: 2_000_000,
    position_tolerance: 5_000,
    speed_tolerance: 50_000,
    kp: 20_000,
    ki: 2_000,
    kd: 1_000,
    actuation_max: 800_000,
};

// Drive speeds in mm/s, turn rates in deg/s
pub const DEFAULT_DRIVE_SETTINGS: DriveSettings = DriveSettings {
    drive_speed: 200,
    drive_acceleration: 400,
    turn_rate: 90,
    turn_acceleration: 180,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One motor attached to a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub port: Port,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "unit_scale")]
    pub counts_per_degree: Fix16,
    #[serde(default = "unit_scale")]
    pub gear_ratio: Fix16,
    #[serde(default = "default_model")]
    pub model: ObserverModel,
    #[serde(default = "default_observer")]
    pub observer: ObserverSettings,
    #[serde(default = "default_control")]
    pub control: ControlSettings,
}

impl MotorConfig {
    pub fn new(port: Port, direction: Direction) -> Self {
        Self {
            port,
            direction,
            counts_per_degree: Fix16::ONE,
            gear_ratio: Fix16::ONE,
            model: MODEL_MEDIUM_MOTOR,
            observer: DEFAULT_OBSERVER_SETTINGS,
            control: DEFAULT_CONTROL_SETTINGS,
        }
    }
}

/// Two attached motors driven as one differential drivebase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrivebaseConfig {
    pub left: Port,
    pub right: Port,
    /// Wheel diameter in mm
    pub wheel_diameter: Fix16,
    /// Distance between the wheel contact points in mm
    pub axle_track: Fix16,
    #[serde(default = "default_drive")]
    pub settings: DriveSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub motors: Vec<MotorConfig>,
    #[serde(default)]
    pub drivebase: Option<DrivebaseConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            // Mirrored mounting: the left motor turns counterclockwise to drive forward
            motors: vec![
                MotorConfig::new(Port::A, Direction::Counterclockwise),
                MotorConfig::new(Port::B, Direction::Clockwise),
            ],
            drivebase: Some(DrivebaseConfig {
                left: Port::A,
                right: Port::B,
                wheel_diameter: Fix16::from_int(56),
                axle_track: Fix16::from_int(112),
                settings: DEFAULT_DRIVE_SETTINGS,
            }),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading config from {}", path.display());
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks and motor models; the remaining numeric ranges are
    /// checked when the motors are set up
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, motor) in self.motors.iter().enumerate() {
            motor.model.validate().map_err(|e| {
                ConfigError::Invalid(format!("port {} model: {}", motor.port, e))
            })?;
            if self.motors[..i].iter().any(|other| other.port == motor.port) {
                return Err(ConfigError::Invalid(format!(
                    "port {} configured twice",
                    motor.port
                )));
            }
        }
        if let Some(db) = &self.drivebase {
            for port in [db.left, db.right] {
                if !self.motors.iter().any(|m| m.port == port) {
                    return Err(ConfigError::Invalid(format!(
                        "drivebase uses port {} which has no motor",
                        port
                    )));
                }
            }
            if db.left == db.right {
                return Err(ConfigError::Invalid(
                    "drivebase needs two different ports".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn unit_scale() -> Fix16 {
    Fix16::ONE
}

fn default_model() -> ObserverModel {
    MODEL_MEDIUM_MOTOR
}

fn default_observer() -> ObserverSettings {
    DEFAULT_OBSERVER_SETTINGS
}

fn default_control() -> ControlSettings {
    DEFAULT_CONTROL_SETTINGS
}

fn default_drive() -> DriveSettings {
    DEFAULT_DRIVE_SETTINGS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.motors.len(), 2);
        assert!(DEFAULT_CONTROL_SETTINGS.validate().is_ok());
        assert!(DEFAULT_DRIVE_SETTINGS.validate().is_ok());
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let config = RuntimeConfig::from_json(
            r#"{
                "motors": [
                    {"port": "C", "gear_ratio": 1.5},
                    {"port": "D", "direction": "counterclockwise"}
                ],
                "drivebase": {"left": "C", "right": "D", "wheel_diameter": 43.2, "axle_track": 120}
            }"#,
        )
        .unwrap();

        let first = &config.motors[0];
        assert_eq!(first.port, Port::C);
        assert_eq!(first.gear_ratio, Fix16::from_ratio(3, 2).unwrap());
        assert_eq!(first.counts_per_degree, Fix16::ONE);
        assert_eq!(first.model, MODEL_MEDIUM_MOTOR);
        assert_eq!(config.motors[1].direction, Direction::Counterclockwise);

        let db = config.drivebase.unwrap();
        assert_eq!(db.axle_track, Fix16::from_int(120));
        assert_eq!(db.settings, DEFAULT_DRIVE_SETTINGS);
    }

    #[test]
    fn test_zero_model_divisor_rejected() {
        let mut config = RuntimeConfig::default();
        config.motors[1].model.d_angle_d_speed = 0;
        let text = serde_json::to_string(&config).unwrap();

        let err = RuntimeConfig::from_json(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{}", err);
        assert!(err.to_string().contains("port B"), "{}", err);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = RuntimeConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(RuntimeConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let duplicate = r#"{"motors": [{"port": "A"}, {"port": "A"}]}"#;
        assert!(matches!(
            RuntimeConfig::from_json(duplicate),
            Err(ConfigError::Invalid(_))
        ));

        let missing = r#"{"motors": [{"port": "A"}],
            "drivebase": {"left": "A", "right": "B", "wheel_diameter": 56, "axle_track": 112}}"#;
        assert!(matches!(
            RuntimeConfig::from_json(missing),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            RuntimeConfig::from_json("{\"motors\": 3}"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RuntimeConfig::load("/nonexistent/drivebase.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
