// Message types exchanged with the runtime
//
// Commands go from clients to the control loop and are applied at the next
// tick. Status snapshots come back once per tick.

use serde::{Deserialize, Serialize};

use crate::motor::{DriveSettings, DriveState, DrivebaseState, Port, Stop};

/// Command from a client -> runtime
// Tagged so a command reads as {"type": "drive_curve", ...} in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Arc of `radius` mm through `angle_or_distance` degrees, or a straight
    /// line of `angle_or_distance` mm when `radius` is `RADIUS_INF`
    DriveCurve {
        radius: i32,
        angle_or_distance: i32,
        // Drivebase defaults when left out
        #[serde(default)]
        drive_speed: Option<i32>,
        #[serde(default)]
        turn_rate: Option<i32>,
        #[serde(default)]
        after_stop: Stop,
    },
    DriveForever {
        speed: i32,
        turn_rate: i32,
    },
    Stop {
        #[serde(default)]
        after_stop: Stop,
    },
    StopControl,
    /// Reserve both drivebase servos, or hand them back
    ClaimServos {
        claim: bool,
    },
    SetDriveSettings {
        settings: DriveSettings,
    },
    Run {
        port: Port,
        speed: i32,
    },
    RunTarget {
        port: Port,
        speed: i32,
        target: i32,
        #[serde(default)]
        after_stop: Stop,
    },
    RunAngle {
        port: Port,
        speed: i32,
        angle: i32,
        #[serde(default)]
        after_stop: Stop,
    },
    ServoStop {
        port: Port,
        #[serde(default)]
        after_stop: Stop,
    },
    SetVoltage {
        port: Port,
        voltage: i32,
    },
    ResetAngle {
        port: Port,
        angle: i32,
    },
}

/// Per-motor part of the status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorStatus {
    pub port: Port,
    /// degrees
    pub angle: i32,
    /// deg/s, observer estimate
    pub speed: i32,
    pub busy: bool,
    pub claimed: bool,
    /// ms the motor has been stalled, once past the debounce time
    pub stalled: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrivebaseStatus {
    pub state: DrivebaseState,
    pub busy: bool,
    pub claimed: bool,
    pub drive: DriveState,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    #[default]
    Ok,
    // A motor is stalled
    Stalled,
    // The last tick failed to read or actuate hardware
    Fault,
}

/// Snapshot published after every tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// ms since the runtime started
    pub time: u32,
    pub motors: Vec<MotorStatus>,
    pub drivebase: Option<DrivebaseStatus>,
    /// Commands taken off the queue so far, including rejected ones
    pub commands_applied: u64,
    pub last_error: Option<String>,
    pub health: RuntimeHealth,
}

impl RuntimeStatus {
    /// True while the drivebase or any servo still has motion to finish
    pub fn is_busy(&self) -> bool {
        self.drivebase.is_some_and(|db| db.busy) || self.motors.iter().any(|m| m.busy)
    }

    pub fn motor(&self, port: Port) -> Option<&MotorStatus> {
        self.motors.iter().find(|m| m.port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_uses_defaults() {
        let cmd: Command =
            serde_json::from_str(r#"{"type": "drive_curve", "radius": 100, "angle_or_distance": 90}"#)
                .unwrap();
        assert_eq!(
            cmd,
            Command::DriveCurve {
                radius: 100,
                angle_or_distance: 90,
                drive_speed: None,
                turn_rate: None,
                after_stop: Stop::Coast,
            }
        );

        let cmd: Command =
            serde_json::from_str(r#"{"type": "run_target", "port": "c", "speed": 300, "target": 90, "after_stop": "hold"}"#)
                .unwrap();
        assert_eq!(
            cmd,
            Command::RunTarget {
                port: Port::C,
                speed: 300,
                target: 90,
                after_stop: Stop::Hold,
            }
        );
    }

    #[test]
    fn test_claim_command_json() {
        let cmd: Command =
            serde_json::from_str(r#"{"type": "claim_servos", "claim": true}"#).unwrap();
        assert_eq!(cmd, Command::ClaimServos { claim: true });
        assert!(serde_json::from_str::<Command>(r#"{"type": "claim_servos"}"#).is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"type": "fly"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"type": "run", "port": "Q", "speed": 1}"#).is_err());
    }

    #[test]
    fn test_status_busy() {
        let mut status = RuntimeStatus::default();
        assert!(!status.is_busy());

        status.motors.push(MotorStatus {
            port: Port::A,
            angle: 0,
            speed: 0,
            busy: false,
            claimed: true,
            stalled: None,
        });
        status.drivebase = Some(DrivebaseStatus {
            state: DrivebaseState::FiniteMove,
            busy: true,
            claimed: true,
            drive: DriveState::default(),
        });
        assert!(status.is_busy());
        assert_eq!(status.motor(Port::A).map(|m| m.claimed), Some(true));
        assert!(status.motor(Port::B).is_none());
    }
}
