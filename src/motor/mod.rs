// Motor control core
//
// Provides:
// - Fixed-point helpers and the two-part angle type
// - Tachometer, state observer and trajectory generator
// - Single-motor servo control and the per-port registry
// - Two-motor differential drivebase

pub mod angle;
pub mod control;
pub mod device;
pub mod drivebase;
pub mod math;
pub mod observer;
pub mod registry;
pub mod servo;
pub mod tacho;
pub mod trajectory;

pub use angle::Angle;
pub use control::{Control, ControlMode, ControlSettings, Stop};
pub use device::{Actuation, Actuator, Counter, Direction, Hardware};
pub use drivebase::{DriveSettings, DriveState, Drivebase, DrivebaseState, RADIUS_INF};
pub use math::{Fix16, Scale};
pub use observer::{Observer, ObserverModel, ObserverSettings};
pub use registry::{MotorRegistry, Port};
pub use servo::Servo;
pub use tacho::Tacho;
pub use trajectory::{Reference, Trajectory};
