// Error kinds reported by the motor control core
//
// Tachometers, servos and drivebases return the first error they hit and leave
// their persisted state untouched, so a retry always starts from a known state.

/// Errors for tachometer, servo and drivebase operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Invalid port: {0}")]
    InvalidPort(char),

    #[error("No device connected")]
    NoDevice,

    #[error("I/O error while accessing the device")]
    Io,

    #[error("Device is claimed by another controller")]
    Busy,

    #[error("Operation still in progress")]
    Again,

    #[error("Operation not supported by this device")]
    NotSupported,

    #[error("Timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
