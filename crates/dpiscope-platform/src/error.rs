//! Platform-specific errors

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Driver initialization failed
    #[error("Driver initialization failed: {0}")]
    DriverInitFailed(String),

    /// Filter syntax error
    #[error("Invalid filter syntax: {0}")]
    InvalidFilter(String),

    /// Packet capture error
    #[error("Capture error: {0}")]
    CaptureError(String),

    /// Packet injection error
    #[error("Injection error: {0}")]
    InjectionError(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The capture handle is closed or was never opened
    #[error("Handle error: {0}")]
    HandleError(String),

    /// No capture backend on this platform
    #[error("Packet capture is not supported on {0}")]
    Unsupported(&'static str),

    /// The engine is already running or already stopped
    #[error("Traffic engine is {0}")]
    EngineState(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Platform result type
pub type Result<T> = std::result::Result<T, PlatformError>;
