//! DPI Scope Platform Layer
//!
//! Kernel packet capture and the traffic engine that feeds captured packets
//! through the core filter chain, plus the `netsh`-backed resolver switch
//! used for DoH.
//!
//! ## Supported Platforms
//!
//! - **Windows**: WinDivert driver
//! - **Elsewhere**: no capture backend; [`open_capture`] reports
//!   [`PlatformError::Unsupported`]

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub use error::{PlatformError, Result};

pub mod dns;
pub mod engine;
mod filter;
mod traits;

pub use dns::NetshDnsController;
pub use engine::{EngineStatsSnapshot, TrafficEngine};
pub use filter::{resolve_filter, validate_filter, FilterBuilder, FilterPresets};
pub use traits::{CapturedPacket, PacketAddress, PacketCapture};

#[cfg(all(windows, feature = "windows"))]
pub mod windows;

/// Open the platform capture handle for `filter`
///
/// # Errors
/// Fails on an invalid filter, a missing driver, a non-elevated process, or
/// a platform without a capture backend.
pub fn open_capture(filter: &str) -> Result<Box<dyn PacketCapture>> {
    validate_filter(filter)?;

    #[cfg(all(windows, feature = "windows"))]
    {
        Ok(Box::new(windows::WinDivertDriver::open(filter, 0)?))
    }

    #[cfg(not(all(windows, feature = "windows")))]
    {
        Err(PlatformError::Unsupported(std::env::consts::OS))
    }
}

/// Whether the process has the privileges packet capture needs
pub fn is_elevated() -> bool {
    #[cfg(all(windows, feature = "windows"))]
    {
        windows::is_elevated()
    }

    #[cfg(not(all(windows, feature = "windows")))]
    {
        false
    }
}
