//! Windows platform implementation using WinDivert
//!
//! WinDivert is a kernel driver that allows capturing and modifying
//! network packets on Windows.

mod driver;
mod privilege;

pub use driver::WinDivertDriver;
pub use privilege::is_elevated;
