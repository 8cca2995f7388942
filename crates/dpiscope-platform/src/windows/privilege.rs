//! Process elevation check

use std::mem;
use std::ptr;
use winapi::ctypes::c_void;
use winapi::um::handleapi::CloseHandle;
use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
use winapi::um::securitybaseapi::GetTokenInformation;
use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

/// Whether the current process token is elevated
///
/// Opening a WinDivert handle requires it; any failure reading the token
/// counts as "not elevated".
pub fn is_elevated() -> bool {
    // SAFETY: the token handle is checked before use and always closed; the
    // output buffer is a correctly sized TOKEN_ELEVATION
    unsafe {
        let mut token: HANDLE = ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation: TOKEN_ELEVATION = mem::zeroed();
        let mut size = mem::size_of::<TOKEN_ELEVATION>() as u32;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            ptr::addr_of_mut!(elevation).cast::<c_void>(),
            size,
            &mut size,
        );
        CloseHandle(token);

        ok != 0 && elevation.TokenIsElevated != 0
    }
}
