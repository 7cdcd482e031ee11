//! Sandbox check override for the trust broker.
//!
//! Sandboxed processes that load the bundle loader need to look up the
//! substituted mach service, which their profiles do not allow. This hook
//! grants exactly that one lookup and forwards every other check to the
//! real checker unchanged.

use crate::paths::{MACH_LOOKUP_OPERATION, SUBSTITUTED_SERVICE};

/// sandbox_check is variadic; the real argument count cannot be recovered
/// at the hook boundary, so a fixed number of pointer-sized slots is read
/// and relayed. Five covers every check in use.
pub const FORWARDED_ARG_SLOTS: usize = 5;

/// Should this check be answered "allowed" without consulting the real
/// checker? Only the broker service lookup qualifies.
pub fn allows_unconditionally(operation: &[u8], service_name: Option<&[u8]>) -> bool {
    operation == MACH_LOOKUP_OPERATION.as_bytes()
        && service_name == Some(SUBSTITUTED_SERVICE.as_bytes())
}

#[cfg(target_os = "macos")]
mod ffi {
    use core::ffi::{c_char, c_int};
    use std::ffi::CStr;

    use log::warn;

    use super::allows_unconditionally;
    use crate::paths::MACH_LOOKUP_OPERATION;

    /// Replacement for `sandbox_check`. The trailing slots mirror
    /// [`super::FORWARDED_ARG_SLOTS`] pointer-sized arguments; checks that
    /// use fewer ignore the extra values, exactly as the variadic original
    /// would.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn hook_sandbox_check(
        pid: libc::pid_t,
        operation: *const c_char,
        check_type: c_int,
        arg0: usize,
        arg1: usize,
        arg2: usize,
        arg3: usize,
        arg4: usize,
    ) -> c_int {
        if !operation.is_null() {
            let op = unsafe { CStr::from_ptr(operation) }.to_bytes();
            if op == MACH_LOOKUP_OPERATION.as_bytes() {
                let name_ptr = arg0 as *const c_char;
                let name = if name_ptr.is_null() {
                    None
                } else {
                    Some(unsafe { CStr::from_ptr(name_ptr) }.to_bytes())
                };
                if allows_unconditionally(op, name) {
                    return 0;
                }
            }
        }

        match crate::original_sandbox_check() {
            Some(original) => unsafe {
                original(pid, operation, check_type, arg0, arg1, arg2, arg3, arg4)
            },
            None => {
                // Hook reached before interposition captured the original;
                // behave as if no sandbox were present rather than deny.
                warn!("sandbox_check hook called with no original captured");
                0
            }
        }
    }
}

#[cfg(target_os = "macos")]
pub use ffi::hook_sandbox_check;
