//! posix_spawn hook, loaded into launchd and from there into xpcproxy.
//!
//! Its job is to make sure bundle-loader.dylib rides along in
//! `DYLD_INSERT_LIBRARIES` whenever the process manager launches a job,
//! to lift the kernel's `__restrict` injection block on targets that carry
//! it, and to let sandboxed processes look up the substituted broker
//! service. Processes that do their own spawning are deliberately left
//! alone (beyond whatever environment they inherit): the bundle loader
//! synchronously contacts the broker, so it must never end up in anything
//! launchd runs before services are up. That is also why launchd itself
//! only ever injects the self-hook into xpcproxy and jobs are instrumented
//! from inside the relay.
//!
//! Built as a cdylib; the hooks are spliced in at load time by interposing
//! this image's own imports, which keeps the footprint small and avoids
//! fighting other hooking frameworks over the shared cache.

pub mod env_rewrite;
pub mod macho;
pub mod paths;
pub mod policy;
pub mod sandbox;
pub mod spawn_hook;
pub mod unrestrict;

#[cfg(target_os = "macos")]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Signature of the unhooked posix_spawn/posix_spawnp primitives.
#[cfg(target_os = "macos")]
pub(crate) type PosixSpawnFn = unsafe extern "C" fn(
    *mut libc::pid_t,
    *const core::ffi::c_char,
    *const libc::posix_spawn_file_actions_t,
    *const libc::posix_spawnattr_t,
    *const *mut core::ffi::c_char,
    *const *mut core::ffi::c_char,
) -> core::ffi::c_int;

/// Signature the fixed-arity sandbox override forwards to; the trailing
/// slots stand in for the original's varargs.
#[cfg(target_os = "macos")]
pub(crate) type SandboxCheckFn = unsafe extern "C" fn(
    libc::pid_t,
    *const core::ffi::c_char,
    core::ffi::c_int,
    usize,
    usize,
    usize,
    usize,
    usize,
) -> core::ffi::c_int;

// Process-wide configuration, written exactly once during initialization.
// The interposition facility stores each original function pointer through
// the slot we hand it *before* the matching import is patched, so a hook
// can never observe its original as unset; IS_MANAGER is stored before
// interposition is requested. All of it is read-only afterwards.
#[cfg(target_os = "macos")]
static ORIGINAL_POSIX_SPAWN: AtomicUsize = AtomicUsize::new(0);
#[cfg(target_os = "macos")]
static ORIGINAL_POSIX_SPAWNP: AtomicUsize = AtomicUsize::new(0);
#[cfg(target_os = "macos")]
static ORIGINAL_SANDBOX_CHECK: AtomicUsize = AtomicUsize::new(0);
#[cfg(target_os = "macos")]
static IS_MANAGER: AtomicBool = AtomicBool::new(false);

/// Is this process the top-level process manager (launchd)?
#[cfg(target_os = "macos")]
pub(crate) fn caller_is_manager() -> bool {
    IS_MANAGER.load(Ordering::Acquire)
}

#[cfg(target_os = "macos")]
fn original_fn<T: Copy>(slot: &AtomicUsize) -> Option<T> {
    let addr = slot.load(Ordering::Acquire);
    if addr == 0 {
        return None;
    }
    debug_assert_eq!(size_of::<T>(), size_of::<usize>());
    // The slot holds a function address captured by the interposer.
    Some(unsafe { std::mem::transmute_copy::<usize, T>(&addr) })
}

#[cfg(target_os = "macos")]
pub(crate) fn original_posix_spawn() -> Option<PosixSpawnFn> {
    original_fn(&ORIGINAL_POSIX_SPAWN)
}

#[cfg(target_os = "macos")]
pub(crate) fn original_posix_spawnp() -> Option<PosixSpawnFn> {
    original_fn(&ORIGINAL_POSIX_SPAWNP)
}

#[cfg(target_os = "macos")]
pub(crate) fn original_sandbox_check() -> Option<SandboxCheckFn> {
    original_fn(&ORIGINAL_SANDBOX_CHECK)
}

#[cfg(target_os = "macos")]
mod init {
    use core::ffi::{c_char, c_int, c_void};
    use std::ffi::CStr;
    use std::sync::atomic::Ordering;

    use anyhow::{Result, anyhow, bail};
    use log::{debug, error};

    use super::{IS_MANAGER, ORIGINAL_POSIX_SPAWN, ORIGINAL_POSIX_SPAWNP, ORIGINAL_SANDBOX_CHECK};

    /// One import to patch: symbol name, replacement, and where the
    /// facility stores the original pointer before patching.
    #[repr(C)]
    struct ImportHook {
        function: *const c_char,
        replacement: *mut c_void,
        old_ptr: *mut c_void,
    }

    // Import-patching facility, supplied by libsubstitute at link time.
    // Used only here, never on the spawn hot path.
    unsafe extern "C" {
        fn substitute_open_image(filename: *const c_char) -> *mut c_void;
        fn substitute_close_image(im: *mut c_void);
        fn substitute_interpose_imports(
            im: *mut c_void,
            hooks: *const ImportHook,
            nhooks: usize,
            options: *mut c_void,
            flags: c_int,
        ) -> c_int;
        fn substitute_strerror(err: c_int) -> *const c_char;
        fn _dyld_get_image_name(index: u32) -> *const c_char;
    }

    fn strerror(err: c_int) -> String {
        let msg = unsafe { substitute_strerror(err) };
        if msg.is_null() {
            format!("error {err}")
        } else {
            unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
        }
    }

    fn install() -> Result<()> {
        // Image 0 is the main executable of the process we were loaded
        // into; that decides which policy branch this instance runs.
        let image0 = unsafe { _dyld_get_image_name(0) };
        if image0.is_null() {
            bail!("could not resolve main image name");
        }
        let image_path = unsafe { CStr::from_ptr(image0) }.to_string_lossy();
        let is_manager = image_path.contains("launchd");
        IS_MANAGER.store(is_manager, Ordering::Release);
        debug!("loaded into {image_path} (manager={is_manager})");

        let image = unsafe { substitute_open_image(image0) };
        if image.is_null() {
            bail!("substitute_open_image failed for {image_path}");
        }

        let hooks = [
            ImportHook {
                function: c"_posix_spawn".as_ptr(),
                replacement: crate::spawn_hook::hook_posix_spawn as *const () as *mut c_void,
                old_ptr: ORIGINAL_POSIX_SPAWN.as_ptr().cast::<c_void>(),
            },
            ImportHook {
                function: c"_posix_spawnp".as_ptr(),
                replacement: crate::spawn_hook::hook_posix_spawnp as *const () as *mut c_void,
                old_ptr: ORIGINAL_POSIX_SPAWNP.as_ptr().cast::<c_void>(),
            },
            ImportHook {
                function: c"_sandbox_check".as_ptr(),
                replacement: crate::sandbox::hook_sandbox_check as *const () as *mut c_void,
                old_ptr: ORIGINAL_SANDBOX_CHECK.as_ptr().cast::<c_void>(),
            },
        ];

        let err = unsafe {
            substitute_interpose_imports(
                image,
                hooks.as_ptr(),
                hooks.len(),
                std::ptr::null_mut(),
                0,
            )
        };
        unsafe { substitute_close_image(image) };
        if err != 0 {
            return Err(anyhow!("substitute_interpose_imports failed: {}", strerror(err)));
        }
        Ok(())
    }

    /// Entry point run when the library is loaded, before any job spawn
    /// can pass through this process.
    #[unsafe(no_mangle)]
    pub extern "C" fn posixspawn_hook_init() {
        let _ = env_logger::try_init();
        if let Err(e) = install() {
            // Leave the process un-hooked rather than unusable.
            error!("posixspawn-hook initialization failed: {e:#}");
        }
    }

    /// Constructor entry for automatic initialization on library load.
    #[cfg(not(test))]
    #[unsafe(link_section = "__DATA,__mod_init_func")]
    #[used]
    static INIT: extern "C" fn() = {
        extern "C" fn init() {
            posixspawn_hook_init();
        }
        init
    };
}

#[cfg(target_os = "macos")]
mod notify {
    use core::ffi::c_int;

    use log::warn;
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::message::{
        MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MOVE_SEND, MACH_SEND_MSG, mach_msg,
        mach_msg_header_t,
    };
    use mach2::port::{MACH_PORT_NULL, mach_port_t};

    /// Message id the injector's notify port expects for "hook is in place".
    const LOADED_MSG_ID: i32 = 42;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct MachEndpoint {
        pub port: mach_port_t,
        pub right_type: c_int,
    }

    #[repr(C)]
    pub union ShuttleEndpoint {
        pub mach: MachEndpoint,
    }

    /// Handoff record passed by the injector, mirroring libsubstitute's
    /// shuttle layout. Only the mach variant is used here.
    #[repr(C)]
    pub struct Shuttle {
        pub kind: c_int,
        pub u: ShuttleEndpoint,
    }

    /// Called by the injection glue once this library is mapped; tells the
    /// injector it can stop waiting. Fire-and-forget: a failed send only
    /// delays the injector's own timeout.
    ///
    /// # Safety
    /// `shuttle` must point to `nshuttle` valid shuttle records.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn substitute_init(shuttle: *const Shuttle, nshuttle: usize) {
        if nshuttle != 1 || shuttle.is_null() {
            warn!("unexpected shuttle count {nshuttle}; not notifying injector");
            return;
        }
        let port = unsafe { (*shuttle).u.mach.port };

        let mut header = mach_msg_header_t {
            msgh_bits: MACH_MSG_TYPE_MOVE_SEND,
            msgh_size: size_of::<mach_msg_header_t>() as u32,
            msgh_remote_port: port,
            msgh_local_port: MACH_PORT_NULL,
            msgh_voucher_port: MACH_PORT_NULL,
            msgh_id: LOADED_MSG_ID,
        };
        // MOVE_SEND: a successful send consumes the port right.
        let kr = unsafe {
            mach_msg(
                &mut header,
                MACH_SEND_MSG,
                header.msgh_size,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr != KERN_SUCCESS {
            warn!("loaded-notification send failed: kr={kr:#x}");
        }
    }
}
