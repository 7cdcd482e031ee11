//! Coordination of the privileged unrestrict helper.
//!
//! When a target binary carries the restriction marker, the spawn is forced
//! to start suspended and the helper is run against the new process to lift
//! the restriction, then resume it if the caller had not asked for
//! suspension. The two spawn modes need opposite orderings:
//!
//! - create-new-process: spawn first (suspended), then run the helper with
//!   the child pid;
//! - replace-current-process: there is no return after a successful exec,
//!   so the helper runs *before* the primitive against our own pid, and a
//!   marker descriptor tells it which process is about to exec.
//!
//! The helper is reaped synchronously. It is spawned through the unhooked
//! primitive with a minimal safe-mode environment, so it can never recurse
//! back into this hook.

use std::ffi::CString;
#[cfg(target_os = "macos")]
use std::io;

#[cfg(target_os = "macos")]
use log::{debug, warn};

use crate::paths::UNRESTRICT_HELPER;
#[cfg(target_os = "macos")]
use crate::PosixSpawnFn;

/// High descriptor slot duplicated from stderr before a replace-exec. Its
/// presence (close-on-exec) marks the target for the helper.
pub const MARKER_FD: i32 = 255;

/// The helper's entire environment. The safe-mode marker keeps the hook
/// inside the helper's own spawn chain inert.
pub const HELPER_SAFE_MODE_ENV: &[u8] = b"_MSSafeMode=1";

/// One helper invocation: which pid to unrestrict and what to do after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrestrictHandshake {
    pub pid: i32,
    pub should_resume: bool,
    pub is_replace_exec: bool,
}

/// How the intercepted spawn transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// POSIX_SPAWN_SETEXEC: the calling process is replaced.
    ReplaceImage,
    /// Ordinary spawn: a new child is created.
    CreateChild,
}

/// The half of the unrestriction work still owed relative to the real
/// spawn call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrestrictObligation {
    /// Helper must run before the primitive, against the current pid.
    BeforeExec { should_resume: bool },
    /// Helper runs after the primitive returns, against the child pid.
    AfterSpawn { should_resume: bool },
}

/// Map a restricted spawn onto its obligation. The caller's original
/// suspend setting decides whether the helper resumes the target.
pub fn obligation_for(mode: SpawnMode, was_suspended: bool) -> UnrestrictObligation {
    let should_resume = !was_suspended;
    match mode {
        SpawnMode::ReplaceImage => UnrestrictObligation::BeforeExec { should_resume },
        SpawnMode::CreateChild => UnrestrictObligation::AfterSpawn { should_resume },
    }
}

/// Positional argument vector for one helper run:
/// `unrestrict <pid> <resume:0|1> <is-exec:0|1>`.
///
/// None if an argument cannot be represented as a C string; the caller
/// treats that like a helper start failure.
pub fn helper_argv(handshake: &UnrestrictHandshake) -> Option<Vec<CString>> {
    let flag = |b: bool| if b { "1" } else { "0" };
    [
        UNRESTRICT_HELPER.to_string(),
        handshake.pid.to_string(),
        flag(handshake.should_resume).to_string(),
        flag(handshake.is_replace_exec).to_string(),
    ]
    .into_iter()
    .map(|arg| CString::new(arg).ok())
    .collect()
}

/// Duplicate stderr onto the marker slot, close-on-exec.
#[cfg(target_os = "macos")]
pub(crate) fn install_marker_fd() -> io::Result<()> {
    unsafe {
        if libc::dup2(2, MARKER_FD) != MARKER_FD {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(MARKER_FD, libc::F_SETFD, libc::FD_CLOEXEC) != 0 {
            let err = io::Error::last_os_error();
            libc::close(MARKER_FD);
            return Err(err);
        }
    }
    Ok(())
}

/// Release the marker slot on paths where the exec will not happen.
#[cfg(target_os = "macos")]
pub(crate) fn remove_marker_fd() {
    unsafe {
        libc::close(MARKER_FD);
    }
}

/// Spawn the helper through the *unhooked* primitive and wait for it.
///
/// Returns false if the helper could not be started at all; the caller
/// must then abandon injection so the target is never left suspended with
/// nothing scheduled to resume it. A wait failure is logged only — the
/// lift itself already happened or failed on the helper's side.
#[cfg(target_os = "macos")]
pub(crate) unsafe fn run_helper(handshake: &UnrestrictHandshake, original: PosixSpawnFn) -> bool {
    let Some(argv_storage) = helper_argv(handshake) else {
        warn!("could not build unrestrict helper arguments");
        return false;
    };
    let mut argv: Vec<*mut libc::c_char> = argv_storage
        .iter()
        .map(|arg| arg.as_ptr() as *mut libc::c_char)
        .collect();
    argv.push(std::ptr::null_mut());

    let Ok(env_entry) = CString::new(HELPER_SAFE_MODE_ENV) else {
        warn!("could not build unrestrict helper environment");
        return false;
    };
    let mut envp: Vec<*mut libc::c_char> =
        vec![env_entry.as_ptr() as *mut libc::c_char, std::ptr::null_mut()];

    let mut helper_pid: libc::pid_t = 0;
    let rc = unsafe {
        original(
            &mut helper_pid,
            argv_storage[0].as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            argv.as_mut_ptr(),
            envp.as_mut_ptr(),
        )
    };
    if rc != 0 {
        warn!(
            "could not start unrestrict helper: {}",
            io::Error::from_raw_os_error(rc)
        );
        return false;
    }
    debug!(
        "unrestrict helper pid {}: target={} resume={} exec={}",
        helper_pid, handshake.pid, handshake.should_resume, handshake.is_replace_exec
    );

    // Reap synchronously: the target must not run unrestricted before the
    // lift is done, and the helper must not linger as a zombie.
    let mut status: libc::c_int = 0;
    if unsafe { libc::waitpid(helper_pid, &mut status, 0) } == -1 {
        warn!(
            "waitpid on unrestrict helper failed: {}",
            io::Error::last_os_error()
        );
    } else {
        debug!("unrestrict helper exited, status={status:#x}");
    }
    true
}
