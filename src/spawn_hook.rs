//! The spawn interception core.
//!
//! Every posix_spawn/posix_spawnp in the hooked process funnels through
//! [`plan_spawn`]: policy picks a dylib (or not), the environment is
//! rewritten, the target binary is inspected, and the unrestriction
//! obligation is scheduled. The FFI layer then executes the plan against
//! the real primitive. Every internal failure falls back to calling the
//! original with the caller's untouched arguments — a broken hook must
//! never stop the system from spawning processes.

use log::debug;

use crate::env_rewrite::{self, EnvRewrite};
use crate::policy::{self, InjectionDecision};
use crate::unrestrict::{self, SpawnMode, UnrestrictObligation};

/// A fully decided injection, ready to execute.
#[derive(Debug, PartialEq, Eq)]
pub struct InjectionPlan {
    /// Rewritten environment to spawn with.
    pub env: Vec<Vec<u8>>,
    /// Force POSIX_SPAWN_START_SUSPENDED onto the cloned attributes.
    pub force_suspend: bool,
    /// Unrestriction work owed around the primitive, if any.
    pub obligation: Option<UnrestrictObligation>,
}

/// Outcome of planning one intercepted spawn.
#[derive(Debug, PartialEq, Eq)]
pub enum SpawnPlan {
    /// Call the original primitive with the caller's arguments untouched.
    Passthrough,
    Inject(InjectionPlan),
}

/// Decide everything about one spawn before touching the primitive.
///
/// `library_readable` and `is_restricted` abstract the filesystem so the
/// composition is testable; the hook layer passes the real probes. The
/// inspector only runs for spawns that actually inject with safe mode off.
pub fn plan_spawn(
    target_path: &[u8],
    argv0: Option<&[u8]>,
    env: &[Vec<u8>],
    mode: SpawnMode,
    was_suspended: bool,
    caller_is_manager: bool,
    library_readable: impl Fn(&str) -> bool,
    is_restricted: impl Fn(&[u8]) -> bool,
) -> SpawnPlan {
    let library = match policy::decide(target_path, argv0, caller_is_manager, library_readable) {
        InjectionDecision::Inject { library } => library,
        InjectionDecision::Skip(reason) => {
            debug!("not injecting: {reason:?}");
            return SpawnPlan::Passthrough;
        }
    };

    let plan = match env_rewrite::rewrite(env, library.as_bytes()) {
        EnvRewrite::Plan(plan) => plan,
        EnvRewrite::Skip => {
            debug!("not injecting: unrecognized safe-mode value");
            return SpawnPlan::Passthrough;
        }
    };

    if plan.safe_mode {
        // Safe mode: spawn with companion libraries stripped but nothing
        // added, and leave restriction handling alone.
        return SpawnPlan::Inject(InjectionPlan {
            env: plan.env,
            force_suspend: false,
            obligation: None,
        });
    }

    let obligation = if is_restricted(target_path) {
        Some(unrestrict::obligation_for(mode, was_suspended))
    } else {
        None
    };

    SpawnPlan::Inject(InjectionPlan {
        env: plan.env,
        force_suspend: obligation.is_some(),
        obligation,
    })
}

/// Out-parameter slot for the child pid.
///
/// The post-spawn unrestriction helper needs the child pid even when the
/// caller passed a null out-pointer, which POSIX permits. The spawn always
/// writes into the local slot, and the caller's pointer is filled in after
/// the fact when present — a suspended child with no recorded pid would
/// have nothing scheduled to resume it.
#[cfg(any(target_os = "macos", test))]
struct PidSlot {
    local: libc::pid_t,
    caller: *mut libc::pid_t,
}

#[cfg(any(target_os = "macos", test))]
impl PidSlot {
    fn new(caller: *mut libc::pid_t) -> Self {
        Self { local: 0, caller }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::pid_t {
        &mut self.local
    }

    fn pid(&self) -> libc::pid_t {
        self.local
    }

    /// Copy the captured pid out to the caller, if they asked for it.
    ///
    /// # Safety
    /// The caller pointer, when non-null, must be valid for writes.
    unsafe fn propagate(&self) {
        if !self.caller.is_null() {
            unsafe {
                *self.caller = self.local;
            }
        }
    }
}

/// Render an argument vector for the spawn log; entries may not be UTF-8.
#[cfg(any(target_os = "macos", test))]
fn format_argv(args: &[Vec<u8>]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&String::from_utf8_lossy(arg));
    }
    out
}

#[cfg(target_os = "macos")]
mod ffi {
    use core::ffi::{c_char, c_int, c_short, c_void};
    use std::ffi::{CStr, CString};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use log::{debug, warn};

    use super::{PidSlot, SpawnPlan, format_argv, plan_spawn};
    use crate::unrestrict::{
        SpawnMode, UnrestrictHandshake, UnrestrictObligation, install_marker_fd, remove_marker_fd,
        run_helper,
    };
    use crate::{PosixSpawnFn, macho, policy};

    unsafe extern "C" {
        fn _NSGetEnviron() -> *mut *mut *mut c_char;
    }

    /// Clone of the caller's spawn attributes that we are free to mutate.
    ///
    /// posix_spawnattr_t is an opaque heap pointer on this platform; the
    /// only way to copy one wholesale is to duplicate its allocation.
    struct OwnedSpawnAttr {
        attr: libc::posix_spawnattr_t,
        copied: bool,
    }

    impl OwnedSpawnAttr {
        unsafe fn clone_from(attrp: *const libc::posix_spawnattr_t) -> Option<Self> {
            unsafe {
                if attrp.is_null() {
                    let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
                    if libc::posix_spawnattr_init(&mut attr) != 0 {
                        return None;
                    }
                    Some(Self { attr, copied: false })
                } else {
                    let src = *attrp;
                    let size = libc::malloc_size(src as *const c_void);
                    if size == 0 {
                        return None;
                    }
                    let copy = libc::malloc(size);
                    if copy.is_null() {
                        return None;
                    }
                    std::ptr::copy_nonoverlapping(src.cast::<u8>(), copy.cast::<u8>(), size);
                    Some(Self {
                        attr: copy as libc::posix_spawnattr_t,
                        copied: true,
                    })
                }
            }
        }

        fn set_flags(&mut self, flags: c_short) -> io::Result<()> {
            let rc = unsafe { libc::posix_spawnattr_setflags(&mut self.attr, flags) };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(())
        }

        fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
            &self.attr
        }
    }

    impl Drop for OwnedSpawnAttr {
        fn drop(&mut self) {
            unsafe {
                if self.copied {
                    libc::free(self.attr as *mut c_void);
                } else {
                    libc::posix_spawnattr_destroy(&mut self.attr);
                }
            }
        }
    }

    /// Copy a null-terminated string array (argv or envp) into owned bytes.
    unsafe fn collect_array(array: *const *mut c_char) -> Vec<Vec<u8>> {
        let mut entries = Vec::new();
        if array.is_null() {
            return entries;
        }
        let mut cursor = array;
        unsafe {
            while !(*cursor).is_null() {
                entries.push(CStr::from_ptr(*cursor).to_bytes().to_vec());
                cursor = cursor.add(1);
            }
        }
        entries
    }

    /// NUL-terminated environment array plus the storage backing it.
    struct EnvArray {
        _storage: Vec<CString>,
        pointers: Vec<*mut c_char>,
    }

    impl EnvArray {
        fn build(entries: Vec<Vec<u8>>) -> Option<Self> {
            let storage: Vec<CString> = entries
                .into_iter()
                .map(CString::new)
                .collect::<Result<_, _>>()
                .ok()?;
            let mut pointers: Vec<*mut c_char> = storage
                .iter()
                .map(|entry| entry.as_ptr() as *mut c_char)
                .collect();
            pointers.push(std::ptr::null_mut());
            Some(Self {
                _storage: storage,
                pointers,
            })
        }

        fn as_ptr(&self) -> *const *mut c_char {
            self.pointers.as_ptr()
        }
    }

    /// Shared implementation behind both hook entry points. `original` is
    /// the corresponding unhooked primitive.
    pub(super) unsafe fn spawn_generic(
        original: PosixSpawnFn,
        pidp: *mut libc::pid_t,
        path: *const c_char,
        file_actions: *const libc::posix_spawn_file_actions_t,
        attrp: *const libc::posix_spawnattr_t,
        argv: *const *mut c_char,
        envp: *const *mut c_char,
    ) -> c_int {
        unsafe {
            let passthrough =
                |original: PosixSpawnFn| original(pidp, path, file_actions, attrp, argv, envp);

            if path.is_null() {
                return passthrough(original);
            }

            let mut flags: c_short = 0;
            if !attrp.is_null() && libc::posix_spawnattr_getflags(attrp, &mut flags) != 0 {
                warn!("posix_spawnattr_getflags failed; spawning unmodified");
                return passthrough(original);
            }
            let mode = if flags as c_int & libc::POSIX_SPAWN_SETEXEC != 0 {
                SpawnMode::ReplaceImage
            } else {
                SpawnMode::CreateChild
            };
            let was_suspended = flags as c_int & libc::POSIX_SPAWN_START_SUSPENDED != 0;

            let path_bytes = CStr::from_ptr(path).to_bytes().to_vec();
            let args = collect_array(argv);
            // A null envp means "inherit ours".
            let effective_envp: *const *mut c_char = if envp.is_null() {
                *_NSGetEnviron() as *const *mut c_char
            } else {
                envp
            };
            let env = collect_array(effective_envp);

            debug!(
                "spawn: path={} argv=[{}] mode={:?} suspended={} manager={}",
                String::from_utf8_lossy(&path_bytes),
                format_argv(&args),
                mode,
                was_suspended,
                crate::caller_is_manager(),
            );

            let plan = plan_spawn(
                &path_bytes,
                args.first().map(Vec::as_slice),
                &env,
                mode,
                was_suspended,
                crate::caller_is_manager(),
                policy::library_installed,
                |target| macho::is_restricted(Path::new(std::ffi::OsStr::from_bytes(target))),
            );
            let plan = match plan {
                SpawnPlan::Passthrough => return passthrough(original),
                SpawnPlan::Inject(plan) => plan,
            };

            let Some(mut attr) = OwnedSpawnAttr::clone_from(attrp) else {
                warn!("could not clone spawn attributes; spawning unmodified");
                return passthrough(original);
            };
            if plan.force_suspend {
                let forced = (flags as c_int | libc::POSIX_SPAWN_START_SUSPENDED) as c_short;
                if let Err(e) = attr.set_flags(forced) {
                    warn!("could not force suspension: {e}; spawning unmodified");
                    return passthrough(original);
                }
            }

            let Some(env_array) = EnvArray::build(plan.env) else {
                warn!("could not rebuild environment; spawning unmodified");
                return passthrough(original);
            };

            let mut pending_resume = None;
            match plan.obligation {
                Some(UnrestrictObligation::BeforeExec { should_resume }) => {
                    // The helper needs to find us before the image is
                    // replaced; the marker descriptor identifies us.
                    if let Err(e) = install_marker_fd() {
                        warn!("marker descriptor setup failed: {e}; spawning unmodified");
                        return passthrough(original);
                    }
                    let handshake = UnrestrictHandshake {
                        pid: libc::getpid(),
                        should_resume,
                        is_replace_exec: true,
                    };
                    if !run_helper(&handshake, original) {
                        remove_marker_fd();
                        return passthrough(original);
                    }
                }
                Some(UnrestrictObligation::AfterSpawn { should_resume }) => {
                    pending_resume = Some(should_resume);
                }
                None => {}
            }

            let replace_exec = matches!(
                plan.obligation,
                Some(UnrestrictObligation::BeforeExec { .. })
            );
            let mut pid_slot = PidSlot::new(pidp);
            let ret = original(
                pid_slot.as_mut_ptr(),
                path,
                file_actions,
                attr.as_ptr(),
                argv,
                env_array.as_ptr(),
            );
            debug!("spawn returned {ret}");

            if replace_exec {
                // Reaching here means the exec did not happen; the marker
                // must not outlive this call.
                remove_marker_fd();
            }

            if ret == 0 {
                pid_slot.propagate();
                if let Some(should_resume) = pending_resume {
                    let handshake = UnrestrictHandshake {
                        pid: pid_slot.pid(),
                        should_resume,
                        is_replace_exec: false,
                    };
                    // Best effort: failure is logged inside, and the child
                    // stays suspended only if the caller asked.
                    run_helper(&handshake, original);
                }
            }
            ret
        }
    }

    /// Replacement for `posix_spawn`.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn hook_posix_spawn(
        pid: *mut libc::pid_t,
        path: *const c_char,
        file_actions: *const libc::posix_spawn_file_actions_t,
        attrp: *const libc::posix_spawnattr_t,
        argv: *const *mut c_char,
        envp: *const *mut c_char,
    ) -> c_int {
        match crate::original_posix_spawn() {
            Some(original) => unsafe {
                spawn_generic(original, pid, path, file_actions, attrp, argv, envp)
            },
            None => libc::ENOSYS,
        }
    }

    /// Replacement for `posix_spawnp` (PATH-searching variant).
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn hook_posix_spawnp(
        pid: *mut libc::pid_t,
        path: *const c_char,
        file_actions: *const libc::posix_spawn_file_actions_t,
        attrp: *const libc::posix_spawnattr_t,
        argv: *const *mut c_char,
        envp: *const *mut c_char,
    ) -> c_int {
        match crate::original_posix_spawnp() {
            Some(original) => unsafe {
                spawn_generic(original, pid, path, file_actions, attrp, argv, envp)
            },
            None => libc::ENOSYS,
        }
    }
}

#[cfg(target_os = "macos")]
pub use ffi::{hook_posix_spawn, hook_posix_spawnp};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::{BUNDLE_LOADER_DYLIB, POSIXSPAWN_HOOK_DYLIB, SUBSTITUTED_PATH, XPCPROXY_PATH};

    fn env(entries: &[&str]) -> Vec<Vec<u8>> {
        entries.iter().map(|e| e.as_bytes().to_vec()).collect()
    }

    fn installed(_: &str) -> bool {
        true
    }

    fn never_restricted(_: &[u8]) -> bool {
        false
    }

    fn insert_entry(plan_env: &[Vec<u8>]) -> Option<String> {
        plan_env
            .iter()
            .find(|e| e.starts_with(b"DYLD_INSERT_LIBRARIES="))
            .map(|e| String::from_utf8(e.clone()).unwrap())
    }

    #[test]
    fn policy_skip_is_a_passthrough() {
        let plan = plan_spawn(
            SUBSTITUTED_PATH.as_bytes(),
            None,
            &env(&["HOME=/var/root"]),
            SpawnMode::CreateChild,
            false,
            false,
            installed,
            never_restricted,
        );
        assert_eq!(plan, SpawnPlan::Passthrough);
    }

    #[test]
    fn ordinary_spawn_injects_bundle_loader() {
        let plan = plan_spawn(
            b"/bin/ls",
            Some(b"ls"),
            &env(&["HOME=/var/root"]),
            SpawnMode::CreateChild,
            false,
            false,
            installed,
            never_restricted,
        );
        let SpawnPlan::Inject(plan) = plan else {
            panic!("expected injection");
        };
        assert!(!plan.force_suspend);
        assert_eq!(plan.obligation, None);
        assert_eq!(
            insert_entry(&plan.env).unwrap(),
            format!("DYLD_INSERT_LIBRARIES={BUNDLE_LOADER_DYLIB}")
        );
    }

    #[test]
    fn manager_relay_spawn_injects_self_hook() {
        let plan = plan_spawn(
            XPCPROXY_PATH.as_bytes(),
            Some(b"xpcproxy"),
            &[],
            SpawnMode::CreateChild,
            false,
            true,
            installed,
            never_restricted,
        );
        let SpawnPlan::Inject(plan) = plan else {
            panic!("expected injection");
        };
        assert_eq!(
            insert_entry(&plan.env).unwrap(),
            format!("DYLD_INSERT_LIBRARIES={POSIXSPAWN_HOOK_DYLIB}")
        );
    }

    #[test]
    fn invalid_safe_mode_value_passes_through() {
        let plan = plan_spawn(
            b"/bin/ls",
            Some(b"ls"),
            &env(&["_MSSafeMode=maybe"]),
            SpawnMode::CreateChild,
            false,
            false,
            installed,
            never_restricted,
        );
        assert_eq!(plan, SpawnPlan::Passthrough);
    }

    #[test]
    fn safe_mode_injects_stripped_env_without_restriction_handling() {
        let plan = plan_spawn(
            b"/bin/ls",
            Some(b"ls"),
            &env(&[
                "_MSSafeMode=1",
                &format!("DYLD_INSERT_LIBRARIES={BUNDLE_LOADER_DYLIB}:/usr/lib/x.dylib"),
            ]),
            SpawnMode::CreateChild,
            false,
            false,
            installed,
            // The inspector must not run at all in safe mode.
            |_| panic!("inspector consulted in safe mode"),
        );
        let SpawnPlan::Inject(plan) = plan else {
            panic!("expected injection");
        };
        assert!(!plan.force_suspend);
        assert_eq!(plan.obligation, None);
        assert_eq!(
            insert_entry(&plan.env).unwrap(),
            "DYLD_INSERT_LIBRARIES=/usr/lib/x.dylib"
        );
    }

    #[test]
    fn inspector_not_consulted_when_policy_skips() {
        let plan = plan_spawn(
            SUBSTITUTED_PATH.as_bytes(),
            None,
            &[],
            SpawnMode::CreateChild,
            false,
            false,
            installed,
            |_| panic!("inspector consulted for a skipped spawn"),
        );
        assert_eq!(plan, SpawnPlan::Passthrough);
    }

    #[test]
    fn restricted_child_spawn_owes_post_spawn_helper() {
        let plan = plan_spawn(
            b"/usr/bin/restricted-tool",
            None,
            &[],
            SpawnMode::CreateChild,
            false,
            false,
            installed,
            |_| true,
        );
        let SpawnPlan::Inject(plan) = plan else {
            panic!("expected injection");
        };
        assert!(plan.force_suspend);
        assert_eq!(
            plan.obligation,
            Some(crate::unrestrict::UnrestrictObligation::AfterSpawn {
                should_resume: true
            })
        );
    }

    #[test]
    fn restricted_replace_exec_owes_pre_spawn_helper() {
        let plan = plan_spawn(
            b"/usr/bin/restricted-tool",
            None,
            &[],
            SpawnMode::ReplaceImage,
            true,
            false,
            installed,
            |_| true,
        );
        let SpawnPlan::Inject(plan) = plan else {
            panic!("expected injection");
        };
        assert!(plan.force_suspend);
        assert_eq!(
            plan.obligation,
            Some(crate::unrestrict::UnrestrictObligation::BeforeExec {
                should_resume: false
            })
        );
    }

    #[test]
    fn pid_slot_captures_pid_without_a_caller_out_param() {
        // A null pid out-parameter is valid for fire-and-forget spawns; the
        // unrestriction helper still needs the child pid.
        let mut slot = PidSlot::new(std::ptr::null_mut());
        unsafe {
            *slot.as_mut_ptr() = 4321;
        }
        assert_eq!(slot.pid(), 4321);
        // Propagation with no caller pointer is a no-op, not a crash.
        unsafe { slot.propagate() };
    }

    #[test]
    fn pid_slot_propagates_to_the_caller_out_param() {
        let mut caller: libc::pid_t = 0;
        let mut slot = PidSlot::new(&mut caller);
        unsafe {
            *slot.as_mut_ptr() = 1234;
        }
        unsafe { slot.propagate() };
        assert_eq!(caller, 1234);
        assert_eq!(slot.pid(), 1234);
    }

    #[test]
    fn argv_rendering_joins_arguments_and_tolerates_non_utf8() {
        assert_eq!(
            format_argv(&[b"ls".to_vec(), b"-la".to_vec(), b"/tmp".to_vec()]),
            "ls -la /tmp"
        );
        assert_eq!(format_argv(&[]), "");
        let rendered = format_argv(&[vec![0xff, 0xfe]]);
        assert!(!rendered.is_empty());
    }

    #[test]
    fn missing_library_passes_through() {
        let plan = plan_spawn(
            b"/bin/ls",
            Some(b"ls"),
            &[],
            SpawnMode::CreateChild,
            false,
            false,
            |_| false,
            never_restricted,
        );
        assert_eq!(plan, SpawnPlan::Passthrough);
    }
}
