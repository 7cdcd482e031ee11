//! Per-spawn injection policy.
//!
//! Pure decision logic: given the target path, argv[0], and whether the
//! calling process is launchd itself, pick the dylib to insert or a reason
//! to leave the spawn alone. The target binary is never opened here; the
//! restriction inspector runs later, and only for spawns that inject.

use crate::paths::{
    BUNDLE_LOADER_DYLIB, NOTIFYD_PATH, POSIXSPAWN_HOOK_DYLIB, SSHD_BASENAME, SUBSTITUTED_PATH,
    XPCPROXY_PATH,
};

/// Why a spawn is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// launchd spawning anything other than xpcproxy. The bundle loader
    /// synchronously contacts substituted, so it must not be loaded into
    /// jobs launchd runs before services are up; only the relay gets the
    /// self-hook, and jobs are instrumented from inside it.
    ManagerForeignTarget,
    /// A non-manager process spawning xpcproxy; the relay is instrumented
    /// only via launchd's own spawn of it.
    RelayFromNonManager,
    /// The trust broker itself. Instrumenting it would have the bundle
    /// loader contact the broker from inside the broker.
    BrokerTarget,
    /// notifyd is contacted synchronously by libc during early boot.
    NotifydTarget,
    /// sshd closes descriptors by number and crashes on guarded ones
    /// opened by the bundle loader's dependencies.
    LoginDaemon,
    /// The chosen dylib is not readable on disk — Substitute was
    /// uninstalled or never fully installed. Not an error.
    LibraryNotInstalled,
}

/// Outcome of the policy check for one spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionDecision {
    Inject { library: &'static str },
    Skip(SkipReason),
}

fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Decide whether and what to inject into the spawn of `target_path`.
///
/// `library_readable` abstracts the on-disk presence probe so the rules
/// stay testable; the hook passes [`library_installed`].
pub fn decide(
    target_path: &[u8],
    argv0: Option<&[u8]>,
    caller_is_manager: bool,
    library_readable: impl Fn(&str) -> bool,
) -> InjectionDecision {
    let library = if caller_is_manager {
        if target_path != XPCPROXY_PATH.as_bytes() {
            return InjectionDecision::Skip(SkipReason::ManagerForeignTarget);
        }
        POSIXSPAWN_HOOK_DYLIB
    } else {
        if target_path == XPCPROXY_PATH.as_bytes() {
            return InjectionDecision::Skip(SkipReason::RelayFromNonManager);
        }
        if target_path == SUBSTITUTED_PATH.as_bytes() {
            return InjectionDecision::Skip(SkipReason::BrokerTarget);
        }
        if target_path == NOTIFYD_PATH.as_bytes() {
            return InjectionDecision::Skip(SkipReason::NotifydTarget);
        }
        if basename(argv0.unwrap_or(b"")) == SSHD_BASENAME {
            return InjectionDecision::Skip(SkipReason::LoginDaemon);
        }
        BUNDLE_LOADER_DYLIB
    };

    if !library_readable(library) {
        return InjectionDecision::Skip(SkipReason::LibraryNotInstalled);
    }

    InjectionDecision::Inject { library }
}

/// Probe used on the hot path: is the dylib present and readable?
pub fn library_installed(path: &str) -> bool {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        let Ok(c_path) = CString::new(path) else {
            return false;
        };
        // access(R_OK) rather than a metadata lookup: the spawn may run as
        // a different uid than the installer.
        unsafe { libc::access(c_path.as_ptr(), libc::R_OK) == 0 }
    }
    #[cfg(not(unix))]
    {
        std::path::Path::new(path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(_: &str) -> bool {
        true
    }

    #[test]
    fn manager_spawning_relay_gets_self_hook() {
        let d = decide(XPCPROXY_PATH.as_bytes(), None, true, installed);
        assert_eq!(
            d,
            InjectionDecision::Inject {
                library: POSIXSPAWN_HOOK_DYLIB
            }
        );
    }

    #[test]
    fn manager_spawning_anything_else_is_skipped() {
        let d = decide(b"/usr/sbin/syslogd", Some(b"syslogd"), true, installed);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::ManagerForeignTarget));
    }

    #[test]
    fn non_manager_spawning_relay_is_skipped() {
        let d = decide(XPCPROXY_PATH.as_bytes(), None, false, installed);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::RelayFromNonManager));
    }

    #[test]
    fn ordinary_target_gets_bundle_loader() {
        let d = decide(b"/bin/ls", Some(b"ls"), false, installed);
        assert_eq!(
            d,
            InjectionDecision::Inject {
                library: BUNDLE_LOADER_DYLIB
            }
        );
    }

    #[test]
    fn broker_is_never_instrumented() {
        let d = decide(SUBSTITUTED_PATH.as_bytes(), None, false, installed);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::BrokerTarget));
    }

    #[test]
    fn notifyd_is_skipped() {
        let d = decide(NOTIFYD_PATH.as_bytes(), Some(b"notifyd"), false, installed);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::NotifydTarget));
    }

    #[test]
    fn sshd_is_matched_by_argv0_basename() {
        // sshd is started through a wrapper, so path and argv[0] differ.
        let d = decide(b"/usr/libexec/wrapper", Some(b"/usr/sbin/sshd"), false, installed);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::LoginDaemon));

        let d = decide(b"/usr/libexec/wrapper", Some(b"sshd"), false, installed);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::LoginDaemon));
    }

    #[test]
    fn sshd_named_binary_with_other_argv0_is_injected() {
        let d = decide(b"/usr/local/bin/tool", Some(b"sshd-helper"), false, installed);
        assert!(matches!(d, InjectionDecision::Inject { .. }));
    }

    #[test]
    fn missing_argv0_is_tolerated() {
        let d = decide(b"/bin/ls", None, false, installed);
        assert!(matches!(d, InjectionDecision::Inject { .. }));
    }

    #[test]
    fn missing_library_downgrades_to_skip() {
        let d = decide(b"/bin/ls", Some(b"ls"), false, |_| false);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::LibraryNotInstalled));
    }

    #[test]
    fn missing_self_hook_skips_relay_injection() {
        let d = decide(XPCPROXY_PATH.as_bytes(), None, true, |_| false);
        assert_eq!(d, InjectionDecision::Skip(SkipReason::LibraryNotInstalled));
    }
}
