//! Fixed paths, environment variable names, and wire constants.
//!
//! These must match the other Substitute components byte for byte: the
//! bundle loader strips exactly these dylib paths back out of inherited
//! environments, and the unrestrict helper lives at exactly this path on
//! every supported system.

/// Instrumentation payload loaded into ordinary target processes.
pub const BUNDLE_LOADER_DYLIB: &str = "/Library/Substitute/Helpers/bundle-loader.dylib";

/// This library itself, injected into xpcproxy so the hook re-establishes
/// itself inside the relay before it execs the real job.
pub const POSIXSPAWN_HOOK_DYLIB: &str = "/Library/Substitute/Helpers/posixspawn-hook.dylib";

/// Privileged helper that lifts the kernel's injection restriction on a pid.
pub const UNRESTRICT_HELPER: &str = "/Library/Substitute/Helpers/unrestrict";

/// The relay launchd uses to exec its jobs.
pub const XPCPROXY_PATH: &str = "/usr/libexec/xpcproxy";

/// The Substitute trust broker. Must never be instrumented itself.
pub const SUBSTITUTED_PATH: &str = "/Library/Substitute/Helpers/substituted";

/// notifyd is contacted synchronously by libc routines launchd may call
/// before jobs are up; loading the bundle loader into it deadlocks boot.
pub const NOTIFYD_PATH: &str = "/usr/sbin/notifyd";

/// sshd closes "excess" file descriptors by number, which crashes the
/// process when it hits descriptors opened with guarded_open_np by the
/// bundle loader's dispatch dependency. Matched by argv[0] basename since
/// sshd is started through a wrapper with argv[0] != path.
pub const SSHD_BASENAME: &[u8] = b"sshd";

/// Mach service name the sandbox override always allows looking up.
pub const SUBSTITUTED_SERVICE: &str = "com.ex.substituted";

/// Sandbox operation that resolves a named service endpoint.
pub const MACH_LOOKUP_OPERATION: &str = "mach-lookup";

/// The OS variable listing libraries dyld inserts into a new process.
pub const DYLD_INSERT_LIBRARIES: &[u8] = b"DYLD_INSERT_LIBRARIES";

/// Safe-mode switches. `_MSSafeMode` is the Substrate-compatible spelling;
/// both are honored and either one disables injection for the spawn.
pub const SAFE_MODE_VARS: [&[u8]; 2] = [b"_MSSafeMode", b"_SubstituteSafeMode"];
