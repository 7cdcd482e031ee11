//! Environment rewriting for library injection.
//!
//! Takes the spawn's effective environment and produces a new one with
//! `DYLD_INSERT_LIBRARIES` normalized: every occurrence removed, companion
//! dylib paths stripped from the inherited value (so the list does not grow
//! across chained execs), and at most one rebuilt instance re-appended.
//! Environments are byte vectors, not strings — entries are passed through
//! verbatim and may not be UTF-8.

use crate::paths::{BUNDLE_LOADER_DYLIB, DYLD_INSERT_LIBRARIES, POSIXSPAWN_HOOK_DYLIB, SAFE_MODE_VARS};

/// Outcome of scanning the environment.
#[derive(Debug, PartialEq, Eq)]
pub enum EnvRewrite {
    /// A safe-mode variable held an unrecognized value. Conservative
    /// fail-safe: skip injection entirely, pass the caller's environment
    /// through untouched.
    Skip,
    /// Injection may proceed with the rebuilt environment.
    Plan(EnvPlan),
}

/// A rebuilt environment plus the safe-mode verdict that shaped it.
#[derive(Debug, PartialEq, Eq)]
pub struct EnvPlan {
    /// Safe mode strips companion libraries without adding ours; the core
    /// also skips restriction handling when this is set.
    pub safe_mode: bool,
    /// Every original entry except `DYLD_INSERT_LIBRARIES`, in original
    /// order, plus at most one rebuilt instance appended at the end.
    pub env: Vec<Vec<u8>>,
}

/// If `entry` is `name=value`, return the value.
fn value_of<'a>(entry: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if entry.len() > name.len() && entry.starts_with(name) && entry[name.len()] == b'=' {
        Some(&entry[name.len() + 1..])
    } else {
        None
    }
}

fn safe_mode_value(entry: &[u8]) -> Option<&[u8]> {
    SAFE_MODE_VARS.iter().find_map(|name| value_of(entry, name))
}

fn is_companion(path: &[u8]) -> bool {
    path == BUNDLE_LOADER_DYLIB.as_bytes() || path == POSIXSPAWN_HOOK_DYLIB.as_bytes()
}

/// Rebuild the colon-separated insert list: inherited entries minus our own
/// dylibs, then `library` appended unless safe mode is on. Separator
/// handling mirrors dyld's tolerance for empty interior segments.
fn merge_insert_list(inherited: &[u8], library: &[u8], safe_mode: bool) -> Vec<u8> {
    let mut merged = Vec::new();
    if !inherited.is_empty() {
        let mut segments: Vec<&[u8]> = inherited.split(|&b| b == b':').collect();
        // A trailing ':' produces a phantom final segment; drop it.
        if inherited.ends_with(b":") {
            segments.pop();
        }
        for segment in segments {
            if is_companion(segment) {
                continue;
            }
            if !merged.is_empty() {
                merged.push(b':');
            }
            merged.extend_from_slice(segment);
        }
    }
    if !safe_mode {
        if !merged.is_empty() {
            merged.push(b':');
        }
        merged.extend_from_slice(library);
    }
    merged
}

/// Scan `env` once and produce the rewritten environment for injecting
/// `library`. Idempotent: rewriting an already-rewritten environment with
/// the same library yields the same insert list.
pub fn rewrite(env: &[Vec<u8>], library: &[u8]) -> EnvRewrite {
    let mut safe_mode = false;
    let mut inherited: Option<&[u8]> = None;

    for entry in env {
        if let Some(value) = safe_mode_value(entry) {
            // An empty value is unrecognized too: skip rather than guess.
            match value {
                b"0" | b"NO" => safe_mode = false,
                b"1" | b"YES" => safe_mode = true,
                _ => return EnvRewrite::Skip,
            }
        } else if let Some(value) = value_of(entry, DYLD_INSERT_LIBRARIES) {
            // First occurrence wins for the value; duplicates are still
            // stripped from the output below.
            if inherited.is_none() {
                inherited = Some(value);
            }
        }
    }

    let merged = merge_insert_list(inherited.unwrap_or(b""), library, safe_mode);

    let mut rebuilt: Vec<Vec<u8>> = env
        .iter()
        .filter(|entry| value_of(entry, DYLD_INSERT_LIBRARIES).is_none())
        .cloned()
        .collect();
    if !merged.is_empty() {
        let mut entry = Vec::with_capacity(DYLD_INSERT_LIBRARIES.len() + 1 + merged.len());
        entry.extend_from_slice(DYLD_INSERT_LIBRARIES);
        entry.push(b'=');
        entry.extend_from_slice(&merged);
        rebuilt.push(entry);
    }

    EnvRewrite::Plan(EnvPlan {
        safe_mode,
        env: rebuilt,
    })
}
