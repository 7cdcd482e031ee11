//! Binary restriction inspection.
//!
//! The kernel refuses injection into binaries carrying a `__restrict`
//! section until the restriction is lifted. Before spawning, we look at the
//! target image on disk and decide whether the unrestrict helper has to
//! run. The check is deliberately coarse: the raw load-command bytes are
//! substring-searched for the section name rather than parsed per command.
//! A false positive only triggers a redundant unrestrict run, so the
//! overestimate is acceptable; do not tighten it without a corpus of real
//! binaries showing it matters.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, warn};
use thiserror::Error;

const FAT_MAGIC: u32 = 0xcafe_babe;
const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;

/// Section name marker, including the NUL that terminates it inside the
/// 16-byte sectname field. Matching the NUL avoids hitting names that
/// merely start with "__restrict".
const RESTRICT_MARKER: &[u8] = b"__restrict\0";

/// Fixed probe large enough for any of the three leading layouts: a bare
/// magic, fat_header (8) + first fat_arch (20), or mach_header (28).
const HEADER_PROBE_LEN: usize = 28;

/// Byte offset of the fat_arch `offset` field within the probe
/// (fat_header is 8 bytes, cputype and cpusubtype are 4 each).
const FAT_ARCH_OFFSET_FIELD: usize = 16;

/// Byte offset of `sizeofcmds` within mach_header (magic, cputype,
/// cpusubtype, filetype, ncmds precede it).
const SIZEOFCMDS_FIELD: usize = 20;

const MACH_HEADER_LEN: u64 = 28;
const MACH_HEADER_64_LEN: u64 = 32;

#[derive(Debug, Error)]
enum InspectError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("truncated header")]
    TruncatedHeader,
    #[error("truncated load commands ({got} of {want} bytes)")]
    TruncatedCommands { want: u32, got: usize },
    #[error("unrecognized mach-o magic {0:#010x}")]
    BadMagic(u32),
}

fn read_u32_be(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u32_ne(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_probe(file: &mut File, offset: u64) -> Result<[u8; HEADER_PROBE_LEN], InspectError> {
    let mut probe = [0u8; HEADER_PROBE_LEN];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut probe)
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => InspectError::TruncatedHeader,
            _ => InspectError::Io(e),
        })?;
    Ok(probe)
}

/// Does the binary at `path` carry the `__restrict` marker?
///
/// Never fails the caller: any open, read, or parse problem is logged and
/// reported as "not restricted" so the spawn can proceed. Fat binaries are
/// judged by their first architecture only; the kernel applies the same
/// simplification, and all slices of a shipped fat binary share their
/// restriction status in practice.
pub fn is_restricted(path: &Path) -> bool {
    match inspect(path) {
        Ok(restricted) => {
            debug!("{}: restricted={}", path.display(), restricted);
            restricted
        }
        Err(e) => {
            warn!("could not inspect {}: {}", path.display(), e);
            false
        }
    }
}

fn inspect(path: &Path) -> Result<bool, InspectError> {
    let mut file = File::open(path)?;

    let mut probe = read_probe(&mut file, 0)?;
    let mut arch_offset = 0u64;

    // Fat container: descend into the first architecture.
    if read_u32_be(&probe, 0) == FAT_MAGIC {
        let nfat_arch = read_u32_be(&probe, 4);
        if nfat_arch == 0 {
            return Ok(false);
        }
        arch_offset = u64::from(read_u32_be(&probe, FAT_ARCH_OFFSET_FIELD));
        probe = read_probe(&mut file, arch_offset)?;
    }

    let magic = read_u32_ne(&probe, 0);
    let (swapped, is64) = match magic {
        MH_MAGIC => (false, false),
        MH_MAGIC_64 => (false, true),
        MH_CIGAM => (true, false),
        MH_CIGAM_64 => (true, true),
        other => return Err(InspectError::BadMagic(other)),
    };

    let mut sizeofcmds = read_u32_ne(&probe, SIZEOFCMDS_FIELD);
    if swapped {
        sizeofcmds = sizeofcmds.swap_bytes();
    }

    let cmds_offset = arch_offset
        + if is64 {
            MACH_HEADER_64_LEN
        } else {
            MACH_HEADER_LEN
        };

    file.seek(SeekFrom::Start(cmds_offset))?;
    let mut cmds = Vec::new();
    file.take(u64::from(sizeofcmds)).read_to_end(&mut cmds)?;
    if cmds.len() != sizeofcmds as usize {
        return Err(InspectError::TruncatedCommands {
            want: sizeofcmds,
            got: cmds.len(),
        });
    }

    Ok(cmds
        .windows(RESTRICT_MARKER.len())
        .any(|window| window == RESTRICT_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Build a minimal thin Mach-O image: header plus a load-command region
    /// containing `cmds` as raw bytes.
    fn thin_image(magic: u32, is64: bool, cmds: &[u8]) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(&magic.to_ne_bytes());
        image.extend_from_slice(&0x0100_000cu32.to_ne_bytes()); // cputype
        image.extend_from_slice(&0u32.to_ne_bytes()); // cpusubtype
        image.extend_from_slice(&2u32.to_ne_bytes()); // filetype MH_EXECUTE
        image.extend_from_slice(&1u32.to_ne_bytes()); // ncmds
        image.extend_from_slice(&(cmds.len() as u32).to_ne_bytes());
        image.extend_from_slice(&0u32.to_ne_bytes()); // flags
        if is64 {
            image.extend_from_slice(&0u32.to_ne_bytes()); // reserved
        }
        image.extend_from_slice(cmds);
        image
    }

    /// Wrap `slice` as the first architecture of a fat container at a
    /// fixed offset, with `nfat_arch` total descriptors reported.
    fn fat_image(slice: &[u8], nfat_arch: u32) -> Vec<u8> {
        let slice_offset = 4096u32;
        let mut image = Vec::new();
        image.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        image.extend_from_slice(&nfat_arch.to_be_bytes());
        // First fat_arch descriptor.
        image.extend_from_slice(&0x0100_000cu32.to_be_bytes()); // cputype
        image.extend_from_slice(&0u32.to_be_bytes()); // cpusubtype
        image.extend_from_slice(&slice_offset.to_be_bytes());
        image.extend_from_slice(&(slice.len() as u32).to_be_bytes());
        image.extend_from_slice(&12u32.to_be_bytes()); // align
        image.resize(slice_offset as usize, 0);
        image.extend_from_slice(slice);
        image
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn restricted_cmds() -> Vec<u8> {
        let mut cmds = vec![0u8; 64];
        cmds[20..20 + RESTRICT_MARKER.len()].copy_from_slice(RESTRICT_MARKER);
        cmds
    }

    #[test]
    fn thin_binary_with_marker_is_restricted() {
        let f = write_temp(&thin_image(MH_MAGIC_64, true, &restricted_cmds()));
        assert!(is_restricted(f.path()));
    }

    #[test]
    fn thin_binary_without_marker_is_not_restricted() {
        let f = write_temp(&thin_image(MH_MAGIC_64, true, &vec![0u8; 64]));
        assert!(!is_restricted(f.path()));
    }

    #[test]
    fn thirty_two_bit_binary_with_marker_is_restricted() {
        let f = write_temp(&thin_image(MH_MAGIC, false, &restricted_cmds()));
        assert!(is_restricted(f.path()));
    }

    #[test]
    fn marker_without_nul_terminator_does_not_match() {
        let mut cmds = vec![1u8; 64];
        cmds[20..30].copy_from_slice(b"__restrict");
        let f = write_temp(&thin_image(MH_MAGIC_64, true, &cmds));
        assert!(!is_restricted(f.path()));
    }

    #[test]
    fn fat_binary_with_restricted_first_arch_is_restricted() {
        let slice = thin_image(MH_MAGIC_64, true, &restricted_cmds());
        let f = write_temp(&fat_image(&slice, 2));
        assert!(is_restricted(f.path()));
    }

    #[test]
    fn fat_binary_with_unrestricted_first_arch_is_not_restricted() {
        let slice = thin_image(MH_MAGIC_64, true, &vec![0u8; 64]);
        let f = write_temp(&fat_image(&slice, 1));
        assert!(!is_restricted(f.path()));
    }

    #[test]
    fn fat_binary_with_zero_arches_is_not_restricted() {
        let slice = thin_image(MH_MAGIC_64, true, &restricted_cmds());
        let f = write_temp(&fat_image(&slice, 0));
        assert!(!is_restricted(f.path()));
    }

    #[test]
    fn byte_swapped_header_is_parsed() {
        // Build the image as if produced on an opposite-endian host: every
        // header field byte-swapped relative to ours.
        let cmds = restricted_cmds();
        let mut image = Vec::new();
        for field in [
            MH_MAGIC_64.swap_bytes(),
            0x0100_000cu32.swap_bytes(),
            0,
            2u32.swap_bytes(),
            1u32.swap_bytes(),
            (cmds.len() as u32).swap_bytes(),
            0,
            0, // reserved
        ] {
            image.extend_from_slice(&field.to_ne_bytes());
        }
        image.extend_from_slice(&cmds);
        let f = write_temp(&image);
        assert!(is_restricted(f.path()));
    }

    #[test]
    fn garbage_magic_is_not_restricted() {
        let f = write_temp(b"#!/bin/sh\nexit 0\n");
        assert!(!is_restricted(f.path()));
    }

    #[test]
    fn truncated_header_is_not_restricted() {
        let f = write_temp(&MH_MAGIC_64.to_ne_bytes());
        assert!(!is_restricted(f.path()));
    }

    #[test]
    fn truncated_load_commands_are_not_restricted() {
        let mut image = thin_image(MH_MAGIC_64, true, &restricted_cmds());
        image.truncate(image.len() - 32);
        let f = write_temp(&image);
        assert!(!is_restricted(f.path()));
    }

    #[test]
    fn missing_file_is_not_restricted() {
        assert!(!is_restricted(Path::new("/nonexistent/definitely-not-here")));
    }
}
