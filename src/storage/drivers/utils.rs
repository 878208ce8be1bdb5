// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Filesystem helpers shared by the in-tree drivers.

use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::Path,
};

use itertools::Itertools;

use crate::vessel::{VesselError, VesselResult};

/// Marker file a driver writes into a block-backed volume mount to record
/// the filesystem it was formatted with. Recovery probes read it back.
pub const FS_MARKER: &str = ".vessel_fs";

/// Name of the root disk file of a block-content volume.
pub const ROOT_DISK_FILE: &str = "root.img";

/// Name of the payload file of an ISO-content volume.
pub const ROOT_ISO_FILE: &str = "root.iso";

/// Read back the filesystem a block-backed volume was formatted with, as
/// recorded in its marker file. Recovery probes use this in place of a
/// real filesystem detection. Defaults to ext4 when no marker is present.
pub fn probe_filesystem(mount_path: &Path) -> VesselResult<String> {
    match fs::read_to_string(mount_path.join(FS_MARKER)) {
        Ok(fs_name) => Ok(fs_name.trim().to_string()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok("ext4".to_string()),
        Err(err) => Err(err.into()),
    }
}

/// Create a directory (and parents) if missing, applying the mode to the
/// leaf.
pub fn ensure_dir(path: &Path, mode: u32) -> VesselResult<()> {
    if path.is_dir() {
        return Ok(());
    }

    fs::create_dir_all(path).map_err(|err| {
        VesselError::wrap(
            format!("Failed to create directory {}", path.display()),
            err.into(),
        )
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Remove a directory tree, tolerating its absence.
pub fn remove_tree(path: &Path) -> VesselResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(VesselError::wrap(
            format!("Failed to remove directory {}", path.display()),
            err.into(),
        )),
    }
}

/// Recursively copy a directory tree: directories, regular files and
/// symlinks, preserving modes.
pub fn copy_tree(src: &Path, dst: &Path) -> VesselResult<()> {
    let meta = fs::symlink_metadata(src)?;
    ensure_dir(dst, meta.permissions().mode() & 0o7777)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || fs::symlink_metadata(&dst_path).is_ok() {
                fs::remove_file(&dst_path)?;
            }
            symlink(&target, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

/// Total bytes of regular file content under a path.
pub fn dir_size(path: &Path) -> VesselResult<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Sorted names of the entries directly under a path; empty when the path
/// is missing.
pub fn list_dir_names(path: &Path) -> VesselResult<Vec<String>> {
    if !path.is_dir() {
        return Ok(Vec::new());
    }

    Ok(fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .sorted()
        .collect())
}

/// Parse a human byte size: plain bytes, SI suffixes (kB, MB, GB, TB, PB)
/// or binary suffixes (KiB, MiB, GiB, TiB, PiB). An empty string is zero.
pub fn parse_byte_size(value: &str) -> VesselResult<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let number: u64 = digits
        .parse()
        .map_err(|_| VesselError::Msg(format!("Invalid byte size {value:?}")))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" => 1000,
        "MB" => 1000_u64.pow(2),
        "GB" => 1000_u64.pow(3),
        "TB" => 1000_u64.pow(4),
        "PB" => 1000_u64.pow(5),
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        "PiB" => 1 << 50,
        _ => {
            return Err(VesselError::Msg(format!(
                "Invalid byte size suffix in {value:?}"
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| VesselError::Msg(format!("Byte size {value:?} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Byte sizes parse with and without suffixes.
    fn byte_sizes() {
        assert_eq!(parse_byte_size("").unwrap(), 0);
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert_eq!(parse_byte_size("10GiB").unwrap(), 10 * (1 << 30));
        assert_eq!(parse_byte_size("10GB").unwrap(), 10_000_000_000);
        assert_matches!(parse_byte_size("10XB"), Err(VesselError::Msg(_)));
        assert_matches!(parse_byte_size("GiB"), Err(VesselError::Msg(_)));
    }

    mod prop {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            /// Any whole number with a binary suffix parses to the exact
            /// multiple, and larger suffixes never parse smaller.
            fn binary_suffixes_scale(n in 0u64..4096) {
                let kib = parse_byte_size(&format!("{n}KiB")).unwrap();
                let mib = parse_byte_size(&format!("{n}MiB")).unwrap();
                let gib = parse_byte_size(&format!("{n}GiB")).unwrap();
                prop_assert_eq!(kib, n << 10);
                prop_assert_eq!(mib, n << 20);
                prop_assert_eq!(gib, n << 30);
                prop_assert!(kib <= mib && mib <= gib);
            }

            #[test]
            /// Arbitrary non-numeric noise never parses.
            fn garbage_is_rejected(s in "[a-zA-Z!@#]{1,8}") {
                prop_assert!(parse_byte_size(&s).is_err());
            }
        }
    }

    #[test]
    /// Copying a tree reproduces files, directories and symlinks.
    fn tree_copy() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let dst_root = dst.path().join("copy");

        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/file"), b"payload").unwrap();
        symlink("sub/file", src.path().join("link")).unwrap();

        copy_tree(src.path(), &dst_root).unwrap();

        assert_eq!(fs::read(dst_root.join("sub/file")).unwrap(), b"payload");
        assert_eq!(
            fs::read_link(dst_root.join("link")).unwrap(),
            Path::new("sub/file")
        );
        assert_eq!(dir_size(&dst_root).unwrap(), 7);
    }
}
