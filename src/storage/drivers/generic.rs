// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Driver-agnostic volume mechanics over plain directory trees.
//!
//! Both in-tree drivers store a volume as a directory at its mount path.
//! Filesystem content lives directly in the directory; block and ISO
//! content live in a `root.img` file inside it (a VM's config filesystem
//! shares the directory with its `root.img`). Snapshots are directories
//! under the type's snapshot tree. The generic migration, backup and copy
//! paths all move these trees with the shared tree-stream codec.

use std::{
    fs,
    io::{Read, Write},
    path::PathBuf,
    time::SystemTime,
};

use crate::{
    storage::{
        drivers::{
            stream, utils, ContentType, Volume, VolumeCopy, VolumeFiller,
        },
        migration::{MigrationConn, VolumeSourceArgs, VolumeTargetArgs},
        structures::{Reverter, RevertHook},
        types::Operation,
    },
    vessel::{VesselError, VesselResult},
};

/// Location of the root disk file for block-backed payloads. ISO content
/// uses its own file name so volume listings can tell the two apart.
pub fn root_disk_path(vol: &Volume) -> PathBuf {
    match vol.content_type() {
        ContentType::Iso => vol.mount_path().join(utils::ROOT_ISO_FILE),
        _ => vol.mount_path().join(utils::ROOT_DISK_FILE),
    }
}

/// The root block path handed to fillers: set for block-backed payloads.
fn filler_block_path(vol: &Volume) -> Option<PathBuf> {
    match vol.content_type() {
        ContentType::Block | ContentType::Iso => Some(root_disk_path(vol)),
        ContentType::Fs if vol.is_block_backed() => Some(root_disk_path(vol)),
        ContentType::Fs => None,
    }
}

pub fn has_volume(vol: &Volume) -> bool {
    vol.mount_path().is_dir()
}

/// Create an empty volume, optionally populated by a filler, and size its
/// root disk file according to the volume's effective config size.
pub fn create_volume(
    vol: &Volume,
    filler: Option<&mut VolumeFiller<'_>>,
    op: &Operation,
) -> VesselResult<()> {
    op.check_cancelled()?;

    let mount_path = vol.mount_path();
    if mount_path.exists() {
        return Err(VesselError::AlreadyExists(format!(
            "Volume {} on pool {}",
            vol.name(),
            vol.pool()
        )));
    }

    let mut revert = Reverter::new();
    utils::ensure_dir(&mount_path, 0o711)?;
    {
        let mount_path = mount_path.clone();
        revert.add(move || {
            let _ = fs::remove_dir_all(&mount_path);
        });
    }

    let block_path = filler_block_path(vol);
    if let Some(ref path) = block_path {
        fs::File::create(path)?;
    }

    if let Some(filler) = filler {
        filler.fill(vol, block_path.as_deref(), false)?;
    }

    // Grow the root disk file up to the configured size; content written by
    // the filler is never truncated here.
    if let Some(ref path) = block_path {
        let size = utils::parse_byte_size(&vol.config_size())?;
        let current = fs::metadata(path)?.len();
        if size > current {
            fs::OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(size)?;
        }
    }

    revert.success();
    Ok(())
}

/// Delete a volume (or snapshot) directory, pruning an emptied snapshot
/// parent directory.
pub fn delete_volume(vol: &Volume, op: &Operation) -> VesselResult<()> {
    op.check_cancelled()?;

    utils::remove_tree(&vol.mount_path())?;

    let snap_dir = vol.snapshot_dir();
    if vol.is_snapshot() {
        // Last snapshot gone: the parent directory goes too.
        if utils::list_dir_names(&snap_dir)?.is_empty() {
            utils::remove_tree(&snap_dir)?;
        }
    } else {
        utils::remove_tree(&snap_dir)?;
    }

    Ok(())
}

pub fn rename_volume(vol: &Volume, new_vol: &Volume, op: &Operation) -> VesselResult<()> {
    op.check_cancelled()?;

    let mut revert = Reverter::new();

    let old_path = vol.mount_path();
    let new_path = new_vol.mount_path();
    if let Some(parent) = new_path.parent() {
        utils::ensure_dir(parent, 0o711)?;
    }
    fs::rename(&old_path, &new_path)?;
    {
        let (old_path, new_path) = (old_path.clone(), new_path.clone());
        revert.add(move || {
            let _ = fs::rename(&new_path, &old_path);
        });
    }

    let old_snap_dir = vol.snapshot_dir();
    let new_snap_dir = new_vol.snapshot_dir();
    if old_snap_dir.is_dir() && old_snap_dir != new_snap_dir {
        if let Some(parent) = new_snap_dir.parent() {
            utils::ensure_dir(parent, 0o711)?;
        }
        fs::rename(&old_snap_dir, &new_snap_dir)?;
    }

    revert.success();
    Ok(())
}

/// Copy a volume and the snapshots matched between the two bundles.
/// Snapshot pairs are matched by snapshot-only name.
pub fn copy_volume(
    dst: &VolumeCopy,
    src: &VolumeCopy,
    op: &Operation,
) -> VesselResult<()> {
    let mut revert = Reverter::new();

    for dst_snap in &dst.snapshots {
        op.check_cancelled()?;

        let snap_name = snapshot_only_name(dst_snap)?;
        let src_snap = src
            .snapshots
            .iter()
            .find(|s| snapshot_only_name(s).map(|n| n == snap_name).unwrap_or(false))
            .ok_or_else(|| {
                VesselError::Msg(format!(
                    "Source snapshot {snap_name:?} missing during copy"
                ))
            })?;

        let dst_path = dst_snap.mount_path();
        utils::copy_tree(&src_snap.mount_path(), &dst_path)?;
        revert.add(move || {
            let _ = fs::remove_dir_all(&dst_path);
        });
    }

    op.check_cancelled()?;
    let dst_path = dst.volume.mount_path();
    utils::remove_tree(&dst_path)?;
    utils::copy_tree(&src.volume.mount_path(), &dst_path)?;
    {
        let dst_path = dst_path.clone();
        revert.add(move || {
            let _ = fs::remove_dir_all(&dst_path);
        });
    }

    revert.success();
    Ok(())
}

/// Synchronize an existing volume from a source: transfer only the named
/// missing snapshots, then replace the volume content.
pub fn refresh_volume(
    dst: &VolumeCopy,
    src: &VolumeCopy,
    refresh_snapshots: &[String],
    op: &Operation,
) -> VesselResult<()> {
    for src_snap in &src.snapshots {
        let snap_name = snapshot_only_name(src_snap)?;
        if !refresh_snapshots.iter().any(|s| s == snap_name) {
            continue;
        }

        op.check_cancelled()?;
        let dst_snap = dst.volume.new_snapshot(snap_name)?;
        utils::remove_tree(&dst_snap.mount_path())?;
        utils::copy_tree(&src_snap.mount_path(), &dst_snap.mount_path())?;
    }

    op.check_cancelled()?;
    let dst_path = dst.volume.mount_path();
    utils::remove_tree(&dst_path)?;
    utils::copy_tree(&src.volume.mount_path(), &dst_path)?;
    Ok(())
}

/// Source side of a generic transfer: stream the requested snapshots
/// oldest-first, then the volume itself.
pub fn migrate_volume(
    vol: &VolumeCopy,
    conn: &mut dyn MigrationConn,
    args: &VolumeSourceArgs,
    op: &Operation,
) -> VesselResult<()> {
    if !args.volume_only && !args.final_sync {
        for snap_name in &args.snapshots {
            let snap = vol
                .snapshots
                .iter()
                .find(|s| snapshot_only_name(s).map(|n| n == snap_name).unwrap_or(false))
                .ok_or_else(|| {
                    VesselError::Msg(format!(
                        "Snapshot {snap_name:?} requested for migration but not present"
                    ))
                })?;
            stream::send_tree(&snap.mount_path(), conn, op)?;
        }
    }

    stream::send_tree(&vol.volume.mount_path(), conn, op)
}

/// Target side of a generic transfer.
pub fn create_volume_from_migration(
    vol: &VolumeCopy,
    conn: &mut dyn MigrationConn,
    args: &VolumeTargetArgs,
    pre_filler: Option<&mut VolumeFiller<'_>>,
    op: &Operation,
) -> VesselResult<()> {
    let mut revert = Reverter::new();

    if !args.refresh {
        create_volume(&vol.volume, pre_filler, op)?;
        let mount_path = vol.volume.mount_path();
        revert.add(move || {
            let _ = fs::remove_dir_all(&mount_path);
        });
    }

    if !args.volume_only {
        for snap_name in &args.snapshots {
            op.check_cancelled()?;
            let snap = vol.volume.new_snapshot(snap_name)?;
            let snap_path = snap.mount_path();
            utils::remove_tree(&snap_path)?;
            stream::recv_tree(conn, &snap_path, op)?;
            revert.add(move || {
                let _ = fs::remove_dir_all(&snap_path);
            });
        }
    }

    op.check_cancelled()?;
    let mount_path = vol.volume.mount_path();
    utils::remove_tree(&mount_path)?;
    stream::recv_tree(conn, &mount_path, op)?;

    // Honor the size floor from the offer header so the target block
    // device is provisioned at least as large as the source.
    if vol.volume.content_type() == ContentType::Block {
        if let Some(volume_size) = args.volume_size {
            let disk = root_disk_path(&vol.volume);
            if disk.is_file() && fs::metadata(&disk)?.len() < volume_size {
                fs::OpenOptions::new()
                    .write(true)
                    .open(&disk)?
                    .set_len(volume_size)?;
            }
        }
    }

    revert.success();
    Ok(())
}

/// Write a backup archive: the named snapshots oldest-first, then the
/// volume itself, in the shared tree-stream encoding.
pub fn backup_volume(
    vol: &VolumeCopy,
    writer: &mut dyn Write,
    snap_names: &[String],
    op: &Operation,
) -> VesselResult<()> {
    let mut sink = WriteConn(writer);

    for snap_name in snap_names {
        let snap = vol
            .snapshots
            .iter()
            .find(|s| snapshot_only_name(s).map(|n| n == snap_name).unwrap_or(false))
            .ok_or_else(|| {
                VesselError::Msg(format!(
                    "Snapshot {snap_name:?} requested for backup but not present"
                ))
            })?;
        stream::send_tree(&snap.mount_path(), &mut sink, op)?;
    }

    stream::send_tree(&vol.volume.mount_path(), &mut sink, op)
}

/// Unpack a backup archive into new volume(s). Returns a revert hook that
/// removes everything unpacked.
pub fn create_volume_from_backup(
    vol: &VolumeCopy,
    snapshots: &[String],
    data: &mut dyn Read,
    op: &Operation,
) -> VesselResult<Option<RevertHook>> {
    let mut source = ReadConn(data);

    // Paths unpacked so far, removed again by the revert chain or the
    // returned hook.
    let mut unpacked: Vec<PathBuf> = Vec::new();
    let mut revert = Reverter::new();

    let mount_path = vol.volume.mount_path();
    if mount_path.exists() {
        return Err(VesselError::AlreadyExists(format!(
            "Volume {} on pool {}",
            vol.volume.name(),
            vol.volume.pool()
        )));
    }

    for snap_name in snapshots {
        op.check_cancelled()?;
        let snap = vol.volume.new_snapshot(snap_name)?;
        let snap_path = snap.mount_path();
        stream::recv_tree(&mut source, &snap_path, op)?;
        unpacked.push(snap_path.clone());
        revert.add(move || {
            let _ = fs::remove_dir_all(&snap_path);
        });
    }

    op.check_cancelled()?;
    stream::recv_tree(&mut source, &mount_path, op)?;
    unpacked.push(mount_path);
    unpacked.push(vol.volume.snapshot_dir());

    revert.success();
    let hook: RevertHook = Box::new(move || {
        for path in unpacked.iter().rev() {
            let _ = fs::remove_dir_all(path);
        }
    });
    Ok(Some(hook))
}

/// Apply a size quota to a root disk file. Growing extends the file;
/// shrinking below the current length fails with `CannotBeShrunk` unless
/// the caller disabled the safety checks.
pub fn set_disk_quota(vol: &Volume, size: &str, allow_unsafe_resize: bool) -> VesselResult<()> {
    let size_bytes = utils::parse_byte_size(size)?;
    if size_bytes == 0 {
        return Ok(());
    }

    let disk = root_disk_path(vol);
    if !disk.is_file() {
        return Err(VesselError::NotFound(format!(
            "Root disk of volume {}",
            vol.name()
        )));
    }

    let current = fs::metadata(&disk)?.len();
    if size_bytes < current && !allow_unsafe_resize {
        return Err(VesselError::CannotBeShrunk(format!(
            "{size_bytes} < {current}"
        )));
    }

    fs::OpenOptions::new()
        .write(true)
        .open(&disk)?
        .set_len(size_bytes)?;
    Ok(())
}

/// Snapshot-only names present on disk, ordered by directory creation time
/// (oldest first), ties broken by name.
pub fn volume_snapshots(vol: &Volume) -> VesselResult<Vec<String>> {
    let snap_dir = vol.snapshot_dir();
    if !snap_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<(SystemTime, String)> = Vec::new();
    for name in utils::list_dir_names(&snap_dir)? {
        let meta = fs::metadata(snap_dir.join(&name))?;
        let created = meta.created().or_else(|_| meta.modified())?;
        entries.push((created, name));
    }
    entries.sort();
    Ok(entries.into_iter().map(|(_, name)| name).collect())
}

/// Create a snapshot by copying the parent's current content.
pub fn snapshot_volume(snap_vol: &Volume, op: &Operation) -> VesselResult<()> {
    op.check_cancelled()?;

    let (parent, _) = super::parent_and_snapshot_name(snap_vol.name());
    let parent_path =
        snap_vol
            .state_dirs()
            .volume_mount_path(snap_vol.pool(), snap_vol.vol_type(), parent);

    let snap_path = snap_vol.mount_path();
    if snap_path.exists() {
        return Err(VesselError::AlreadyExists(format!(
            "Snapshot {}",
            snap_vol.name()
        )));
    }

    utils::copy_tree(&parent_path, &snap_path)
}

/// Replace a volume's content with one of its snapshots.
pub fn restore_volume(vol: &Volume, snap_vol: &Volume, op: &Operation) -> VesselResult<()> {
    op.check_cancelled()?;

    let vol_path = vol.mount_path();
    utils::remove_tree(&vol_path)?;
    utils::copy_tree(&snap_vol.mount_path(), &vol_path)
}

fn snapshot_only_name(snap: &Volume) -> VesselResult<&str> {
    match super::parent_and_snapshot_name(snap.name()) {
        (_, Some(name)) => Ok(name),
        (_, None) => Err(VesselError::Msg(format!(
            "Volume {} is not a snapshot",
            snap.name()
        ))),
    }
}

struct WriteConn<'a>(&'a mut dyn Write);

impl Read for WriteConn<'_> {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "write-only stream",
        ))
    }
}

impl Write for WriteConn<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

struct ReadConn<'a>(&'a mut dyn Read);

impl Read for ReadConn<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for ReadConn<'_> {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "read-only stream",
        ))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
