// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A simulation driver used by the test-suite.
//!
//! Behaves like a copy-on-write, block-backed store as far as the backend
//! can observe: it supports optimized image volumes, puts filesystem
//! content on simulated backing devices with a recorded filesystem, and
//! refuses to restore across newer snapshots the way real CoW stores do.
//! The payloads themselves are plain directory trees; the "mkfs" is a
//! marker file recording the chosen filesystem.

use std::{
    collections::HashMap,
    fs,
    io::{Read, Write},
    path::PathBuf,
    sync::RwLock,
};

use nix::sys::statvfs::statvfs;

use crate::{
    storage::{
        drivers::{
            dir::{check_config_keys, detect_content_type, strip_or_check_volume_keys},
            generic, utils, ContentType, Driver, Info, MountCounts, PoolResources, Volume,
            VolumeCopy, VolumeFiller, VolumePostHook, VolumeType, CONFIG_BLOCK_FILESYSTEM,
            CONFIG_BLOCK_MODE, POOL_CONFIG_BLOCK_FILESYSTEM, POOL_CONFIG_BLOCK_MODE,
        },
        migration::{MigrationConn, MigrationType, Protocol, VolumeSourceArgs, VolumeTargetArgs},
        paths::StateDirs,
        structures::RevertHook,
        types::Operation,
    },
    vessel::{VesselError, VesselResult},
};

const POOL_CONFIG_KEYS: &[&str] = &[
    "source",
    "size",
    "volume.size",
    POOL_CONFIG_BLOCK_FILESYSTEM,
    POOL_CONFIG_BLOCK_MODE,
];
const VOLUME_CONFIG_KEYS: &[&str] = &[
    "size",
    "size.state",
    "volatile.rootfs.size",
    CONFIG_BLOCK_FILESYSTEM,
    CONFIG_BLOCK_MODE,
];

/// Filesystems the simulated mkfs accepts.
const SUPPORTED_FILESYSTEMS: &[&str] = &["ext4", "xfs", "btrfs"];

const DEFAULT_FILESYSTEM: &str = "ext4";

#[derive(Debug)]
pub struct SimDriver {
    pool: String,
    config: RwLock<HashMap<String, String>>,
    dirs: StateDirs,
    mounts: MountCounts,
}

impl SimDriver {
    pub fn new(
        pool: &str,
        config: HashMap<String, String>,
        dirs: StateDirs,
        mounts: MountCounts,
    ) -> SimDriver {
        SimDriver {
            pool: pool.to_string(),
            config: RwLock::new(config),
            dirs,
            mounts,
        }
    }

    fn pool_config(&self) -> HashMap<String, String> {
        self.config.read().expect("driver config poisoned").clone()
    }

    fn pool_path(&self) -> PathBuf {
        self.dirs.pool_mount_path(&self.pool)
    }

    fn pool_config_value(&self, key: &str) -> Option<String> {
        self.config
            .read()
            .expect("driver config poisoned")
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    /// Simulate formatting a block-backed filesystem volume: record the
    /// filesystem name in the volume's marker file.
    fn format_volume(&self, vol: &Volume) -> VesselResult<()> {
        let filesystem = vol
            .config()
            .get(CONFIG_BLOCK_FILESYSTEM)
            .cloned()
            .unwrap_or_else(|| DEFAULT_FILESYSTEM.to_string());
        fs::write(vol.mount_path().join(utils::FS_MARKER), filesystem)?;
        Ok(())
    }
}

impl Driver for SimDriver {
    fn info(&self) -> Info {
        Info {
            name: "sim",
            optimized_images: true,
            remote: false,
            mounted_root: true,
            running_copy_freeze: false,
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Image,
                VolumeType::Custom,
            ],
            block_backing: true,
            preserves_inodes: false,
            default_vm_block_filesystem_size: "100MiB",
        }
    }

    fn validate(&self, config: &HashMap<String, String>) -> VesselResult<()> {
        check_config_keys(config, POOL_CONFIG_KEYS)?;

        if let Some(filesystem) = config.get(POOL_CONFIG_BLOCK_FILESYSTEM) {
            if !SUPPORTED_FILESYSTEMS.contains(&filesystem.as_str()) {
                return Err(VesselError::Msg(format!(
                    "Unsupported pool block filesystem {filesystem:?}"
                )));
            }
        }

        Ok(())
    }

    fn create(&self, _op: &Operation) -> VesselResult<()> {
        Ok(())
    }

    fn delete(&self, _op: &Operation) -> VesselResult<()> {
        Ok(())
    }

    fn update(&self, changed: &HashMap<String, String>) -> VesselResult<()> {
        let mut config = self.config.write().expect("driver config poisoned");
        for (key, value) in changed {
            if value.is_empty() {
                config.remove(key);
            } else {
                config.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn mount(&self) -> VesselResult<bool> {
        if let Some(source) = self.pool_config_value("source") {
            let source = PathBuf::from(source);
            if !source.is_dir() {
                return Err(VesselError::Msg(format!(
                    "Source directory {} is missing",
                    source.display()
                )));
            }
        }

        Ok(false)
    }

    fn unmount(&self) -> VesselResult<bool> {
        Ok(false)
    }

    fn get_resources(&self) -> VesselResult<PoolResources> {
        let stat = statvfs(&self.pool_path())?;
        let fragment = stat.fragment_size() as u64;
        Ok(PoolResources {
            space_total: stat.blocks() as u64 * fragment,
            space_used: (stat.blocks() as u64 - stat.blocks_free() as u64) * fragment,
            inodes_total: stat.files() as u64,
            inodes_used: stat.files() as u64 - stat.files_free() as u64,
        })
    }

    fn list_volumes(&self) -> VesselResult<Vec<Volume>> {
        let mut vols = Vec::new();

        for vol_type in self.info().volume_types {
            let type_dir = self.pool_path().join(vol_type.dir_name());
            for name in utils::list_dir_names(&type_dir)? {
                let content_type = match vol_type {
                    VolumeType::Vm => ContentType::Block,
                    VolumeType::Container => ContentType::Fs,
                    _ => detect_content_type(&type_dir.join(&name)),
                };
                vols.push(Volume::new(
                    "sim",
                    &self.pool,
                    self.pool_config(),
                    vol_type,
                    content_type,
                    &name,
                    HashMap::new(),
                    self.dirs.clone(),
                    self.mounts.clone(),
                ));
            }
        }

        Ok(vols)
    }

    fn apply_patch(&self, name: &str) -> VesselResult<()> {
        debug!("No driver patch {name:?} for sim pool {}", self.pool);
        Ok(())
    }

    fn fill_volume_config(&self, vol: &mut Volume) -> VesselResult<()> {
        if vol.content_type() != ContentType::Fs {
            return Ok(());
        }

        if !vol.config().contains_key(CONFIG_BLOCK_MODE) {
            let block_mode = self
                .pool_config_value(POOL_CONFIG_BLOCK_MODE)
                .unwrap_or_else(|| "true".to_string());
            vol.config_mut()
                .insert(CONFIG_BLOCK_MODE.to_string(), block_mode);
        }

        if vol.is_block_backed() && !vol.config().contains_key(CONFIG_BLOCK_FILESYSTEM) {
            let filesystem = self
                .pool_config_value(POOL_CONFIG_BLOCK_FILESYSTEM)
                .unwrap_or_else(|| DEFAULT_FILESYSTEM.to_string());
            vol.config_mut()
                .insert(CONFIG_BLOCK_FILESYSTEM.to_string(), filesystem);
        }

        Ok(())
    }

    fn validate_volume(&self, vol: &mut Volume, remove_unknown_keys: bool) -> VesselResult<()> {
        strip_or_check_volume_keys(vol, VOLUME_CONFIG_KEYS, remove_unknown_keys)?;

        if let Some(filesystem) = vol.config().get(CONFIG_BLOCK_FILESYSTEM) {
            if !SUPPORTED_FILESYSTEMS.contains(&filesystem.as_str()) {
                return Err(VesselError::Msg(format!(
                    "Unsupported block filesystem {filesystem:?}"
                )));
            }
        }

        Ok(())
    }

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        op: &Operation,
    ) -> VesselResult<()> {
        generic::create_volume(vol, filler, op)?;

        if vol.content_type() == ContentType::Fs && vol.is_block_backed() {
            self.format_volume(vol)?;
        }

        Ok(())
    }

    fn create_volume_from_copy(
        &self,
        vol: &VolumeCopy,
        src: &VolumeCopy,
        _allow_inconsistent: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        generic::copy_volume(vol, src, op)
    }

    fn create_volume_from_migration(
        &self,
        vol: &VolumeCopy,
        conn: &mut dyn MigrationConn,
        args: &VolumeTargetArgs,
        pre_filler: Option<&mut VolumeFiller<'_>>,
        op: &Operation,
    ) -> VesselResult<()> {
        generic::create_volume_from_migration(vol, conn, args, pre_filler, op)
    }

    fn create_volume_from_backup(
        &self,
        vol: &VolumeCopy,
        info: &crate::storage::backup::RestoreInfo,
        data: &mut dyn Read,
        op: &Operation,
    ) -> VesselResult<(Option<VolumePostHook>, Option<RevertHook>)> {
        let revert_hook = generic::create_volume_from_backup(vol, &info.snapshots, data, op)?;
        Ok((None, revert_hook))
    }

    fn refresh_volume(
        &self,
        vol: &VolumeCopy,
        src: &VolumeCopy,
        refresh_snapshots: &[String],
        _allow_inconsistent: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        generic::refresh_volume(vol, src, refresh_snapshots, op)
    }

    fn delete_volume(&self, vol: &Volume, op: &Operation) -> VesselResult<()> {
        generic::delete_volume(vol, op)
    }

    fn rename_volume(&self, vol: &Volume, new_name: &str, op: &Operation) -> VesselResult<()> {
        generic::rename_volume(vol, &vol.with_name(new_name), op)
    }

    fn update_volume(&self, vol: &Volume, changed: &HashMap<String, String>) -> VesselResult<()> {
        if vol.content_type() == ContentType::Iso {
            return Err(VesselError::Msg(
                "ISO volume config cannot be changed".to_string(),
            ));
        }

        for key in [CONFIG_BLOCK_FILESYSTEM, CONFIG_BLOCK_MODE] {
            if changed.contains_key(key) {
                return Err(VesselError::Msg(format!(
                    "Volume {key:?} cannot be changed after creation"
                )));
            }
        }

        if let Some(size) = changed.get("size") {
            if vol.is_block_backed() {
                generic::set_disk_quota(vol, size, false)?;
            }
        }

        Ok(())
    }

    fn has_volume(&self, vol: &Volume) -> VesselResult<bool> {
        Ok(generic::has_volume(vol))
    }

    fn volume_usage(&self, vol: &Volume) -> VesselResult<u64> {
        utils::dir_size(&vol.mount_path())
    }

    fn volume_disk_path(&self, vol: &Volume) -> VesselResult<PathBuf> {
        if vol.is_block_backed() {
            Ok(generic::root_disk_path(vol))
        } else {
            Err(VesselError::NotSupported(
                "Disk path of a filesystem volume".to_string(),
            ))
        }
    }

    fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        allow_unsafe_resize: bool,
        _op: &Operation,
    ) -> VesselResult<()> {
        match vol.content_type() {
            ContentType::Iso => Err(VesselError::NotSupported(
                "Quota on ISO volume".to_string(),
            )),
            _ if vol.is_block_backed() => {
                generic::set_disk_quota(vol, size, allow_unsafe_resize)
            }
            _ => Ok(()),
        }
    }

    fn mount_volume(&self, vol: &Volume, op: &Operation) -> VesselResult<()> {
        op.check_cancelled()?;
        vol.ensure_mount_path()?;
        vol.mount_ref_increment();
        Ok(())
    }

    fn unmount_volume(
        &self,
        vol: &Volume,
        _keep_block_dev: bool,
        op: &Operation,
    ) -> VesselResult<bool> {
        op.check_cancelled()?;
        Ok(vol.mount_ref_decrement() == 0)
    }

    fn can_delegate_volume(&self, vol: &Volume) -> bool {
        vol.vol_type() == VolumeType::Custom && vol.content_type() == ContentType::Fs
    }

    fn delegate_volume(&self, vol: &Volume, pid: i32) -> VesselResult<()> {
        debug!("Delegating volume {} to pid {pid}", vol.name());
        Ok(())
    }

    fn create_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<()> {
        generic::snapshot_volume(snap_vol, op)
    }

    fn delete_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<()> {
        generic::delete_volume(snap_vol, op)
    }

    fn rename_volume_snapshot(
        &self,
        snap_vol: &Volume,
        new_snap_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        let (parent, _) = super::parent_and_snapshot_name(snap_vol.name());
        let new_vol = snap_vol.with_name(&super::snapshot_volume_name(parent, new_snap_name));
        generic::rename_volume(snap_vol, &new_vol, op)
    }

    fn mount_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<()> {
        op.check_cancelled()?;
        snap_vol.mount_ref_increment();
        Ok(())
    }

    fn unmount_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<bool> {
        op.check_cancelled()?;
        Ok(snap_vol.mount_ref_decrement() == 0)
    }

    /// Like a real copy-on-write store, restoring is only possible to the
    /// most recent snapshot; restoring further back requires deleting the
    /// snapshots in between, reported through `DeleteSnapshotsFirst`.
    fn restore_volume(&self, vol: &Volume, snap_vol: &Volume, op: &Operation) -> VesselResult<()> {
        let (_, snap_name) = super::parent_and_snapshot_name(snap_vol.name());
        let snap_name = snap_name
            .ok_or_else(|| VesselError::Msg("Restore target must be a snapshot".to_string()))?;

        let snapshots = generic::volume_snapshots(vol)?;
        let target_idx = snapshots
            .iter()
            .position(|name| name == snap_name)
            .ok_or_else(|| VesselError::NotFound(format!("Snapshot {snap_name:?}")))?;

        let newer: Vec<String> = snapshots[target_idx + 1..].to_vec();
        if !newer.is_empty() {
            return Err(VesselError::DeleteSnapshotsFirst(newer));
        }

        generic::restore_volume(vol, snap_vol, op)
    }

    fn volume_snapshots(&self, vol: &Volume, _op: &Operation) -> VesselResult<Vec<String>> {
        generic::volume_snapshots(vol)
    }

    fn check_volume_snapshots(
        &self,
        vol: &Volume,
        expected: &[String],
        op: &Operation,
    ) -> VesselResult<()> {
        let on_disk = self.volume_snapshots(vol, op)?;

        if on_disk.len() != expected.len() {
            return Err(VesselError::Msg(format!(
                "Snapshot count mismatch for volume {}: {} on disk, {} expected",
                vol.name(),
                on_disk.len(),
                expected.len()
            )));
        }

        for name in expected {
            if !on_disk.contains(name) {
                return Err(VesselError::Msg(format!(
                    "Snapshot {name:?} expected but not present on volume {}",
                    vol.name()
                )));
            }
        }

        Ok(())
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        _copy_snapshots: bool,
    ) -> Vec<MigrationType> {
        let generic_type = match content_type {
            ContentType::Fs => MigrationType::new(Protocol::GenericFs),
            ContentType::Block | ContentType::Iso => MigrationType::new(Protocol::GenericBlock),
        };

        // The simulated optimized stream has no incremental mode.
        if refresh {
            vec![generic_type]
        } else {
            vec![MigrationType::new(Protocol::Optimized), generic_type]
        }
    }

    fn migrate_volume(
        &self,
        vol: &VolumeCopy,
        conn: &mut dyn MigrationConn,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> VesselResult<()> {
        // The optimized stream shares the generic tree encoding; only the
        // negotiation differs.
        generic::migrate_volume(vol, conn, args, op)
    }

    fn backup_volume(
        &self,
        vol: &VolumeCopy,
        writer: &mut dyn Write,
        _optimized: bool,
        snap_names: &[String],
        op: &Operation,
    ) -> VesselResult<()> {
        generic::backup_volume(vol, writer, snap_names, op)
    }
}
