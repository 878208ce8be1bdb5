// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The directory-backed reference driver.
//!
//! Volumes are plain directory trees under the pool mount path. There is
//! no optimized image support and no copy-on-write: copies and snapshots
//! are full recursive copies, and quotas are enforced only on the root
//! disk files of block-content volumes.

use std::{
    collections::HashMap,
    io::{Read, Write},
    path::PathBuf,
    sync::RwLock,
};

use nix::sys::statvfs::statvfs;

use crate::{
    storage::{
        drivers::{
            generic, utils, ContentType, Driver, Info, MountCounts, PoolResources, Volume,
            VolumeCopy, VolumeFiller, VolumePostHook, VolumeType,
        },
        migration::{MigrationConn, MigrationType, Protocol, VolumeSourceArgs, VolumeTargetArgs},
        paths::StateDirs,
        structures::RevertHook,
        types::Operation,
    },
    vessel::{VesselError, VesselResult},
};

const POOL_CONFIG_KEYS: &[&str] = &["source", "size", "volume.size"];
const VOLUME_CONFIG_KEYS: &[&str] = &["size", "size.state", "volatile.rootfs.size"];

#[derive(Debug)]
pub struct DirDriver {
    pool: String,
    config: RwLock<HashMap<String, String>>,
    dirs: StateDirs,
    mounts: MountCounts,
}

impl DirDriver {
    pub fn new(
        pool: &str,
        config: HashMap<String, String>,
        dirs: StateDirs,
        mounts: MountCounts,
    ) -> DirDriver {
        DirDriver {
            pool: pool.to_string(),
            config: RwLock::new(config),
            dirs,
            mounts,
        }
    }

    fn pool_config(&self) -> HashMap<String, String> {
        self.config.read().expect("driver config poisoned").clone()
    }

    fn source(&self) -> Option<PathBuf> {
        self.config
            .read()
            .expect("driver config poisoned")
            .get("source")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    fn pool_path(&self) -> PathBuf {
        self.dirs.pool_mount_path(&self.pool)
    }

    fn new_listed_volume(&self, vol_type: VolumeType, content_type: ContentType, name: &str) -> Volume {
        Volume::new(
            "dir",
            &self.pool,
            self.pool_config(),
            vol_type,
            content_type,
            name,
            HashMap::new(),
            self.dirs.clone(),
            self.mounts.clone(),
        )
    }
}

/// Key validation shared by the in-tree drivers. `user.*` keys pass
/// through untouched.
pub(super) fn check_config_keys(
    config: &HashMap<String, String>,
    known: &[&str],
) -> VesselResult<()> {
    for key in config.keys() {
        if !known.contains(&key.as_str()) && !key.starts_with("user.") {
            return Err(VesselError::Msg(format!("Invalid config key {key:?}")));
        }
    }
    Ok(())
}

pub(super) fn strip_or_check_volume_keys(
    vol: &mut Volume,
    known: &[&str],
    remove_unknown_keys: bool,
) -> VesselResult<()> {
    let unknown: Vec<String> = vol
        .config()
        .keys()
        .filter(|key| !known.contains(&key.as_str()) && !key.starts_with("user."))
        .cloned()
        .collect();

    if unknown.is_empty() {
        return Ok(());
    }

    if !remove_unknown_keys {
        return Err(VesselError::Msg(format!(
            "Invalid volume config key {:?}",
            unknown[0]
        )));
    }

    for key in unknown {
        vol.config_mut().remove(&key);
    }
    Ok(())
}

/// Content type of an on-disk volume directory, judged by its payload
/// files. Block-backed filesystem volumes carry the filesystem marker next
/// to their root disk file.
pub(super) fn detect_content_type(path: &PathBuf) -> ContentType {
    if path.join(utils::ROOT_ISO_FILE).is_file() {
        ContentType::Iso
    } else if path.join(utils::ROOT_DISK_FILE).is_file() && !path.join(utils::FS_MARKER).is_file() {
        ContentType::Block
    } else {
        ContentType::Fs
    }
}

impl Driver for DirDriver {
    fn info(&self) -> Info {
        Info {
            name: "dir",
            optimized_images: false,
            remote: false,
            mounted_root: true,
            running_copy_freeze: true,
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Image,
                VolumeType::Custom,
            ],
            block_backing: false,
            preserves_inodes: true,
            default_vm_block_filesystem_size: "100MiB",
        }
    }

    fn validate(&self, config: &HashMap<String, String>) -> VesselResult<()> {
        check_config_keys(config, POOL_CONFIG_KEYS)
    }

    fn create(&self, _op: &Operation) -> VesselResult<()> {
        if let Some(source) = self.source() {
            if !source.is_dir() {
                return Err(VesselError::Msg(format!(
                    "Source directory {} doesn't exist",
                    source.display()
                )));
            }
        }

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
        if let Some(source) = self.source() {
            if !source.is_dir() {
                return Err(VesselError::Msg(format!(
                    "Source directory {} is missing",
                    source.display()
                )));
            }
        }

        // Nothing to mount: the pool path is a plain directory.
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
                vols.push(self.new_listed_volume(vol_type, content_type, &name));
            }
        }

        Ok(vols)
    }

    fn apply_patch(&self, name: &str) -> VesselResult<()> {
        debug!("No driver patch {name:?} for dir pool {}", self.pool);
        Ok(())
    }

    fn fill_volume_config(&self, _vol: &mut Volume) -> VesselResult<()> {
        Ok(())
    }

    fn validate_volume(&self, vol: &mut Volume, remove_unknown_keys: bool) -> VesselResult<()> {
        strip_or_check_volume_keys(vol, VOLUME_CONFIG_KEYS, remove_unknown_keys)
    }

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        op: &Operation,
    ) -> VesselResult<()> {
        generic::create_volume(vol, filler, op)
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

        if let Some(size) = changed.get("size") {
            if vol.content_type() == ContentType::Block {
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
        match vol.content_type() {
            ContentType::Block | ContentType::Iso => Ok(generic::root_disk_path(vol)),
            ContentType::Fs => Err(VesselError::NotSupported(
                "Disk path of a filesystem volume".to_string(),
            )),
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
            // Plain directories carry no enforced filesystem quota.
            ContentType::Fs => Ok(()),
            ContentType::Block => generic::set_disk_quota(vol, size, allow_unsafe_resize),
            ContentType::Iso => Err(VesselError::NotSupported(
                "Quota on ISO volume".to_string(),
            )),
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

    fn can_delegate_volume(&self, _vol: &Volume) -> bool {
        false
    }

    fn delegate_volume(&self, _vol: &Volume, _pid: i32) -> VesselResult<()> {
        Err(VesselError::NotSupported("Volume delegation".to_string()))
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

    fn restore_volume(&self, vol: &Volume, snap_vol: &Volume, op: &Operation) -> VesselResult<()> {
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
        _refresh: bool,
        _copy_snapshots: bool,
    ) -> Vec<MigrationType> {
        match content_type {
            ContentType::Fs => vec![MigrationType::new(Protocol::GenericFs)],
            ContentType::Block | ContentType::Iso => {
                vec![MigrationType::new(Protocol::GenericBlock)]
            }
        }
    }

    fn migrate_volume(
        &self,
        vol: &VolumeCopy,
        conn: &mut dyn MigrationConn,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> VesselResult<()> {
        generic::migrate_volume(vol, conn, args, op)
    }

    fn backup_volume(
        &self,
        vol: &VolumeCopy,
        writer: &mut dyn Write,
        optimized: bool,
        snap_names: &[String],
        op: &Operation,
    ) -> VesselResult<()> {
        if optimized {
            return Err(VesselError::NotSupported(
                "Optimized backups on dir pools".to_string(),
            ));
        }

        generic::backup_volume(vol, writer, snap_names, op)
    }
}
