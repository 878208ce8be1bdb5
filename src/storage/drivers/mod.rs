// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The storage driver contract.
//!
//! Every storage technology implements `Driver` and reports its
//! capabilities through an `Info` descriptor queried at runtime. Drivers
//! are discovered by name at pool creation time. Two drivers ship in-tree:
//! `dir`, the plain directory-backed reference driver, and `sim`, a
//! simulation driver with optimized image support used heavily by the
//! test-suite.

use std::{
    collections::HashMap,
    fmt,
    io::{Read, Write},
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex},
};

mod dir;
mod generic;
mod sim;
pub mod stream;
pub mod utils;
mod volume;

pub use self::{
    dir::DirDriver,
    sim::SimDriver,
    volume::{
        parent_and_snapshot_name, snapshot_volume_name, Volume, VolumeCopy, VolumeFiller,
    },
};

use crate::{
    storage::{
        backup::RestoreInfo,
        migration::{MigrationConn, MigrationType, VolumeSourceArgs, VolumeTargetArgs},
        paths::StateDirs,
        structures::RevertHook,
        types::Operation,
    },
    vessel::{VesselError, VesselResult},
};

/// Volume config key holding the size quota.
pub const CONFIG_SIZE: &str = "size";
/// Volume config key holding the VM config-filesystem size quota.
pub const CONFIG_SIZE_STATE: &str = "size.state";
/// Volume config key recording the unpacked size of a cached image.
pub const CONFIG_VOLATILE_ROOTFS_SIZE: &str = "volatile.rootfs.size";
/// Volume config key naming the filesystem of a block-backed volume.
pub const CONFIG_BLOCK_FILESYSTEM: &str = "block.filesystem";
/// Volume config key selecting block-backed mode for filesystem content.
pub const CONFIG_BLOCK_MODE: &str = "block.mode";
/// Pool config key holding the default size for new volumes.
pub const POOL_CONFIG_VOLUME_SIZE: &str = "volume.size";
/// Pool config key holding the default filesystem for block-backed volumes.
pub const POOL_CONFIG_BLOCK_FILESYSTEM: &str = "volume.block.filesystem";
/// Pool config key selecting block-backed mode for new volumes.
pub const POOL_CONFIG_BLOCK_MODE: &str = "volume.block.mode";

/// The types of volume a pool can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum VolumeType {
    Container,
    Vm,
    Image,
    Custom,
}

impl VolumeType {
    /// The pool subdirectory holding mounts of this volume type.
    pub fn dir_name(&self) -> &'static str {
        match self {
            VolumeType::Container => "containers",
            VolumeType::Vm => "virtual-machines",
            VolumeType::Image => "images",
            VolumeType::Custom => "custom",
        }
    }

    /// The pool subdirectory holding snapshot mounts of this volume type.
    pub fn snapshot_dir_name(&self) -> &'static str {
        match self {
            VolumeType::Container => "containers-snapshots",
            VolumeType::Vm => "virtual-machines-snapshots",
            VolumeType::Image => "images-snapshots",
            VolumeType::Custom => "custom-snapshots",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeType::Container => write!(f, "container"),
            VolumeType::Vm => write!(f, "virtual-machine"),
            VolumeType::Image => write!(f, "image"),
            VolumeType::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for VolumeType {
    type Err = VesselError;

    fn from_str(s: &str) -> VesselResult<VolumeType> {
        match s {
            "container" => Ok(VolumeType::Container),
            "virtual-machine" => Ok(VolumeType::Vm),
            "image" => Ok(VolumeType::Image),
            "custom" => Ok(VolumeType::Custom),
            _ => Err(VesselError::Msg(format!("Unknown volume type {s:?}"))),
        }
    }
}

/// The semantic shape of a volume's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ContentType {
    Fs,
    Block,
    Iso,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Fs => write!(f, "filesystem"),
            ContentType::Block => write!(f, "block"),
            ContentType::Iso => write!(f, "iso"),
        }
    }
}

impl FromStr for ContentType {
    type Err = VesselError;

    fn from_str(s: &str) -> VesselResult<ContentType> {
        match s {
            "filesystem" => Ok(ContentType::Fs),
            "block" => Ok(ContentType::Block),
            "iso" => Ok(ContentType::Iso),
            _ => Err(VesselError::Msg(format!("Unknown content type {s:?}"))),
        }
    }
}

/// Capability descriptor reported by a driver.
#[derive(Debug, Clone)]
pub struct Info {
    /// Driver name as registered.
    pub name: &'static str,
    /// Whether the driver keeps pre-unpacked image volumes it can clone.
    pub optimized_images: bool,
    /// Whether the storage is shared between cluster members.
    pub remote: bool,
    /// Whether the pool root must be mounted to be usable.
    pub mounted_root: bool,
    /// Whether copying a running instance requires freezing it first.
    pub running_copy_freeze: bool,
    /// Volume types the driver can hold.
    pub volume_types: Vec<VolumeType>,
    /// Whether filesystem-content volumes sit on a block device by default.
    pub block_backing: bool,
    /// Whether inode numbers survive a volume copy.
    pub preserves_inodes: bool,
    /// Size given to the VM config filesystem when the main volume has a
    /// quota but no explicit `size.state`.
    pub default_vm_block_filesystem_size: &'static str,
}

/// Utilisation figures for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolResources {
    pub space_total: u64,
    pub space_used: u64,
    pub inodes_total: u64,
    pub inodes_used: u64,
}

/// Shared mount reference counts, keyed by `pool/type/name`. Injected so
/// that backends and drivers observe the same counters.
#[derive(Debug, Clone, Default)]
pub struct MountCounts(Arc<Mutex<HashMap<String, u32>>>);

impl MountCounts {
    pub fn increment(&self, key: &str) -> u32 {
        let mut counts = self.0.lock().expect("mount counts poisoned");
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrement the count, removing the entry when it reaches zero.
    /// Returns the remaining count.
    pub fn decrement(&self, key: &str) -> u32 {
        let mut counts = self.0.lock().expect("mount counts poisoned");
        match counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(key);
                0
            }
            None => 0,
        }
    }

    pub fn count(&self, key: &str) -> u32 {
        *self
            .0
            .lock()
            .expect("mount counts poisoned")
            .get(key)
            .unwrap_or(&0)
    }
}

/// Hook returned by `create_volume_from_backup`, run by the backend once
/// the restored instance has a database identity.
pub type VolumePostHook = Box<dyn FnOnce(&Volume) -> VesselResult<()>>;

/// The contract every storage technology implements.
///
/// Drivers act only through backend-issued calls and must not commit
/// partial state they cannot revert when the operation context is
/// cancelled.
pub trait Driver: fmt::Debug + Send + Sync {
    fn info(&self) -> Info;

    // Pool operations.

    fn validate(&self, config: &HashMap<String, String>) -> VesselResult<()>;
    fn create(&self, op: &Operation) -> VesselResult<()>;
    fn delete(&self, op: &Operation) -> VesselResult<()>;
    fn update(&self, changed: &HashMap<String, String>) -> VesselResult<()>;

    /// Mount the pool. Returns whether this call actually mounted it.
    fn mount(&self) -> VesselResult<bool>;

    /// Unmount the pool. Returns whether this call actually unmounted it.
    fn unmount(&self) -> VesselResult<bool>;

    fn get_resources(&self) -> VesselResult<PoolResources>;

    /// Enumerate the driver's on-disk volumes, exactly one entry per
    /// logical volume. A VM's config-filesystem companion must not be
    /// reported separately from its block volume.
    fn list_volumes(&self) -> VesselResult<Vec<Volume>>;

    fn apply_patch(&self, name: &str) -> VesselResult<()>;

    // Volume operations.

    /// Populate driver defaults for config keys the volume does not set.
    fn fill_volume_config(&self, vol: &mut Volume) -> VesselResult<()>;

    /// Validate volume config; when `remove_unknown_keys` is set, strip
    /// keys this driver does not recognize instead of rejecting them.
    fn validate_volume(&self, vol: &mut Volume, remove_unknown_keys: bool) -> VesselResult<()>;

    fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&mut VolumeFiller<'_>>,
        op: &Operation,
    ) -> VesselResult<()>;

    fn create_volume_from_copy(
        &self,
        vol: &VolumeCopy,
        src: &VolumeCopy,
        allow_inconsistent: bool,
        op: &Operation,
    ) -> VesselResult<()>;

    fn create_volume_from_migration(
        &self,
        vol: &VolumeCopy,
        conn: &mut dyn MigrationConn,
        args: &VolumeTargetArgs,
        pre_filler: Option<&mut VolumeFiller<'_>>,
        op: &Operation,
    ) -> VesselResult<()>;

    /// Unpack a backup stream into new volume(s). Returns an optional post
    /// hook to run once the database identity exists, and an optional
    /// revert hook undoing everything unpacked so far.
    fn create_volume_from_backup(
        &self,
        vol: &VolumeCopy,
        info: &RestoreInfo,
        data: &mut dyn Read,
        op: &Operation,
    ) -> VesselResult<(Option<VolumePostHook>, Option<RevertHook>)>;

    /// Synchronize an existing target volume from a source volume,
    /// transferring only the named snapshots.
    fn refresh_volume(
        &self,
        vol: &VolumeCopy,
        src: &VolumeCopy,
        refresh_snapshots: &[String],
        allow_inconsistent: bool,
        op: &Operation,
    ) -> VesselResult<()>;

    fn delete_volume(&self, vol: &Volume, op: &Operation) -> VesselResult<()>;
    fn rename_volume(&self, vol: &Volume, new_name: &str, op: &Operation) -> VesselResult<()>;
    fn update_volume(
        &self,
        vol: &Volume,
        changed: &HashMap<String, String>,
    ) -> VesselResult<()>;
    fn has_volume(&self, vol: &Volume) -> VesselResult<bool>;
    fn volume_usage(&self, vol: &Volume) -> VesselResult<u64>;

    /// Location of the root block device for block-content volumes.
    fn volume_disk_path(&self, vol: &Volume) -> VesselResult<PathBuf>;

    /// Apply a size quota. An empty size removes the quota. Fails with
    /// `CannotBeShrunk` when the request would truncate data, unless
    /// `allow_unsafe_resize` disables the safety checks.
    fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        allow_unsafe_resize: bool,
        op: &Operation,
    ) -> VesselResult<()>;

    fn mount_volume(&self, vol: &Volume, op: &Operation) -> VesselResult<()>;

    /// Unmount unless other references remain. Returns whether the volume
    /// was actually unmounted.
    fn unmount_volume(
        &self,
        vol: &Volume,
        keep_block_dev: bool,
        op: &Operation,
    ) -> VesselResult<bool>;

    fn can_delegate_volume(&self, vol: &Volume) -> bool;
    fn delegate_volume(&self, vol: &Volume, pid: i32) -> VesselResult<()>;

    // Snapshot operations.

    fn create_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<()>;
    fn delete_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<()>;
    fn rename_volume_snapshot(
        &self,
        snap_vol: &Volume,
        new_snap_name: &str,
        op: &Operation,
    ) -> VesselResult<()>;
    fn mount_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<()>;
    fn unmount_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> VesselResult<bool>;

    /// Roll a volume back to one of its snapshots. May fail with
    /// `DeleteSnapshotsFirst` carrying the names of snapshots newer than
    /// the restore target.
    fn restore_volume(&self, vol: &Volume, snap_vol: &Volume, op: &Operation) -> VesselResult<()>;

    /// Snapshot-only names present on disk, oldest first.
    fn volume_snapshots(&self, vol: &Volume, op: &Operation) -> VesselResult<Vec<String>>;

    /// Verify the on-disk snapshot set matches the expected names.
    fn check_volume_snapshots(
        &self,
        vol: &Volume,
        expected: &[String],
        op: &Operation,
    ) -> VesselResult<()>;

    // Migration and backup.

    /// Ordered preference list of supported transfer methods.
    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        copy_snapshots: bool,
    ) -> Vec<MigrationType>;

    fn migrate_volume(
        &self,
        vol: &VolumeCopy,
        conn: &mut dyn MigrationConn,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> VesselResult<()>;

    fn backup_volume(
        &self,
        vol: &VolumeCopy,
        writer: &mut dyn Write,
        optimized: bool,
        snap_names: &[String],
        op: &Operation,
    ) -> VesselResult<()>;
}

/// Names of the drivers compiled into this build.
pub fn supported_driver_names() -> Vec<&'static str> {
    vec!["dir", "sim"]
}

/// Instantiate the named driver bound to a pool's configuration.
pub fn load(
    name: &str,
    pool_name: &str,
    pool_config: HashMap<String, String>,
    dirs: StateDirs,
    mounts: MountCounts,
) -> VesselResult<Box<dyn Driver>> {
    match name {
        "dir" => Ok(Box::new(DirDriver::new(pool_name, pool_config, dirs, mounts))),
        "sim" => Ok(Box::new(SimDriver::new(pool_name, pool_config, dirs, mounts))),
        _ => Err(VesselError::NotFound(format!("Storage driver {name:?}"))),
    }
}
