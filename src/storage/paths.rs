// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The on-disk layout contract.
//!
//! All paths hang off an injected state root rather than a process-wide
//! constant so that embedders and tests can relocate the whole tree:
//!
//! ```text
//! <root>/storage-pools/<pool>/                   pool mount path
//! <root>/storage-pools/<pool>/<type>/<vol>       volume mount path
//! <root>/storage-pools/<pool>/<type>-snapshots/<vol>/<snap>
//! <root>/containers/<name>                       instance symlink
//! <root>/virtual-machines/<name>                 instance symlink
//! <root>/snapshots/<type>/<name>                 snapshot symlink
//! <root>/images/<fingerprint>                    local image archive
//! ```

use std::path::{Path, PathBuf};

use crate::storage::{
    drivers::VolumeType,
    types::InstanceKind,
};

/// Directory holding pool mount paths, relative to the state root.
pub const STORAGE_POOLS_DIR: &str = "storage-pools";

/// Directory holding local image archive files, relative to the state root.
pub const IMAGES_DIR: &str = "images";

/// Directory holding instance snapshot symlinks, relative to the state root.
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Name of the self-describing descriptor inside a volume mount.
pub const BACKUP_FILE: &str = "backup.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDirs {
    root: PathBuf,
}

impl StateDirs {
    pub fn new<P>(root: P) -> StateDirs
    where
        P: Into<PathBuf>,
    {
        StateDirs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn storage_pools(&self) -> PathBuf {
        self.root.join(STORAGE_POOLS_DIR)
    }

    /// The mount path for a pool.
    pub fn pool_mount_path(&self, pool: &str) -> PathBuf {
        self.storage_pools().join(pool)
    }

    /// The mount path for a volume, or for a snapshot when the storage name
    /// is of the `parent/snap` form.
    pub fn volume_mount_path(&self, pool: &str, vol_type: VolumeType, vol_name: &str) -> PathBuf {
        match vol_name.split_once('/') {
            Some((parent, snap)) => self
                .pool_mount_path(pool)
                .join(vol_type.snapshot_dir_name())
                .join(parent)
                .join(snap),
            None => self
                .pool_mount_path(pool)
                .join(vol_type.dir_name())
                .join(vol_name),
        }
    }

    /// The directory holding all snapshot mounts of a volume.
    pub fn volume_snapshot_dir(&self, pool: &str, vol_type: VolumeType, vol_name: &str) -> PathBuf {
        let parent = vol_name.split_once('/').map_or(vol_name, |(p, _)| p);
        self.pool_mount_path(pool)
            .join(vol_type.snapshot_dir_name())
            .join(parent)
    }

    /// The canonical instance path that symlinks to the volume mount path.
    pub fn instance_path(&self, kind: InstanceKind, storage_name: &str) -> PathBuf {
        let dir = match kind {
            InstanceKind::Container => VolumeType::Container.dir_name(),
            InstanceKind::VirtualMachine => VolumeType::Vm.dir_name(),
        };
        self.root.join(dir).join(storage_name)
    }

    /// The canonical snapshot path that symlinks to the pool's snapshot
    /// directory for an instance.
    pub fn instance_snapshots_path(&self, kind: InstanceKind, storage_name: &str) -> PathBuf {
        let dir = match kind {
            InstanceKind::Container => VolumeType::Container.dir_name(),
            InstanceKind::VirtualMachine => VolumeType::Vm.dir_name(),
        };
        self.root.join(SNAPSHOTS_DIR).join(dir).join(storage_name)
    }

    pub fn images(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// The local archive file for an image fingerprint.
    pub fn image_file(&self, fingerprint: &str) -> PathBuf {
        self.images().join(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Snapshot storage names resolve under the type's snapshot directory.
    fn snapshot_mount_path() {
        let dirs = StateDirs::new("/var/lib/vesseld");
        assert_eq!(
            dirs.volume_mount_path("p1", VolumeType::Container, "c1/snap0"),
            PathBuf::from("/var/lib/vesseld/storage-pools/p1/containers-snapshots/c1/snap0")
        );
        assert_eq!(
            dirs.volume_mount_path("p1", VolumeType::Container, "c1"),
            PathBuf::from("/var/lib/vesseld/storage-pools/p1/containers/c1")
        );
    }

    #[test]
    /// The snapshot dir of a snapshot name and of its parent agree.
    fn snapshot_dir_agrees() {
        let dirs = StateDirs::new("/s");
        assert_eq!(
            dirs.volume_snapshot_dir("p", VolumeType::Custom, "v1/s1"),
            dirs.volume_snapshot_dir("p", VolumeType::Custom, "v1"),
        );
    }
}
