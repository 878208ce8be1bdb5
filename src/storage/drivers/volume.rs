// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::HashMap, path::Path, path::PathBuf};

use crate::{
    storage::{
        drivers::{
            utils, ContentType, Driver, MountCounts, VolumeType, CONFIG_BLOCK_MODE,
            CONFIG_SIZE, CONFIG_SIZE_STATE, CONFIG_VOLATILE_ROOTFS_SIZE, POOL_CONFIG_VOLUME_SIZE,
        },
        paths::StateDirs,
        types::Operation,
    },
    vessel::{VesselError, VesselResult},
};

/// Build the full volume name of a snapshot.
pub fn snapshot_volume_name(parent: &str, snap: &str) -> String {
    format!("{parent}/{snap}")
}

/// Split a volume name into its parent and optional snapshot suffix.
pub fn parent_and_snapshot_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once('/') {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

/// A volume as the drivers see it: type, content type, storage name,
/// configuration, and the pool configuration it inherits defaults from.
///
/// Snapshots are ordinary volumes whose name carries the `parent/snap`
/// form; they reference their parent by name only.
#[derive(Debug, Clone)]
pub struct Volume {
    driver_name: String,
    pool: String,
    pool_config: HashMap<String, String>,
    vol_type: VolumeType,
    content_type: ContentType,
    name: String,
    config: HashMap<String, String>,
    dirs: StateDirs,
    mounts: MountCounts,
    has_source: bool,
}

impl Volume {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_name: &str,
        pool: &str,
        pool_config: HashMap<String, String>,
        vol_type: VolumeType,
        content_type: ContentType,
        name: &str,
        config: HashMap<String, String>,
        dirs: StateDirs,
        mounts: MountCounts,
    ) -> Volume {
        Volume {
            driver_name: driver_name.to_string(),
            pool: pool.to_string(),
            pool_config,
            vol_type,
            content_type,
            name: name.to_string(),
            config,
            dirs,
            mounts,
            has_source: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn vol_type(&self) -> VolumeType {
        self.vol_type
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn config(&self) -> &HashMap<String, String> {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.config
    }

    pub fn pool_config(&self) -> &HashMap<String, String> {
        &self.pool_config
    }

    pub fn is_snapshot(&self) -> bool {
        self.name.contains('/')
    }

    /// Whether this is a VM root disk: the block volume that logically
    /// carries a config-filesystem companion.
    pub fn is_vm_block(&self) -> bool {
        self.vol_type == VolumeType::Vm && self.content_type == ContentType::Block
    }

    /// Whether the payload lives on a block device: block content always,
    /// filesystem content when the driver put it in block-backed mode.
    pub fn is_block_backed(&self) -> bool {
        self.content_type == ContentType::Block
            || self
                .config
                .get(CONFIG_BLOCK_MODE)
                .map(|v| v == "true")
                .unwrap_or(false)
    }

    /// Whether the volume was created from an existing source (copy,
    /// migration, backup) rather than from driver defaults.
    pub fn has_source(&self) -> bool {
        self.has_source
    }

    pub fn set_has_source(&mut self, has_source: bool) {
        self.has_source = has_source;
    }

    /// The mount path of this volume within its pool.
    pub fn mount_path(&self) -> PathBuf {
        self.dirs
            .volume_mount_path(&self.pool, self.vol_type, &self.name)
    }

    /// The directory holding this volume's snapshot mounts.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.dirs
            .volume_snapshot_dir(&self.pool, self.vol_type, &self.name)
    }

    /// Create the mount path if missing.
    pub fn ensure_mount_path(&self) -> VesselResult<()> {
        utils::ensure_dir(&self.mount_path(), 0o711)
    }

    /// The same volume under a different storage name.
    pub fn with_name(&self, name: &str) -> Volume {
        let mut vol = self.clone();
        vol.name = name.to_string();
        vol
    }

    /// Derive the snapshot volume named `snap_name` of this volume.
    pub fn new_snapshot(&self, snap_name: &str) -> VesselResult<Volume> {
        if self.is_snapshot() {
            return Err(VesselError::Msg(format!(
                "Volume {} is a snapshot, cannot derive another snapshot from it",
                self.name
            )));
        }

        let mut snap = self.clone();
        snap.name = snapshot_volume_name(&self.name, snap_name);
        Ok(snap)
    }

    /// Derive the config-filesystem companion of a VM block volume. Quotas
    /// applied to the primary volume are also applied to the companion.
    pub fn new_vm_block_filesystem_volume(&self) -> Volume {
        let mut fs_vol = self.clone();
        fs_vol.content_type = ContentType::Fs;
        if let Some(state_size) = self.config.get(CONFIG_SIZE_STATE) {
            fs_vol.config.insert(CONFIG_SIZE.to_string(), state_size.clone());
        } else {
            fs_vol.config.remove(CONFIG_SIZE);
        }
        fs_vol
    }

    /// The effective size quota: the volume's own `size`, falling back to
    /// the pool's default for new volumes.
    pub fn config_size(&self) -> String {
        self.config
            .get(CONFIG_SIZE)
            .or_else(|| self.pool_config.get(POOL_CONFIG_VOLUME_SIZE))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_config_size(&mut self, size: &str) {
        if size.is_empty() {
            self.config.remove(CONFIG_SIZE);
        } else {
            self.config.insert(CONFIG_SIZE.to_string(), size.to_string());
        }
    }

    pub fn set_config_state_size(&mut self, size: &str) {
        if size.is_empty() {
            self.config.remove(CONFIG_SIZE_STATE);
        } else {
            self.config
                .insert(CONFIG_SIZE_STATE.to_string(), size.to_string());
        }
    }

    /// Compute the size a new volume copied from `src` should get.
    ///
    /// The source's `volatile.rootfs.size` records the unpacked size of an
    /// image volume and acts as a floor: without it an image-backed clone
    /// could be mistakenly shrunk to the pool default. An explicit `size`
    /// set on this volume wins over the floor, letting the caller request a
    /// smaller volume and take the shrink path knowingly.
    pub fn config_size_from_source(&self, src: &Volume) -> VesselResult<String> {
        let new_size = self.config_size();

        let src_floor = match src.config.get(CONFIG_VOLATILE_ROOTFS_SIZE) {
            Some(floor) if !floor.is_empty() => floor.clone(),
            _ => return Ok(new_size),
        };

        if new_size.is_empty() {
            return Ok(src_floor);
        }

        let new_bytes = utils::parse_byte_size(&new_size)?;
        let floor_bytes = utils::parse_byte_size(&src_floor)?;

        if floor_bytes > new_bytes && !self.config.contains_key(CONFIG_SIZE) {
            return Ok(src_floor);
        }

        Ok(new_size)
    }

    pub(in crate::storage) fn state_dirs(&self) -> &StateDirs {
        &self.dirs
    }

    fn mount_key(&self) -> String {
        format!("{}/{}/{}", self.pool, self.vol_type, self.name)
    }

    /// Whether an external reference currently holds the volume mounted.
    pub fn mount_in_use(&self) -> bool {
        self.mounts.count(&self.mount_key()) > 0
    }

    pub(in crate::storage) fn mount_ref_increment(&self) -> u32 {
        self.mounts.increment(&self.mount_key())
    }

    pub(in crate::storage) fn mount_ref_decrement(&self) -> u32 {
        self.mounts.decrement(&self.mount_key())
    }

    /// Run `f` with the volume mounted, releasing the mount on every exit
    /// path.
    pub fn mount_task<T, F>(&self, driver: &dyn Driver, op: &Operation, f: F) -> VesselResult<T>
    where
        F: FnOnce(&Path, &Operation) -> VesselResult<T>,
    {
        if self.is_snapshot() {
            driver.mount_volume_snapshot(self, op)?;
        } else {
            driver.mount_volume(self, op)?;
        }

        let result = f(&self.mount_path(), op);

        let unmount_result = if self.is_snapshot() {
            driver.unmount_volume_snapshot(self, op).map(|_| ())
        } else {
            driver.unmount_volume(self, false, op).map(|_| ())
        };

        match (result, unmount_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), unmount) => {
                if let Err(unmount_err) = unmount {
                    warn!("Failed releasing mount of {}: {unmount_err}", self.name);
                }
                Err(err)
            }
        }
    }
}

/// A parent volume bundled with its ordered snapshot list, used as input
/// to copy, refresh, migrate and backup primitives. A bundle by value, not
/// a graph: snapshots reference the parent by name.
#[derive(Debug, Clone)]
pub struct VolumeCopy {
    pub volume: Volume,
    /// Snapshot volumes, oldest first.
    pub snapshots: Vec<Volume>,
}

impl VolumeCopy {
    pub fn new(volume: Volume, snapshots: Vec<Volume>) -> VolumeCopy {
        VolumeCopy { volume, snapshots }
    }
}

/// Populates a new volume from an external source during creation.
///
/// Drivers call `fill` with the volume, the root block path for block
/// content, and the unsafe-resize flag; the filler records the number of
/// bytes it unpacked in `size` so the backend can persist it as
/// `volatile.rootfs.size` on image volumes.
pub struct VolumeFiller<'a> {
    pub fingerprint: Option<String>,
    fill: Box<dyn FnMut(&Volume, Option<&Path>, bool) -> VesselResult<u64> + 'a>,
    pub size: u64,
}

impl<'a> VolumeFiller<'a> {
    pub fn new<F>(fingerprint: Option<String>, fill: F) -> VolumeFiller<'a>
    where
        F: FnMut(&Volume, Option<&Path>, bool) -> VesselResult<u64> + 'a,
    {
        VolumeFiller {
            fingerprint,
            fill: Box::new(fill),
            size: 0,
        }
    }

    pub fn fill(
        &mut self,
        vol: &Volume,
        root_block_path: Option<&Path>,
        allow_unsafe_resize: bool,
    ) -> VesselResult<()> {
        self.size = (self.fill)(vol, root_block_path, allow_unsafe_resize)?;
        Ok(())
    }
}

impl std::fmt::Debug for VolumeFiller<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeFiller")
            .field("fingerprint", &self.fingerprint)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_volume(config: &[(&str, &str)], pool_config: &[(&str, &str)]) -> Volume {
        Volume::new(
            "dir",
            "p1",
            pool_config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            VolumeType::Container,
            ContentType::Fs,
            "c1",
            config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            StateDirs::new("/s"),
            MountCounts::default(),
        )
    }

    #[test]
    /// A snapshot of a snapshot is refused.
    fn snapshot_of_snapshot_refused() {
        let vol = test_volume(&[], &[]);
        let snap = vol.new_snapshot("s1").unwrap();
        assert_eq!(snap.name(), "c1/s1");
        assert!(snap.is_snapshot());
        assert_matches!(snap.new_snapshot("s2"), Err(VesselError::Msg(_)));
    }

    #[test]
    /// The source's rootfs size acts as a floor unless an explicit size is
    /// set on the new volume.
    fn size_from_source_honors_floor() {
        let src = {
            let mut vol = test_volume(&[], &[]);
            vol.config_mut().insert(
                CONFIG_VOLATILE_ROOTFS_SIZE.to_string(),
                "10GiB".to_string(),
            );
            vol
        };

        // Pool default smaller than the unpacked image: floor wins.
        let vol = test_volume(&[], &[("volume.size", "5GiB")]);
        assert_eq!(vol.config_size_from_source(&src).unwrap(), "10GiB");

        // Explicit volume size wins even when smaller.
        let vol = test_volume(&[("size", "5GiB")], &[]);
        assert_eq!(vol.config_size_from_source(&src).unwrap(), "5GiB");

        // No floor recorded: the pool default stands.
        let plain_src = test_volume(&[], &[]);
        let vol = test_volume(&[], &[("volume.size", "5GiB")]);
        assert_eq!(vol.config_size_from_source(&plain_src).unwrap(), "5GiB");
    }

    #[test]
    /// The VM config companion mirrors `size.state` into its own quota.
    fn vm_companion_size() {
        let mut vol = test_volume(&[("size", "10GiB")], &[]);
        vol.vol_type = VolumeType::Vm;
        vol.content_type = ContentType::Block;
        vol.set_config_state_size("500MiB");

        let fs_vol = vol.new_vm_block_filesystem_volume();
        assert_eq!(fs_vol.content_type(), ContentType::Fs);
        assert_eq!(fs_vol.config().get(CONFIG_SIZE).unwrap(), "500MiB");
    }
}
