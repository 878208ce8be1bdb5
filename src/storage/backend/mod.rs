// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The backend: one per pool, binding the pool's configuration to a driver
//! instance and mediating every volume operation.
//!
//! Control flow per operation: validate, take any named locks, update the
//! metadata store, call the driver, and on failure run the LIFO revert
//! chain so the caller observes either the prior state or the success
//! state, never a mixture.

use std::{
    collections::HashMap,
    fs,
    io::{self, Read},
    os::unix::fs::symlink,
    path::Path,
};

use chrono::{DateTime, Utc};

use crate::{
    storage::{
        drivers::{
            self, utils, ContentType, Driver, PoolResources, Volume, VolumeFiller, VolumeType,
        },
        paths::StateDirs,
        project,
        structures::Reverter,
        types::{
            ClientType, InstanceKind, LifecycleEvent, MemberState, Operation, PoolStatus,
            POOL_STATUS_UNAVAILABLE,
        },
        StorageState,
    },
    vessel::{VesselError, VesselResult},
};

mod custom;
mod images;
mod instances;
mod recovery;

pub use self::instances::InstancePostHook;

/// Entity type tag used for pool-scoped warnings in the metadata store.
const WARNING_ENTITY_POOL: &str = "storage-pool";

pub struct Backend {
    id: i64,
    name: String,
    description: String,
    config: HashMap<String, String>,
    status: PoolStatus,
    member_states: HashMap<String, MemberState>,
    driver: Box<dyn Driver>,
    state: StorageState,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver.info().name)
            .field("status", &self.status)
            .finish()
    }
}

/// Load the backend for an existing pool from its metadata record.
pub fn load_by_name(state: &StorageState, name: &str) -> VesselResult<Backend> {
    let record = state.store.get_pool(name)?;
    let driver = drivers::load(
        &record.driver,
        name,
        record.config.clone(),
        state.dirs.clone(),
        state.mounts.clone(),
    )?;

    Ok(Backend {
        id: record.id,
        name: record.name,
        description: record.description,
        config: record.config,
        status: record.status,
        member_states: record.member_states,
        driver,
        state: state.clone(),
    })
}

/// Pool-level entry points: creating and removing pools as a whole.
pub mod pools {
    use super::*;

    /// Create a pool: metadata record first (pending), then the on-disk
    /// layout, then flip the record to created. On failure everything is
    /// reverted and the error returned.
    pub fn create(
        state: &StorageState,
        name: &str,
        description: &str,
        driver_name: &str,
        config: HashMap<String, String>,
        client_type: ClientType,
        op: &Operation,
    ) -> VesselResult<Backend> {
        let mut revert = Reverter::new();

        state
            .store
            .create_pool(name, description, driver_name, config)?;
        {
            let store = state.store.clone();
            let name = name.to_string();
            revert.add(move || {
                if let Err(err) = store.delete_pool(&name) {
                    warn!("Failed reverting pool record {name:?}: {err}");
                }
            });
        }

        let backend = load_by_name(state, name)?;
        backend.create(client_type, op)?;

        state
            .store
            .set_pool_member_state(name, &state.member_name, MemberState::Created)?;
        if client_type == ClientType::Normal {
            state.store.set_pool_status(name, PoolStatus::Created)?;
        }

        revert.success();
        load_by_name(state, name)
    }

    /// Delete a pool: on-disk layout first, then the metadata record.
    pub fn remove(
        state: &StorageState,
        name: &str,
        client_type: ClientType,
        op: &Operation,
    ) -> VesselResult<()> {
        let backend = load_by_name(state, name)?;
        backend.delete(client_type, op)?;
        state.store.delete_pool(name)
    }
}

impl Backend {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn config(&self) -> &HashMap<String, String> {
        &self.config
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub(super) fn state(&self) -> &StorageState {
        &self.state
    }

    /// Cluster-wide pool status.
    pub fn status(&self) -> PoolStatus {
        self.status
    }

    /// Status of the pool on this cluster member. A pool whose mount
    /// failed is reported unavailable without touching the stored status.
    pub fn local_status(&self) -> String {
        if !self.state.availability.is_available(&self.name) {
            return POOL_STATUS_UNAVAILABLE.to_string();
        }

        match self.member_states.get(&self.state.member_name) {
            Some(state) => state.to_string(),
            None => MemberState::Created.to_string(),
        }
    }

    /// Fail with a service-unavailable kind unless the pool is usable on
    /// this member.
    pub fn is_status_ready(&self) -> VesselResult<()> {
        if self.status == PoolStatus::Pending {
            return Err(VesselError::Msg(
                "Specified pool is not fully created".to_string(),
            ));
        }

        if self.local_status() == POOL_STATUS_UNAVAILABLE {
            return Err(VesselError::Unavailable(format!(
                "Storage pool {} is unavailable on this member",
                self.name
            )));
        }

        Ok(())
    }

    /// Validate a storage name: no path separators, no whitespace.
    pub fn validate_name(value: &str) -> VesselResult<()> {
        if value.is_empty() {
            return Err(VesselError::Msg("Storage name cannot be empty".to_string()));
        }

        if value.contains('/') {
            return Err(VesselError::Msg(format!(
                "Storage name {value:?} cannot contain \"/\""
            )));
        }

        if value.chars().any(char::is_whitespace) {
            return Err(VesselError::Msg(format!(
                "Storage name {value:?} cannot contain white space"
            )));
        }

        Ok(())
    }

    pub fn validate(&self, config: &HashMap<String, String>) -> VesselResult<()> {
        self.driver.validate(config)
    }

    /// Build a volume bound to this pool's driver and config.
    pub fn get_volume(
        &self,
        vol_type: VolumeType,
        content_type: ContentType,
        vol_name: &str,
        config: HashMap<String, String>,
    ) -> Volume {
        Volume::new(
            self.driver.info().name,
            &self.name,
            self.config.clone(),
            vol_type,
            content_type,
            vol_name,
            config,
            self.state.dirs.clone(),
            self.state.mounts.clone(),
        )
    }

    pub fn get_resources(&self) -> VesselResult<PoolResources> {
        self.driver.get_resources()
    }

    pub(super) fn dirs(&self) -> &StateDirs {
        &self.state.dirs
    }

    pub(super) fn emit(&self, event: LifecycleEvent) {
        self.state.events.emit(event);
    }

    // Pool lifecycle.

    /// Create the pool layout on the storage device.
    pub fn create(&self, client_type: ClientType, op: &Operation) -> VesselResult<()> {
        debug!("Create started on pool {}", self.name);

        Backend::validate_name(&self.name)?;
        self.driver.validate(&self.config)?;

        let mut revert = Reverter::new();

        let path = self.state.dirs.pool_mount_path(&self.name);
        if path.is_dir() {
            return Err(VesselError::AlreadyExists(format!(
                "Storage pool directory {}",
                path.display()
            )));
        }

        utils::ensure_dir(&path, 0o711)?;
        {
            let path = path.clone();
            revert.add(move || {
                let _ = fs::remove_dir_all(&path);
            });
        }

        if self.driver.info().remote && client_type != ClientType::Normal {
            if !self.driver.info().mounted_root {
                self.create_storage_structure(&path)?;
            }

            // Remote storage: only the initiating member sets it up.
            revert.success();
            debug!("Create finished on pool {}", self.name);
            return Ok(());
        }

        self.driver.create(op)?;
        {
            // Box<dyn Driver> stays with self; revert through a fresh load.
            let state = self.state.clone();
            let name = self.name.clone();
            let op = op.clone();
            revert.add(move || {
                if let Ok(backend) = load_by_name(&state, &name) {
                    let _ = backend.driver.delete(&op);
                }
            });
        }

        let our_mount = self.driver.mount()?;

        self.create_storage_structure(&path)?;

        if our_mount {
            let _ = self.driver.unmount();
        }

        revert.success();
        debug!("Create finished on pool {}", self.name);
        Ok(())
    }

    /// Mount the pool, maintaining the availability cache: a failed mount
    /// marks the pool unavailable on this member, a successful one clears
    /// the mark.
    pub fn mount(&self) -> VesselResult<bool> {
        debug!("Mount started on pool {}", self.name);

        let result = self.mount_inner();
        match &result {
            Ok(_) => self.state.availability.set_available(&self.name),
            Err(_) => self.state.availability.set_unavailable(&self.name),
        }

        debug!("Mount finished on pool {}", self.name);
        result
    }

    fn mount_inner(&self) -> VesselResult<bool> {
        let path = self.state.dirs.pool_mount_path(&self.name);
        if !path.is_dir() {
            utils::ensure_dir(&path, 0o711)?;
        }

        let our_mount = self.driver.mount()?;
        self.create_storage_structure(&path)?;
        Ok(our_mount)
    }

    pub fn unmount(&self) -> VesselResult<bool> {
        debug!("Unmount started on pool {}", self.name);
        let result = self.driver.unmount();
        debug!("Unmount finished on pool {}", self.name);
        result
    }

    /// Update pool description and config.
    pub fn update(
        &mut self,
        client_type: ClientType,
        new_desc: &str,
        new_config: HashMap<String, String>,
        _op: &Operation,
    ) -> VesselResult<()> {
        debug!("Update started on pool {}", self.name);

        self.driver.validate(&new_config)?;

        let (changed, user_only) = detect_changed_config(&self.config, &new_config);

        if changed.contains_key("source") && self.local_status() != MemberState::Pending.to_string()
        {
            return Err(VesselError::Msg(
                "Pool source cannot be changed when not in pending state".to_string(),
            ));
        }

        if let Some(new_size) = changed.get("size") {
            let old_bytes =
                utils::parse_byte_size(self.config.get("size").map_or("", String::as_str))
                    .unwrap_or(0);
            let new_bytes = utils::parse_byte_size(new_size).unwrap_or(0);
            if new_bytes < old_bytes {
                return Err(VesselError::Msg("Pool cannot be shrunk".to_string()));
            }
        }

        if !changed.is_empty()
            && self.status != PoolStatus::Pending
            && self.local_status() != MemberState::Pending.to_string()
            && !user_only
        {
            self.driver.update(&changed)?;
        }

        if client_type == ClientType::Normal
            && (!changed.is_empty() || new_desc != self.description)
        {
            self.state
                .store
                .update_pool(&self.name, new_desc, new_config.clone())?;
            self.description = new_desc.to_string();
            self.config = new_config;
        }

        debug!("Update finished on pool {}", self.name);
        Ok(())
    }

    /// Remove the pool from this member (and, for a normal client, the
    /// storage device).
    pub fn delete(&self, client_type: ClientType, op: &Operation) -> VesselResult<()> {
        debug!("Delete started on pool {}", self.name);

        self.state
            .store
            .delete_warnings(WARNING_ENTITY_POOL, self.id);

        let path = self.state.dirs.pool_mount_path(&self.name);
        if !path.exists() {
            self.state.availability.set_available(&self.name);
            return Ok(());
        }

        if client_type != ClientType::Normal && self.driver.info().remote {
            if self.driver.info().mounted_root {
                self.driver.unmount()?;
            } else {
                // Remote storage may hold leftovers from volumes moved or
                // deleted while this member was offline.
                utils::remove_tree(&path)?;
            }
        } else {
            // Remove left-over image volumes from partial unpacks or
            // recovered pools; listing errors are ignored so pool deletion
            // still proceeds. Non-image volumes must be gone by now and are
            // never removed here.
            if let Ok(vols) = self.driver.list_volumes() {
                for vol in vols {
                    if vol.vol_type() == VolumeType::Image {
                        self.driver.delete_volume(&vol, op).map_err(|err| {
                            VesselError::wrap(
                                format!(
                                    "Failed deleting left over image volume {:?}",
                                    vol.name()
                                ),
                                err,
                            )
                        })?;
                        warn!("Deleted left over image volume {:?}", vol.name());
                    }
                }
            }

            self.driver.delete(op)?;
        }

        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(VesselError::wrap(
                    format!("Failed to remove directory {}", path.display()),
                    err.into(),
                ))
            }
        }

        self.state.availability.set_available(&self.name);
        debug!("Delete finished on pool {}", self.name);
        Ok(())
    }

    /// Run the named patch at backend and driver level.
    pub fn apply_patch(&self, name: &str) -> VesselResult<()> {
        info!("Applying patch {name:?} on pool {}", self.name);
        self.driver.apply_patch(name)
    }

    /// Lay down the per-volume-type directory skeleton for the types the
    /// driver supports.
    fn create_storage_structure(&self, path: &Path) -> VesselResult<()> {
        for vol_type in self.driver.info().volume_types {
            utils::ensure_dir(&path.join(vol_type.dir_name()), 0o711)?;
            utils::ensure_dir(&path.join(vol_type.snapshot_dir_name()), 0o711)?;
        }
        Ok(())
    }

    // Symlink invariants.

    /// Point the canonical instance path at the volume mount path,
    /// atomically replacing any stale symlink.
    pub(super) fn ensure_instance_symlink(
        &self,
        kind: InstanceKind,
        project_name: &str,
        instance_name: &str,
        mount_path: &Path,
    ) -> VesselResult<()> {
        if instance_name.contains('/') {
            return Err(VesselError::Msg(
                "Instance must not be a snapshot".to_string(),
            ));
        }

        let storage_name = project::instance(project_name, instance_name);
        let symlink_path = self.state.dirs.instance_path(kind, &storage_name);
        if let Some(parent) = symlink_path.parent() {
            utils::ensure_dir(parent, 0o711)?;
        }

        // Stale symlinks may point into a different pool.
        if fs::symlink_metadata(&symlink_path).is_ok() {
            fs::remove_file(&symlink_path)?;
        }

        symlink(mount_path, &symlink_path).map_err(|err| {
            VesselError::wrap(
                format!(
                    "Failed to create symlink from {} to {}",
                    mount_path.display(),
                    symlink_path.display()
                ),
                err.into(),
            )
        })?;
        Ok(())
    }

    pub(super) fn remove_instance_symlink(
        &self,
        kind: InstanceKind,
        project_name: &str,
        instance_name: &str,
    ) -> VesselResult<()> {
        let storage_name = project::instance(project_name, instance_name);
        let symlink_path = self.state.dirs.instance_path(kind, &storage_name);
        if fs::symlink_metadata(&symlink_path).is_ok() {
            fs::remove_file(&symlink_path)?;
        }
        Ok(())
    }

    /// Point the canonical snapshot path at the pool's snapshot directory
    /// for the instance. Created only when snapshots exist.
    pub(super) fn ensure_instance_snapshot_symlink(
        &self,
        kind: InstanceKind,
        project_name: &str,
        instance_name: &str,
    ) -> VesselResult<()> {
        let vol_type = crate::storage::instance_volume_type(kind);
        let (parent_name, _) = drivers::parent_and_snapshot_name(instance_name);
        let storage_name = project::instance(project_name, parent_name);

        let symlink_path = self.state.dirs.instance_snapshots_path(kind, &storage_name);
        let target = self
            .state
            .dirs
            .volume_snapshot_dir(&self.name, vol_type, &storage_name);

        if let Some(parent) = symlink_path.parent() {
            utils::ensure_dir(parent, 0o711)?;
        }

        if fs::symlink_metadata(&symlink_path).is_ok() {
            fs::remove_file(&symlink_path)?;
        }

        symlink(&target, &symlink_path).map_err(|err| {
            VesselError::wrap(
                format!(
                    "Failed to create symlink from {} to {}",
                    target.display(),
                    symlink_path.display()
                ),
                err.into(),
            )
        })?;
        Ok(())
    }

    /// Remove the snapshot symlink once the pool's snapshot directory is
    /// gone; a no-op while snapshots remain on disk.
    pub(super) fn remove_instance_snapshot_symlink_if_unused(
        &self,
        kind: InstanceKind,
        project_name: &str,
        instance_name: &str,
    ) -> VesselResult<()> {
        let vol_type = crate::storage::instance_volume_type(kind);
        let (parent_name, _) = drivers::parent_and_snapshot_name(instance_name);
        let storage_name = project::instance(project_name, parent_name);

        let symlink_path = self.state.dirs.instance_snapshots_path(kind, &storage_name);
        let target = self
            .state
            .dirs
            .volume_snapshot_dir(&self.name, vol_type, &storage_name);

        if !target.exists() && fs::symlink_metadata(&symlink_path).is_ok() {
            fs::remove_file(&symlink_path)?;
        }

        Ok(())
    }

    // Volume record helpers.

    /// Validate a volume's config and create its metadata record in one
    /// transaction. When `has_source` is false the driver fills config
    /// defaults first; when `remove_unknown_keys` is set, keys the driver
    /// does not recognize are stripped (imports from foreign pools).
    /// Returns the final persisted config.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn volume_db_create(
        &self,
        project_name: &str,
        vol_name: &str,
        description: &str,
        vol_type: VolumeType,
        config: HashMap<String, String>,
        expires_at: Option<DateTime<Utc>>,
        content_type: ContentType,
        remove_unknown_keys: bool,
        has_source: bool,
    ) -> VesselResult<HashMap<String, String>> {
        let storage_name = project::instance(project_name, vol_name);
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, config);
        vol.set_has_source(has_source);

        if !has_source {
            self.driver.fill_volume_config(&mut vol)?;
        }

        self.driver.validate_volume(&mut vol, remove_unknown_keys)?;

        let record = crate::storage::db::VolumeRecord {
            pool_id: self.id,
            project: project_name.to_string(),
            name: vol_name.to_string(),
            vol_type,
            content_type,
            description: description.to_string(),
            config: vol.config().clone(),
            created_at: Utc::now(),
            expires_at,
        };
        self.state.store.create_volume(record)?;

        Ok(vol.config().clone())
    }

    pub(super) fn volume_db_get(
        &self,
        project_name: &str,
        vol_name: &str,
        vol_type: VolumeType,
    ) -> VesselResult<crate::storage::db::VolumeRecord> {
        self.state
            .store
            .get_volume(self.id, project_name, vol_name, vol_type)
    }

    pub(super) fn volume_db_delete(
        &self,
        project_name: &str,
        vol_name: &str,
        vol_type: VolumeType,
    ) -> VesselResult<()> {
        self.state
            .store
            .delete_volume(self.id, project_name, vol_name, vol_type)
    }

    pub(super) fn volume_db_snapshots_get(
        &self,
        project_name: &str,
        vol_name: &str,
        vol_type: VolumeType,
    ) -> Vec<crate::storage::db::VolumeRecord> {
        self.state
            .store
            .volume_snapshots(self.id, project_name, vol_name, vol_type)
    }

    // Fillers.

    /// A filler unpacking the local image archive for a fingerprint:
    /// tree-stream archives for filesystem payloads, raw bytes into the
    /// root disk for block payloads. Reports the unpacked size.
    pub(super) fn image_filler(&self, fingerprint: &str) -> VolumeFiller<'static> {
        let image_path = self.state.dirs.image_file(fingerprint);
        VolumeFiller::new(
            Some(fingerprint.to_string()),
            move |vol, root_block_path, _allow_unsafe_resize| {
                let mut file = fs::File::open(&image_path).map_err(|err| {
                    VesselError::wrap(
                        format!("Failed opening image file {}", image_path.display()),
                        err.into(),
                    )
                })?;

                match root_block_path {
                    Some(block_path) if vol.content_type() == ContentType::Block => {
                        let mut out = fs::File::create(block_path)?;
                        Ok(io::copy(&mut file, &mut out)?)
                    }
                    _ => {
                        let op = Operation::new();
                        drivers::stream::recv_tree(&mut file, &vol.mount_path(), &op)
                    }
                }
            },
        )
    }

    /// A filler copying an ISO stream into the volume's payload file.
    pub(super) fn iso_filler<'a>(&self, data: &'a mut dyn Read) -> VolumeFiller<'a> {
        VolumeFiller::new(None, move |_vol, root_block_path, _allow_unsafe_resize| {
            let block_path = root_block_path.ok_or_else(|| {
                VesselError::Msg("ISO filler requires a root block path".to_string())
            })?;
            let mut out = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(block_path)?;
            Ok(io::copy(&mut *data, &mut out)?)
        })
    }

    /// Whether any volume records other than cached image volumes remain
    /// on this pool.
    pub fn is_used(&self) -> bool {
        self.state.store.pool_volume_count(self.id, true) > 0
    }

    /// The size in bytes of an instance's root disk block device.
    pub(super) fn instance_disk_block_size(
        &self,
        vol: &Volume,
    ) -> VesselResult<u64> {
        let disk_path = self.driver.volume_disk_path(vol)?;
        Ok(fs::metadata(disk_path)?.len())
    }

    pub(super) fn local_image_file_exists(&self, fingerprint: &str) -> bool {
        self.state.dirs.image_file(fingerprint).is_file()
    }
}

/// Diff two config maps into the set of changed keys (removed keys map to
/// an empty value) and whether only `user.*` keys changed.
pub(super) fn detect_changed_config(
    cur: &HashMap<String, String>,
    new: &HashMap<String, String>,
) -> (HashMap<String, String>, bool) {
    let mut changed = HashMap::new();
    let mut user_only = true;

    for (key, value) in new {
        if cur.get(key) != Some(value) {
            if !key.starts_with("user.") {
                user_only = false;
            }
            changed.insert(key.clone(), value.clone());
        }
    }

    for key in cur.keys() {
        if !new.contains_key(key) {
            if !key.starts_with("user.") {
                user_only = false;
            }
            changed.insert(key.clone(), String::new());
        }
    }

    (changed, user_only)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Changed-config diffing reports removals and the user-only flag.
    fn changed_config_diff() {
        let cur = HashMap::from([
            ("size".to_string(), "10GiB".to_string()),
            ("user.note".to_string(), "a".to_string()),
        ]);

        let new = HashMap::from([("user.note".to_string(), "b".to_string())]);
        let (changed, user_only) = detect_changed_config(&cur, &new);
        assert_eq!(changed.get("size").unwrap(), "");
        assert_eq!(changed.get("user.note").unwrap(), "b");
        assert!(!user_only);

        let new = HashMap::from([
            ("size".to_string(), "10GiB".to_string()),
            ("user.note".to_string(), "b".to_string()),
        ]);
        let (changed, user_only) = detect_changed_config(&cur, &new);
        assert_eq!(changed.len(), 1);
        assert!(user_only);
    }

    #[test]
    /// Name validation refuses separators and whitespace.
    fn name_validation() {
        assert!(Backend::validate_name("pool1").is_ok());
        assert_matches!(Backend::validate_name("a/b"), Err(VesselError::Msg(_)));
        assert_matches!(Backend::validate_name("a b"), Err(VesselError::Msg(_)));
        assert_matches!(Backend::validate_name(""), Err(VesselError::Msg(_)));
    }
}
