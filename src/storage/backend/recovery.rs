// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The recovery scanner: reconciling a driver's on-disk inventory against
//! the metadata store and reconstructing records for orphaned volumes from
//! their self-describing descriptors.

use std::collections::HashMap;

use crate::{
    storage::{
        backup,
        drivers::{
            snapshot_volume_name, utils, ContentType, Volume, VolumeType,
            CONFIG_BLOCK_FILESYSTEM, CONFIG_BLOCK_MODE,
        },
        instance_content_type, instance_volume_type, project,
        paths::BACKUP_FILE,
        structures::Reverter,
        types::{Instance, Operation},
        volume_type_instance_kind,
    },
    vessel::{VesselError, VesselResult},
};

use super::Backend;

impl Backend {
    /// Walk the driver's on-disk inventory and return reconstructible
    /// descriptors for volumes with no metadata records, grouped by
    /// project.
    pub fn list_unknown_volumes(
        &self,
        op: &Operation,
    ) -> VesselResult<HashMap<String, Vec<backup::Config>>> {
        debug!("ListUnknownVolumes started on pool {}", self.name());

        // One entry per logical volume: a VM's filesystem companion is
        // never listed next to its block volume.
        let pool_vols = self
            .driver()
            .list_volumes()
            .map_err(|err| VesselError::wrap("Failed getting pool volumes", err))?;

        let mut project_vols: HashMap<String, Vec<backup::Config>> = HashMap::new();

        for vol in pool_vols {
            if vol.vol_type() == VolumeType::Vm && vol.content_type() == ContentType::Fs {
                return Err(VesselError::Msg(format!(
                    "Storage driver returned unexpected VM volume with filesystem \
                     content type ({:?})",
                    vol.name()
                )));
            }

            match vol.vol_type() {
                VolumeType::Vm | VolumeType::Container => {
                    self.detect_unknown_instance_volume(&vol, &mut project_vols, op)?;
                }
                VolumeType::Custom => {
                    self.detect_unknown_custom_volume(&vol, &mut project_vols, op)?;
                }
                VolumeType::Image => {}
            }
        }

        debug!("ListUnknownVolumes finished on pool {}", self.name());
        Ok(project_vols)
    }

    /// Detect an orphaned instance volume: parse the descriptor inside the
    /// volume, validate it against the pool, the driver and the on-disk
    /// snapshot set, require the database to know nothing about the
    /// instance, and emit the parsed descriptor.
    fn detect_unknown_instance_volume(
        &self,
        vol: &Volume,
        project_vols: &mut HashMap<String, Vec<backup::Config>>,
        op: &Operation,
    ) -> VesselResult<()> {
        let vol_type = vol.vol_type();
        let (project_name, inst_name) = project::instance_parts(vol.name());

        let inst_id = match self.state().store.get_instance_id(&project_name, &inst_name) {
            Ok(id) => Some(id),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        let inst_snapshots = self
            .state()
            .store
            .get_instance_snapshots_names(&project_name, &inst_name);

        let volume = match self.volume_db_get(&project_name, &inst_name, vol_type) {
            Ok(record) => Some(record),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        match (inst_id, &volume) {
            // Both records present: nothing to recover.
            (Some(_), Some(_)) => return Ok(()),
            (Some(_), None) => {
                return Err(VesselError::Msg(format!(
                    "Instance {inst_name:?} in project {project_name:?} already has \
                     instance DB record"
                )))
            }
            (None, Some(_)) => {
                return Err(VesselError::Msg(format!(
                    "Instance {inst_name:?} in project {project_name:?} already has \
                     storage DB record"
                )))
            }
            (None, None) => {}
        }

        let backup_yaml_path = vol.mount_path().join(BACKUP_FILE);

        // A running instance is already mounted, so prefer reading the
        // descriptor in place without disturbing the mount count.
        let backup_conf = if backup_yaml_path.is_file() {
            backup::read_descriptor(&backup_yaml_path)?
        } else {
            vol.mount_task(self.driver(), op, |mount_path, _| {
                backup::read_descriptor(&mount_path.join(BACKUP_FILE))
            })?
        };

        if let Some(ref pool) = backup_conf.pool {
            if pool.name != self.name() {
                return Err(VesselError::Msg(format!(
                    "Instance {inst_name:?} in project {project_name:?} has pool name \
                     mismatch in its backup file ({:?} doesn't match pool's {:?})",
                    pool.name,
                    self.name()
                )));
            }

            if pool.driver != self.driver().info().name {
                return Err(VesselError::Msg(format!(
                    "Instance {inst_name:?} in project {project_name:?} has pool driver \
                     mismatch in its backup file ({:?} doesn't match pool's {:?})",
                    pool.driver,
                    self.driver().info().name
                )));
            }
        }

        let instance_save = backup_conf.instance.as_ref().ok_or_else(|| {
            VesselError::Msg(format!(
                "Instance {inst_name:?} in project {project_name:?} has no instance \
                 information in its backup file"
            ))
        })?;

        if instance_save.name != inst_name {
            return Err(VesselError::Msg(format!(
                "Instance {inst_name:?} in project {project_name:?} has a different \
                 instance name in its backup file ({:?})",
                instance_save.name
            )));
        }

        if volume_type_instance_kind(vol_type)? != instance_save.kind {
            return Err(VesselError::Msg(format!(
                "Instance {inst_name:?} in project {project_name:?} has a different \
                 instance type in its backup file ({})",
                instance_save.kind
            )));
        }

        let volume_save = backup_conf.volume.as_ref().ok_or_else(|| {
            VesselError::Msg(format!(
                "Instance {inst_name:?} in project {project_name:?} has no volume \
                 information in its backup file"
            ))
        })?;

        if volume_save.name != inst_name {
            return Err(VesselError::Msg(format!(
                "Instance {inst_name:?} in project {project_name:?} has a different \
                 volume name in its backup file ({:?})",
                volume_save.name
            )));
        }

        if volume_save.vol_type != vol_type {
            return Err(VesselError::Msg(format!(
                "Instance {inst_name:?} in project {project_name:?} has a different \
                 volume type in its backup file ({})",
                volume_save.vol_type
            )));
        }

        // The descriptor's snapshot list must agree with the driver's
        // on-disk snapshot set.
        self.check_instance_backup_file_snapshots(&backup_conf, &project_name, op)
            .map_err(|err| {
                VesselError::wrap(
                    format!(
                        "Instance {inst_name:?} in project {project_name:?} has snapshot \
                         inconsistency"
                    ),
                    err,
                )
            })?;

        // No DB records may exist for any of the snapshots either.
        for snap in &backup_conf.snapshots {
            let full_snap_name = snapshot_volume_name(&inst_name, &snap.name);

            if inst_snapshots.iter().any(|name| name == &full_snap_name) {
                return Err(VesselError::Msg(format!(
                    "Instance {inst_name:?} snapshot {:?} in project {project_name:?} \
                     already has instance DB record",
                    snap.name
                )));
            }

            match self.volume_db_get(&project_name, &full_snap_name, vol_type) {
                Ok(_) => {
                    return Err(VesselError::Msg(format!(
                        "Instance {inst_name:?} snapshot {:?} in project {project_name:?} \
                         already has storage DB record",
                        snap.name
                    )))
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        project_vols
            .entry(project_name)
            .or_default()
            .push(backup_conf);
        Ok(())
    }

    /// Detect an orphaned custom volume and synthesize a descriptor for
    /// it. The volume's filesystem is probed when block-backed; snapshots
    /// carry the parent volume's config as a best guess, since nothing on
    /// disk records their own.
    fn detect_unknown_custom_volume(
        &self,
        vol: &Volume,
        project_vols: &mut HashMap<String, Vec<backup::Config>>,
        op: &Operation,
    ) -> VesselResult<()> {
        let (project_name, vol_name) = project::storage_volume_parts(vol.name());

        match self.volume_db_get(&project_name, &vol_name, VolumeType::Custom) {
            // Storage record already exists: nothing to recover.
            Ok(_) => return Ok(()),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let snapshots = self.driver().volume_snapshots(vol, op)?;

        let mut vol = vol.clone();
        if vol.content_type() == ContentType::Fs {
            // Probe the mount for a block-backed volume's filesystem and
            // record it in the config.
            let probed = vol.mount_task(self.driver(), op, |mount_path, _| {
                if mount_path.join(utils::FS_MARKER).is_file() {
                    Ok(Some(utils::probe_filesystem(mount_path)?))
                } else {
                    Ok(None)
                }
            })?;

            if let Some(filesystem) = probed {
                vol.config_mut()
                    .insert(CONFIG_BLOCK_MODE.to_string(), "true".to_string());
                vol.config_mut()
                    .insert(CONFIG_BLOCK_FILESYSTEM.to_string(), filesystem);
            }
        }

        // Best guess: the rest of the config is the driver's defaults.
        self.driver()
            .fill_volume_config(&mut vol)
            .map_err(|err| {
                VesselError::wrap("Failed filling custom volume default config", err)
            })?;

        self.driver()
            .validate_volume(&mut vol, false)
            .map_err(|err| VesselError::wrap("Failed custom volume validation", err))?;

        let mut backup_conf = backup::Config {
            pool: Some(backup::PoolSave {
                name: self.name().to_string(),
                driver: self.driver().info().name.to_string(),
                config: self.config().clone(),
            }),
            instance: None,
            snapshots: Vec::new(),
            volume: Some(backup::VolumeSave {
                name: vol_name.clone(),
                vol_type: VolumeType::Custom,
                content_type: vol.content_type(),
                description: String::new(),
                config: vol.config().clone(),
            }),
            volume_snapshots: Vec::new(),
        };

        for snap_only_name in snapshots {
            backup_conf.volume_snapshots.push(backup::VolumeSnapshotSave {
                name: snap_only_name,
                description: String::new(),
                // Assume the snapshot config matches its parent.
                config: vol.config().clone(),
                expires_at: None,
            });
        }

        project_vols
            .entry(project_name)
            .or_default()
            .push(backup_conf);
        Ok(())
    }

    /// Take an existing on-disk instance volume and restore the records,
    /// mount paths and symlinks needed to make it operational. When
    /// `pool_vol` is given its descriptor provides the volume records.
    /// On the instance's own cluster member the mount state is reconciled
    /// with the instance's running state.
    pub fn import_instance<'a>(
        &'a self,
        inst: &'a dyn Instance,
        pool_vol: Option<&backup::Config>,
        op: &'a Operation,
    ) -> VesselResult<Box<dyn FnOnce() + 'a>> {
        debug!("ImportInstance started for {}", inst.name());

        let vol_type = instance_volume_type(inst.kind());
        let content_type = instance_content_type(inst.kind());

        let snapshots = self
            .state()
            .store
            .get_instance_snapshots_names(inst.project(), inst.name());

        let mut revert = Reverter::new();
        let mut volume_config = HashMap::new();

        if let Some(pool_vol) = pool_vol {
            let volume_save = pool_vol.volume.as_ref().ok_or_else(|| {
                VesselError::Msg("Backup config lacks volume info".to_string())
            })?;
            volume_config = volume_save.config.clone();

            self.volume_db_create(
                inst.project(),
                &volume_save.name,
                "",
                vol_type,
                volume_config.clone(),
                None,
                content_type,
                false,
                true,
            )?;
            {
                let name = volume_save.name.clone();
                revert.add(move || {
                    let _ = self.volume_db_delete(inst.project(), &name, vol_type);
                });
            }

            if !snapshots.is_empty() && !pool_vol.volume_snapshots.is_empty() {
                for snap in &pool_vol.volume_snapshots {
                    let full_snap_name = snapshot_volume_name(&volume_save.name, &snap.name);
                    self.volume_db_create(
                        inst.project(),
                        &full_snap_name,
                        &snap.description,
                        vol_type,
                        snap.config.clone(),
                        None,
                        content_type,
                        false,
                        true,
                    )?;
                    revert.add(move || {
                        let _ = self.volume_db_delete(inst.project(), &full_snap_name, vol_type);
                    });
                }
            } else {
                // Descriptors written before snapshot info was recorded
                // leave only the instance's snapshot list to go by.
                if !snapshots.is_empty() {
                    warn!(
                        "Missing volume snapshot info in backup config, using parent \
                         volume config"
                    );
                }

                for full_snap_name in snapshots.clone() {
                    self.volume_db_create(
                        inst.project(),
                        &full_snap_name,
                        "",
                        vol_type,
                        volume_config.clone(),
                        None,
                        content_type,
                        false,
                        true,
                    )?;
                    revert.add(move || {
                        let _ = self.volume_db_delete(inst.project(), &full_snap_name, vol_type);
                    });
                }
            }
        }

        let storage_name = project::instance(inst.project(), inst.name());
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, volume_config);
        self.apply_instance_root_disk_overrides(inst, &mut vol);
        vol.ensure_mount_path()?;

        // Only the instance's own member reconciles mount state.
        if inst.location() == self.state().member_name {
            debug!("Restoring local instance mount status");

            if inst.is_running() {
                // A running instance implies a mounted volume, but a
                // restarted daemon has no reference count for it; mount to
                // restore the reference.
                if !vol.mount_in_use() {
                    self.mount_instance(inst, op).map_err(|err| {
                        VesselError::wrap("Failed mounting instance", err)
                    })?;
                }
            } else {
                self.unmount_instance(inst, op).map_err(|err| {
                    VesselError::wrap("Failed unmounting instance", err)
                })?;
            }
        }

        self.ensure_instance_symlink(inst.kind(), inst.project(), inst.name(), &vol.mount_path())?;
        revert.add(|| {
            let _ = self.remove_instance_symlink(inst.kind(), inst.project(), inst.name());
            let _ = self.remove_instance_snapshot_symlink_if_unused(
                inst.kind(),
                inst.project(),
                inst.name(),
            );
        });

        if !snapshots.is_empty() {
            for full_snap_name in &snapshots {
                let (_, snap_only) =
                    crate::storage::drivers::parent_and_snapshot_name(full_snap_name);
                let snap_only = snap_only.expect("instance snapshot name");
                debug!("Ensuring instance snapshot mount path for {snap_only}");

                let snap_vol = vol.new_snapshot(snap_only)?;
                snap_vol.ensure_mount_path()?;
            }

            self.ensure_instance_snapshot_symlink(inst.kind(), inst.project(), inst.name())?;
        }

        let cleanup = revert.into_hook();
        debug!("ImportInstance finished for {}", inst.name());
        Ok(cleanup)
    }

    /// Take an existing on-disk custom volume and restore its records and
    /// mount path from a scanner descriptor.
    pub fn import_custom_volume<'a>(
        &'a self,
        project_name: &'a str,
        pool_vol: &backup::Config,
        _op: &Operation,
    ) -> VesselResult<Box<dyn FnOnce() + 'a>> {
        let volume_save = pool_vol.volume.as_ref().ok_or_else(|| {
            VesselError::Msg("Backup config lacks volume info".to_string())
        })?;

        debug!(
            "ImportCustomVolume started for {project_name}/{}",
            volume_save.name
        );

        let mut revert = Reverter::new();

        // Strip unknown config keys: the descriptor may predate config
        // format changes.
        let config = self.volume_db_create(
            project_name,
            &volume_save.name,
            &volume_save.description,
            VolumeType::Custom,
            volume_save.config.clone(),
            None,
            volume_save.content_type,
            true,
            true,
        )?;
        {
            let name = volume_save.name.clone();
            revert.add(move || {
                let _ = self.volume_db_delete(project_name, &name, VolumeType::Custom);
            });
        }

        for snap in &pool_vol.volume_snapshots {
            let full_snap_name = snapshot_volume_name(&volume_save.name, &snap.name);
            self.volume_db_create(
                project_name,
                &full_snap_name,
                &snap.description,
                VolumeType::Custom,
                snap.config.clone(),
                snap.expires_at,
                volume_save.content_type,
                true,
                true,
            )?;
            revert.add(move || {
                let _ = self.volume_db_delete(project_name, &full_snap_name, VolumeType::Custom);
            });
        }

        let storage_name = project::storage_volume(project_name, &volume_save.name);
        let vol = self.get_volume(
            VolumeType::Custom,
            volume_save.content_type,
            &storage_name,
            config,
        );
        vol.ensure_mount_path()?;

        let cleanup = revert.into_hook();
        debug!(
            "ImportCustomVolume finished for {project_name}/{}",
            volume_save.name
        );
        Ok(cleanup)
    }
}
