// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Instance volume operations: create (empty, from image, from copy, from
//! migration, from backup), refresh, rename, delete, restore, quota,
//! mount, snapshots and backup.

use std::{
    collections::HashMap,
    io::Read,
    thread,
};

use crate::{
    storage::{
        backup::{self, RestoreInfo},
        drivers::{
            parent_and_snapshot_name, snapshot_volume_name, ContentType, Volume, VolumeCopy,
            VolumeType, CONFIG_SIZE,
        },
        instance_content_type, instance_volume_type,
        migration::{
            self, fallback_migration_type, match_types, MigrationConn, Protocol,
            VolumeSourceArgs, VolumeTargetArgs, INDEX_HEADER_VERSION,
        },
        project,
        structures::{operation_lock_name, pipe_pair, Cancel, Reverter},
        types::{
            Instance, LifecycleEvent, MountInfo, Operation, TemplateTrigger,
        },
    },
    vessel::{VesselError, VesselResult},
};

use super::Backend;

/// Hook returned by `create_instance_from_backup`: run it once the
/// restored instance has a database identity to create the volume records
/// and finish driver-side setup.
pub type InstancePostHook<'a> = Box<dyn FnOnce(&dyn Instance) -> VesselResult<()> + 'a>;

/// Unfreezes the instance when dropped.
struct FreezeGuard<'a>(&'a dyn Instance);

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.unfreeze() {
            warn!("Failed unfreezing instance {}: {err}", self.0.name());
        }
    }
}

fn instance_types(inst: &dyn Instance) -> (VolumeType, ContentType) {
    (
        instance_volume_type(inst.kind()),
        instance_content_type(inst.kind()),
    )
}

impl Backend {
    fn instance_storage_name(&self, inst: &dyn Instance) -> String {
        project::instance(inst.project(), inst.name())
    }

    pub(super) fn apply_instance_root_disk_overrides(&self, inst: &dyn Instance, vol: &mut Volume) {
        if let Some(size) = inst.root_disk_size() {
            vol.set_config_size(&size);
        }
        if let Some(state_size) = inst.root_disk_state_size() {
            vol.set_config_state_size(&state_size);
        }
    }

    /// Freeze a running instance when the source driver cannot take a
    /// consistent copy of a live volume. Returns a guard that unfreezes.
    fn freeze_for_consistency<'i>(
        &self,
        src_pool: &Backend,
        src: &'i dyn Instance,
        allow_inconsistent: bool,
    ) -> VesselResult<Option<FreezeGuard<'i>>> {
        if src.is_snapshot()
            || !src_pool.driver().info().running_copy_freeze
            || !src.is_running()
            || src.is_frozen()
            || allow_inconsistent
        {
            return Ok(None);
        }

        info!("Freezing instance {} for consistent copy", src.name());
        src.freeze()?;
        Ok(Some(FreezeGuard(src)))
    }

    /// Create an empty instance volume.
    pub fn create_instance(&self, inst: &dyn Instance, op: &Operation) -> VesselResult<()> {
        debug!("CreateInstance started for {}", inst.name());
        self.is_status_ready()?;

        let (vol_type, content_type) = instance_types(inst);
        let mut revert = Reverter::new();

        let config = self.volume_db_create(
            inst.project(),
            inst.name(),
            "",
            vol_type,
            HashMap::new(),
            None,
            content_type,
            false,
            false,
        )?;
        revert.add(|| {
            let _ = self.volume_db_delete(inst.project(), inst.name(), vol_type);
        });

        let storage_name = self.instance_storage_name(inst);
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, config);
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        self.driver().create_volume(&vol, None, op)?;
        {
            let vol = vol.clone();
            revert.add(move || {
                let _ = self.driver().delete_volume(&vol, op);
            });
        }

        self.ensure_instance_symlink(inst.kind(), inst.project(), inst.name(), &vol.mount_path())?;
        inst.template_apply(TemplateTrigger::Create)?;

        self.emit(LifecycleEvent::StorageVolumeCreated {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            vol_type: vol_type.to_string(),
        });

        revert.success();
        debug!("CreateInstance finished for {}", inst.name());
        Ok(())
    }

    /// Create an instance volume populated from an image.
    ///
    /// On drivers with optimized images the cached image volume is ensured
    /// first and cloned; when the clone cannot be shrunk to the requested
    /// size the image is unpacked directly into a new volume instead.
    pub fn create_instance_from_image(
        &self,
        inst: &dyn Instance,
        fingerprint: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "CreateInstanceFromImage started for {} from {fingerprint}",
            inst.name()
        );
        self.is_status_ready()?;

        let (vol_type, content_type) = instance_types(inst);
        let mut revert = Reverter::new();

        let config = self.volume_db_create(
            inst.project(),
            inst.name(),
            "",
            vol_type,
            HashMap::new(),
            None,
            content_type,
            false,
            false,
        )?;
        revert.add(|| {
            let _ = self.volume_db_delete(inst.project(), inst.name(), vol_type);
        });

        let storage_name = self.instance_storage_name(inst);
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, config);
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        if !self.driver().info().optimized_images {
            let mut filler = self.image_filler(fingerprint);
            self.driver().create_volume(&vol, Some(&mut filler), op)?;
        } else {
            self.ensure_image(fingerprint, op)?;

            let img_record =
                self.volume_db_get(project::DEFAULT_PROJECT, fingerprint, VolumeType::Image)?;
            let img_vol = self.get_volume(
                VolumeType::Image,
                content_type,
                fingerprint,
                img_record.config,
            );

            // Respect an oversized cached image so the clone is not
            // mistakenly shrunk.
            let new_size = vol.config_size_from_source(&img_vol)?;
            vol.set_config_size(&new_size);

            let vol_copy = VolumeCopy::new(vol.clone(), Vec::new());
            let img_copy = VolumeCopy::new(img_vol, Vec::new());

            match self
                .driver()
                .create_volume_from_copy(&vol_copy, &img_copy, false, op)
            {
                Err(err) if err.is_cannot_be_shrunk() => {
                    debug!(
                        "Cached image volume is larger than the new volume and cannot \
                         be shrunk, creating non-optimized volume"
                    );
                    let mut filler = self.image_filler(fingerprint);
                    self.driver().create_volume(&vol, Some(&mut filler), op)?;
                }
                Err(err) => return Err(err),
                Ok(()) => {}
            }
        }
        {
            let vol = vol.clone();
            revert.add(move || {
                let _ = self.driver().delete_volume(&vol, op);
            });
        }

        self.ensure_instance_symlink(inst.kind(), inst.project(), inst.name(), &vol.mount_path())?;
        inst.template_apply(TemplateTrigger::Create)?;

        self.emit(LifecycleEvent::StorageVolumeCreated {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            vol_type: vol_type.to_string(),
        });

        revert.success();
        debug!("CreateInstanceFromImage finished for {}", inst.name());
        Ok(())
    }

    /// Copy an instance volume (and optionally its snapshots). Same-pool
    /// copies go straight to the driver; cross-pool copies run the
    /// migration engine over an in-process pipe pair.
    pub fn create_instance_from_copy(
        &self,
        inst: &dyn Instance,
        src: &dyn Instance,
        src_pool: &Backend,
        snapshots: bool,
        allow_inconsistent: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "CreateInstanceFromCopy started for {} from {}",
            inst.name(),
            src.name()
        );
        self.is_status_ready()?;

        if inst.kind() != src.kind() {
            return Err(VesselError::Msg("Instance types must match".to_string()));
        }

        let (vol_type, content_type) = instance_types(inst);

        let mut src_config = src_pool.generate_instance_backup_config(src, true, op)?;

        // Source snapshot volumes from the backup config, before it is
        // trimmed for a volume-only copy.
        let source_snapshots: Vec<Volume> = src_config
            .volume_snapshots
            .iter()
            .map(|snap| {
                let full = snapshot_volume_name(src.name(), &snap.name);
                src_pool.get_volume(
                    vol_type,
                    content_type,
                    &project::instance(src.project(), &full),
                    snap.config.clone(),
                )
            })
            .collect();

        if !snapshots {
            src_config.snapshots.clear();
            src_config.volume_snapshots.clear();
        }

        let snapshot_names: Vec<String> = if snapshots {
            src_config
                .volume_snapshots
                .iter()
                .map(|snap| snap.name.clone())
                .collect()
        } else {
            Vec::new()
        };

        let storage_name = self.instance_storage_name(inst);
        let volume_config = src_config
            .volume
            .as_ref()
            .map(|v| v.config.clone())
            .unwrap_or_default();
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, volume_config);

        if self.driver().has_volume(&vol)? {
            return Err(VesselError::AlreadyExists(format!(
                "Volume {} on target storage",
                vol.name()
            )));
        }

        let mut revert = Reverter::new();
        let _freeze = self.freeze_for_consistency(src_pool, src, allow_inconsistent)?;

        if self.name() == src_pool.name() {
            debug!("CreateInstanceFromCopy same-pool mode detected");

            let src_storage_name = project::instance(src.project(), src.name());
            let src_vol = self.get_volume(
                vol_type,
                content_type,
                &src_storage_name,
                src_config
                    .volume
                    .as_ref()
                    .map(|v| v.config.clone())
                    .unwrap_or_default(),
            );

            self.volume_db_create(
                inst.project(),
                inst.name(),
                "",
                vol_type,
                vol.config().clone(),
                None,
                content_type,
                false,
                true,
            )?;
            revert.add(|| {
                let _ = self.volume_db_delete(inst.project(), inst.name(), vol_type);
            });

            let mut target_snapshots = Vec::with_capacity(snapshot_names.len());
            for snap in &src_config.volume_snapshots {
                let new_snap_name = snapshot_volume_name(inst.name(), &snap.name);
                self.volume_db_create(
                    inst.project(),
                    &new_snap_name,
                    &snap.description,
                    vol_type,
                    snap.config.clone(),
                    snap.expires_at,
                    content_type,
                    false,
                    true,
                )?;
                {
                    let new_snap_name = new_snap_name.clone();
                    revert.add(move || {
                        let _ = self.volume_db_delete(inst.project(), &new_snap_name, vol_type);
                    });
                }

                target_snapshots.push(self.get_volume(
                    vol_type,
                    content_type,
                    &project::instance(inst.project(), &new_snap_name),
                    snap.config.clone(),
                ));
            }

            self.apply_instance_root_disk_overrides(inst, &mut vol);

            let vol_copy = VolumeCopy::new(vol.clone(), target_snapshots);
            let src_copy = VolumeCopy::new(src_vol, source_snapshots);
            self.driver()
                .create_volume_from_copy(&vol_copy, &src_copy, allow_inconsistent, op)?;
            revert.add(|| {
                let _ = self.driver().delete_volume(&vol, op);
            });
        } else {
            debug!("CreateInstanceFromCopy cross-pool mode detected");

            let offered = src_pool
                .driver()
                .migration_types(content_type, false, snapshots);
            let accepted = self.driver().migration_types(content_type, false, snapshots);
            let negotiated = match_types(
                &offered,
                fallback_migration_type(content_type),
                &accepted,
            )
            .map_err(|err| {
                VesselError::wrap("Failed to negotiate copy migration type", err)
            })?;

            // For VMs the target volume must not be undersized, so carry
            // the measured source block size across.
            let src_volume_size = if content_type == ContentType::Block {
                let src_vol = src_pool.get_volume(
                    vol_type,
                    content_type,
                    &project::instance(src.project(), src.name()),
                    HashMap::new(),
                );
                Some(src_pool.instance_disk_block_size(&src_vol)?)
            } else {
                None
            };

            let source_args = VolumeSourceArgs {
                name: src.name().to_string(),
                snapshots: snapshot_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                allow_inconsistent,
                volume_only: !snapshots,
                info: Some(migration::Info {
                    config: src_config.clone(),
                }),
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };
            let target_args = VolumeTargetArgs {
                name: inst.name().to_string(),
                snapshots: snapshot_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                volume_size: src_volume_size,
                volume_only: !snapshots,
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };

            self.run_copy_migration(
                inst,
                src,
                src_pool,
                source_args,
                target_args,
                op,
            )?;
            revert.add(|| {
                let _ = self.delete_instance(inst, op);
            });
        }

        self.ensure_instance_symlink(inst.kind(), inst.project(), inst.name(), &vol.mount_path())?;
        if !snapshot_names.is_empty() {
            self.ensure_instance_snapshot_symlink(inst.kind(), inst.project(), inst.name())?;
        }

        inst.template_apply(TemplateTrigger::Copy)?;

        self.emit(LifecycleEvent::StorageVolumeCreated {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            vol_type: vol_type.to_string(),
        });

        revert.success();
        debug!("CreateInstanceFromCopy finished for {}", inst.name());
        Ok(())
    }

    /// Run the sender and receiver halves of a same-host cross-pool
    /// transfer concurrently over a pipe pair, joining both errors.
    fn run_copy_migration(
        &self,
        inst: &dyn Instance,
        src: &dyn Instance,
        src_pool: &Backend,
        source_args: VolumeSourceArgs,
        target_args: VolumeTargetArgs,
        op: &Operation,
    ) -> VesselResult<()> {
        let cancel = Cancel::new();
        let (src_end, dst_end) = pipe_pair(&cancel);

        let (send_result, recv_result) = thread::scope(|scope| {
            let sender = scope.spawn(|| {
                let mut conn = src_end;
                let result = src_pool.migrate_instance(src, &mut conn, source_args, op);
                if result.is_err() {
                    cancel.cancel();
                }
                result
            });

            let recv_result = {
                let mut conn = dst_end;
                let result =
                    self.create_instance_from_migration(inst, &mut conn, target_args, op);
                if result.is_err() {
                    cancel.cancel();
                }
                result
            };

            let send_result = sender
                .join()
                .unwrap_or_else(|_| Err(VesselError::Msg("Migration sender panicked".into())));
            (send_result, recv_result)
        });

        match (send_result, recv_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(send_err), Err(recv_err)) => Err(VesselError::wrap(
                format!("Create instance volume from copy failed: {send_err}"),
                recv_err,
            )),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(VesselError::wrap(
                "Create instance volume from copy failed",
                err,
            )),
        }
    }

    /// Send an instance volume to a migration target.
    pub fn migrate_instance(
        &self,
        inst: &dyn Instance,
        conn: &mut dyn MigrationConn,
        mut args: VolumeSourceArgs,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("MigrateInstance started for {}", inst.name());

        let (vol_type, content_type) = instance_types(inst);

        if !args.snapshots.is_empty() && args.final_sync {
            return Err(VesselError::Msg(
                "Snapshots should not be transferred during final sync".to_string(),
            ));
        }

        {
            let info = args
                .info
                .as_ref()
                .ok_or_else(|| VesselError::Msg("Migration info required".to_string()))?;
            if args.snapshots.len() != info.config.volume_snapshots.len() {
                return Err(VesselError::Msg(format!(
                    "Requested snapshots count ({}) doesn't match volume snapshot config count ({})",
                    args.snapshots.len(),
                    info.config.volume_snapshots.len()
                )));
            }
        }

        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let storage_name = self.instance_storage_name(inst);
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        let mut source_snapshots = Vec::new();
        for snap_name in inst.snapshot_names()? {
            let snap_record = self.volume_db_get(inst.project(), &snap_name, vol_type)?;
            source_snapshots.push(self.get_volume(
                vol_type,
                content_type,
                &project::instance(inst.project(), &snap_name),
                snap_record.config,
            ));
        }

        args.name = inst.name().to_string();

        if !args.final_sync {
            let info = args.info.as_ref().expect("presence checked above");
            let resp =
                migration::send_index_header(args.index_header_version, conn, info)?;
            if let Some(refresh) = resp.refresh {
                args.refresh = refresh;
            }
        }

        // A raw copy of a running block volume cannot be consistent even
        // on drivers with cheap snapshots, so treat the generic block
        // protocol as requiring a freeze too.
        let needs_freeze = self.driver().info().running_copy_freeze
            || args
                .migration_type
                .as_ref()
                .map(|t| t.protocol == Protocol::GenericBlock)
                .unwrap_or(false);

        let _freeze = if !inst.is_snapshot()
            && needs_freeze
            && inst.is_running()
            && !inst.is_frozen()
            && !args.allow_inconsistent
        {
            info!(
                "Freezing instance {} for consistent migration transfer",
                inst.name()
            );
            inst.freeze()?;
            Some(FreezeGuard(inst))
        } else {
            None
        };

        let vol_copy = VolumeCopy::new(vol, source_snapshots);
        self.driver().migrate_volume(&vol_copy, conn, &args, op)?;

        debug!("MigrateInstance finished for {}", inst.name());
        Ok(())
    }

    /// Receive an instance volume from a migration source.
    pub fn create_instance_from_migration(
        &self,
        inst: &dyn Instance,
        conn: &mut dyn MigrationConn,
        mut args: VolumeTargetArgs,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("CreateInstanceFromMigration started for {}", inst.name());
        self.is_status_ready()?;

        if args.config.is_some() {
            return Err(VesselError::Msg(
                "Migration target config cannot be set for instances".to_string(),
            ));
        }

        let (vol_type, content_type) = instance_types(inst);

        // Receive the index header and confirm receipt, echoing the
        // caller-revised refresh flag back to the source.
        let src_info =
            migration::receive_index_header(args.index_header_version, conn, args.refresh)?;

        let db_vol = match self.volume_db_get(inst.project(), inst.name(), vol_type) {
            Ok(record) => Some(record),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        // Volume config priority: existing DB record, then the incoming
        // header, then defaults.
        let (volume_config, volume_description) = if let Some(ref record) = db_vol {
            (record.config.clone(), record.description.clone())
        } else if let Some(config) = src_info
            .as_ref()
            .and_then(|info| info.config.volume.as_ref())
        {
            (config.config.clone(), config.description.clone())
        } else {
            (HashMap::new(), args.description.clone())
        };

        let storage_name = self.instance_storage_name(inst);
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, volume_config);

        // Only generic transfers can honor local volume settings; an
        // optimized stream dictates them.
        let generic_transfer = args
            .migration_type
            .as_ref()
            .map(|t| matches!(t.protocol, Protocol::GenericFs | Protocol::GenericBlock))
            .unwrap_or(true);
        if generic_transfer {
            vol.set_has_source(false);
            self.driver().fill_volume_config(&mut vol).map_err(|err| {
                VesselError::wrap("Failed filling volume config", err)
            })?;
        }

        let vol_exists = self.driver().has_volume(&vol)?;

        // Inconsistencies between the database and storage indicate a
        // prior crash or external tampering; never auto-repair them.
        if db_vol.is_none() && vol_exists {
            return Err(VesselError::Msg(
                "Volume already exists on storage but not in database".to_string(),
            ));
        }
        if db_vol.is_some() && !vol_exists {
            return Err(VesselError::Msg(
                "Volume exists in database but not on storage".to_string(),
            ));
        }

        if args.refresh && !vol_exists {
            return Err(VesselError::Msg(
                "Cannot refresh volume, doesn't exist on migration target storage".to_string(),
            ));
        }

        let is_remote_cluster_move =
            args.cluster_move_source_name.is_some() && self.driver().info().remote;

        let mut revert = Reverter::new();

        if !args.refresh {
            if vol_exists {
                if !is_remote_cluster_move {
                    return Err(VesselError::AlreadyExists(format!(
                        "Volume {} on migration target storage",
                        vol.name()
                    )));
                }
            } else {
                self.volume_db_create(
                    inst.project(),
                    inst.name(),
                    &volume_description,
                    vol_type,
                    vol.config().clone(),
                    None,
                    content_type,
                    true,
                    true,
                )?;
                revert.add(|| {
                    let _ = self.volume_db_delete(inst.project(), inst.name(), vol_type);
                });
            }
        }

        if !is_remote_cluster_move {
            for snap_name in args.snapshots.clone() {
                let new_snap_name = snapshot_volume_name(inst.name(), &snap_name);

                // Parent volume config is the default; the source's saved
                // snapshot config, matched by name, takes precedence.
                let (snap_desc, snap_config, snap_expiry) = match src_info
                    .as_ref()
                    .and_then(|info| info.config.snapshot_config_by_name(&snap_name))
                {
                    Some(saved) => (
                        saved.description.clone(),
                        saved.config.clone(),
                        saved.expires_at,
                    ),
                    None => (volume_description.clone(), vol.config().clone(), None),
                };

                self.volume_db_create(
                    inst.project(),
                    &new_snap_name,
                    &snap_desc,
                    vol_type,
                    snap_config,
                    snap_expiry,
                    content_type,
                    true,
                    true,
                )?;
                revert.add(move || {
                    let _ = self.volume_db_delete(inst.project(), &new_snap_name, vol_type);
                });
            }
        }

        self.apply_instance_root_disk_overrides(inst, &mut vol);

        // A volume size in the header floors the block device size so the
        // incoming payload always fits.
        if let Some(volume_size) = args.volume_size {
            if content_type == ContentType::Block && volume_size > 0 {
                debug!("Setting volume size from offer header to {volume_size}");
                vol.config_mut()
                    .insert(CONFIG_SIZE.to_string(), volume_size.to_string());
            }
        }

        args.name = inst.name().to_string();
        args.config = Some(vol.config().clone());

        // For generic transfers of an image-backed instance whose base
        // image is available locally, pre-seed the target from the image
        // to cut the wire transfer down to the instance's delta.
        let mut pre_filler = None;
        if !args.refresh && !is_remote_cluster_move && generic_transfer {
            if let Some(fingerprint) = inst.base_image() {
                let image_known = match self
                    .state()
                    .store
                    .get_image(&fingerprint, inst.project())
                {
                    Ok(_) => true,
                    Err(err) if err.is_not_found() => false,
                    Err(err) => return Err(err),
                };

                if image_known && self.local_image_file_exists(&fingerprint) {
                    debug!("Using optimised migration from existing image {fingerprint}");
                    self.ensure_image(&fingerprint, op)?;
                    pre_filler = Some(self.image_filler(&fingerprint));
                }
            }
        }

        let mut target_snapshots = Vec::new();
        for snap_name in inst.snapshot_names()? {
            let snap_record = self.volume_db_get(inst.project(), &snap_name, vol_type)?;
            target_snapshots.push(self.get_volume(
                vol_type,
                content_type,
                &project::instance(inst.project(), &snap_name),
                snap_record.config,
            ));
        }

        let vol_copy = VolumeCopy::new(vol.clone(), target_snapshots);
        self.driver().create_volume_from_migration(
            &vol_copy,
            conn,
            &args,
            pre_filler.as_mut(),
            op,
        )?;

        if !is_remote_cluster_move {
            revert.add(|| {
                let _ = self.driver().delete_volume(&vol, op);
            });
        }

        self.ensure_instance_symlink(inst.kind(), inst.project(), inst.name(), &vol.mount_path())?;
        if !args.snapshots.is_empty() {
            self.ensure_instance_snapshot_symlink(inst.kind(), inst.project(), inst.name())?;
        }

        revert.success();
        debug!("CreateInstanceFromMigration finished for {}", inst.name());
        Ok(())
    }

    /// Synchronize an existing instance volume from a source instance:
    /// extra target snapshots are deleted first, then only the missing
    /// snapshots and the volume itself are transferred.
    pub fn refresh_instance(
        &self,
        inst: &dyn Instance,
        src: &dyn Instance,
        src_pool: &Backend,
        snapshots: bool,
        allow_inconsistent: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "RefreshInstance started for {} from {}",
            inst.name(),
            src.name()
        );

        if inst.kind() != src.kind() {
            return Err(VesselError::Msg("Instance types must match".to_string()));
        }

        let (vol_type, content_type) = instance_types(inst);

        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let storage_name = self.instance_storage_name(inst);
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        let mut src_config = src_pool.generate_instance_backup_config(src, true, op)?;

        let source_snapshots: Vec<Volume> = src_config
            .volume_snapshots
            .iter()
            .map(|snap| {
                let full = snapshot_volume_name(src.name(), &snap.name);
                src_pool.get_volume(
                    vol_type,
                    content_type,
                    &project::instance(src.project(), &full),
                    snap.config.clone(),
                )
            })
            .collect();

        if !snapshots {
            src_config.snapshots.clear();
            src_config.volume_snapshots.clear();
        }

        let source_snap_names: Vec<String> = src_config
            .volume_snapshots
            .iter()
            .map(|snap| snap.name.clone())
            .collect();

        let mut revert = Reverter::new();

        // Delete target snapshots the source no longer has, before any
        // data flows.
        let target_records = self.volume_db_snapshots_get(inst.project(), inst.name(), vol_type);
        let mut existing_names = Vec::new();
        for record in &target_records {
            let (_, snap_only) = parent_and_snapshot_name(&record.name);
            let snap_only = snap_only.expect("snapshot record name");
            if snapshots && source_snap_names.iter().any(|s| s == snap_only) {
                existing_names.push(snap_only.to_string());
                continue;
            }

            let snap_vol = vol.new_snapshot(snap_only)?;
            if self.driver().has_volume(&snap_vol)? {
                self.driver().delete_volume_snapshot(&snap_vol, op)?;
            }
            self.volume_db_delete(inst.project(), &record.name, vol_type)?;
        }

        // Transfer only the snapshots missing on the target.
        let missing_names: Vec<String> = source_snap_names
            .iter()
            .filter(|name| !existing_names.iter().any(|e| &e == name))
            .cloned()
            .collect();

        let _freeze = self.freeze_for_consistency(src_pool, src, allow_inconsistent)?;

        if self.name() == src_pool.name() {
            debug!("RefreshInstance same-pool mode detected");

            for snap in &src_config.volume_snapshots {
                if !missing_names.iter().any(|name| name == &snap.name) {
                    continue;
                }

                let new_snap_name = snapshot_volume_name(inst.name(), &snap.name);
                self.volume_db_create(
                    inst.project(),
                    &new_snap_name,
                    &snap.description,
                    vol_type,
                    snap.config.clone(),
                    snap.expires_at,
                    content_type,
                    false,
                    true,
                )?;
                revert.add(move || {
                    let _ = self.volume_db_delete(inst.project(), &new_snap_name, vol_type);
                });
            }

            let mut target_snapshots = Vec::new();
            for record in self.volume_db_snapshots_get(inst.project(), inst.name(), vol_type) {
                target_snapshots.push(self.get_volume(
                    vol_type,
                    content_type,
                    &project::instance(inst.project(), &record.name),
                    record.config,
                ));
            }

            let src_storage_name = project::instance(src.project(), src.name());
            let src_vol = src_pool.get_volume(
                vol_type,
                content_type,
                &src_storage_name,
                src_config
                    .volume
                    .as_ref()
                    .map(|v| v.config.clone())
                    .unwrap_or_default(),
            );

            let vol_copy = VolumeCopy::new(vol.clone(), target_snapshots);
            let src_copy = VolumeCopy::new(src_vol, source_snapshots);
            self.driver()
                .refresh_volume(&vol_copy, &src_copy, &missing_names, allow_inconsistent, op)?;
        } else {
            debug!("RefreshInstance cross-pool mode detected");

            let offered = src_pool
                .driver()
                .migration_types(content_type, true, snapshots);
            let accepted = self.driver().migration_types(content_type, true, snapshots);
            let negotiated = match_types(
                &offered,
                fallback_migration_type(content_type),
                &accepted,
            )
            .map_err(|err| {
                VesselError::wrap("Failed to negotiate refresh migration type", err)
            })?;

            // Trim the source config to the snapshots actually sent.
            let mut wire_config = src_config.clone();
            wire_config
                .volume_snapshots
                .retain(|snap| missing_names.iter().any(|name| name == &snap.name));
            wire_config
                .snapshots
                .retain(|snap| missing_names.iter().any(|name| name == &snap.name));

            let source_args = VolumeSourceArgs {
                name: src.name().to_string(),
                snapshots: missing_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                allow_inconsistent,
                refresh: true,
                volume_only: !snapshots,
                info: Some(migration::Info {
                    config: wire_config,
                }),
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };
            let target_args = VolumeTargetArgs {
                name: inst.name().to_string(),
                snapshots: missing_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                refresh: true,
                volume_only: !snapshots,
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };

            self.run_copy_migration(inst, src, src_pool, source_args, target_args, op)?;
        }

        self.ensure_instance_symlink(inst.kind(), inst.project(), inst.name(), &vol.mount_path())?;
        inst.template_apply(TemplateTrigger::Copy)?;

        self.emit(LifecycleEvent::StorageVolumeUpdated {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            vol_type: vol_type.to_string(),
        });

        revert.success();
        debug!("RefreshInstance finished for {}", inst.name());
        Ok(())
    }

    /// Rename the instance's root volume and every snapshot volume.
    pub fn rename_instance(
        &self,
        inst: &dyn Instance,
        new_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "RenameInstance started for {} to {new_name}",
            inst.name()
        );

        if inst.is_snapshot() {
            return Err(VesselError::Msg("Instance cannot be a snapshot".to_string()));
        }

        if new_name.contains('/') {
            return Err(VesselError::Msg(
                "New name cannot be a snapshot".to_string(),
            ));
        }

        let (vol_type, content_type) = instance_types(inst);
        let mut revert = Reverter::new();

        let volume = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let snapshot_records =
            self.volume_db_snapshots_get(inst.project(), inst.name(), vol_type);

        if !snapshot_records.is_empty() {
            revert.add(|| {
                let _ = self.remove_instance_snapshot_symlink_if_unused(
                    inst.kind(),
                    inst.project(),
                    new_name,
                );
                let _ = self.ensure_instance_snapshot_symlink(
                    inst.kind(),
                    inst.project(),
                    inst.name(),
                );
            });
        }

        // One store transaction renames the parent row and carries every
        // snapshot row with it.
        self.state().store.rename_volume(
            self.id(),
            inst.project(),
            inst.name(),
            new_name,
            vol_type,
        )?;
        revert.add(|| {
            let _ = self.state().store.rename_volume(
                self.id(),
                inst.project(),
                new_name,
                inst.name(),
                vol_type,
            );
        });

        let storage_name = self.instance_storage_name(inst);
        let new_storage_name = project::instance(inst.project(), new_name);

        let vol = self.get_volume(vol_type, content_type, &storage_name, volume.config);
        self.driver().rename_volume(&vol, &new_storage_name, op)?;
        {
            let new_vol =
                self.get_volume(vol_type, content_type, &new_storage_name, HashMap::new());
            let storage_name = storage_name.clone();
            revert.add(move || {
                let _ = self.driver().rename_volume(&new_vol, &storage_name, op);
            });
        }

        self.remove_instance_symlink(inst.kind(), inst.project(), inst.name())?;
        revert.add(|| {
            let mount_path = self.dirs().volume_mount_path(
                self.name(),
                vol_type,
                &project::instance(inst.project(), inst.name()),
            );
            let _ = self.ensure_instance_symlink(
                inst.kind(),
                inst.project(),
                inst.name(),
                &mount_path,
            );
        });

        let new_mount_path =
            self.dirs()
                .volume_mount_path(self.name(), vol_type, &new_storage_name);
        self.ensure_instance_symlink(inst.kind(), inst.project(), new_name, &new_mount_path)?;
        revert.add(|| {
            let _ = self.remove_instance_symlink(inst.kind(), inst.project(), new_name);
        });

        self.remove_instance_snapshot_symlink_if_unused(inst.kind(), inst.project(), inst.name())?;
        if !snapshot_records.is_empty() {
            self.ensure_instance_snapshot_symlink(inst.kind(), inst.project(), new_name)?;
        }

        self.emit(LifecycleEvent::StorageVolumeRenamed {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            new_name: new_name.to_string(),
            vol_type: vol_type.to_string(),
        });

        revert.success();
        debug!("RenameInstance finished for {}", inst.name());
        Ok(())
    }

    /// Remove an instance's root volume. All snapshots must be deleted
    /// first.
    pub fn delete_instance(&self, inst: &dyn Instance, op: &Operation) -> VesselResult<()> {
        debug!("DeleteInstance started for {}", inst.name());

        if inst.is_snapshot() {
            return Err(VesselError::Msg(
                "Instance must not be a snapshot".to_string(),
            ));
        }

        let (vol_type, content_type) = instance_types(inst);

        let snapshot_records =
            self.volume_db_snapshots_get(inst.project(), inst.name(), vol_type);
        if !snapshot_records.is_empty() {
            return Err(VesselError::Msg(
                "Cannot remove an instance volume that has snapshots".to_string(),
            ));
        }

        let storage_name = self.instance_storage_name(inst);
        let vol = self.get_volume(vol_type, content_type, &storage_name, HashMap::new());

        // Disk first (while the record still identifies it), then
        // symlinks, then the record.
        if self.driver().has_volume(&vol)? {
            self.driver().delete_volume(&vol, op).map_err(|err| {
                VesselError::wrap("Error deleting storage volume", err)
            })?;
        }

        self.remove_instance_symlink(inst.kind(), inst.project(), inst.name())?;
        self.remove_instance_snapshot_symlink_if_unused(inst.kind(), inst.project(), inst.name())?;

        self.volume_db_delete(inst.project(), inst.name(), vol_type)?;

        self.emit(LifecycleEvent::StorageVolumeDeleted {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            vol_type: vol_type.to_string(),
        });

        debug!("DeleteInstance finished for {}", inst.name());
        Ok(())
    }

    /// Update an instance volume's description and config.
    pub fn update_instance(
        &self,
        inst: &dyn Instance,
        new_desc: &str,
        new_config: HashMap<String, String>,
        _op: &Operation,
    ) -> VesselResult<()> {
        debug!("UpdateInstance started for {}", inst.name());

        if inst.is_snapshot() {
            return Err(VesselError::Msg(
                "Instance must not be a snapshot".to_string(),
            ));
        }

        let (vol_type, content_type) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;

        let (changed, _) = super::detect_changed_config(&db_vol.config, &new_config);
        if !changed.is_empty() {
            let storage_name = self.instance_storage_name(inst);
            let mut vol =
                self.get_volume(vol_type, content_type, &storage_name, new_config.clone());
            self.driver().validate_volume(&mut vol, false)?;
            self.driver().update_volume(&vol, &changed)?;
        }

        if !changed.is_empty() || new_desc != db_vol.description {
            self.state().store.update_volume(
                self.id(),
                inst.project(),
                inst.name(),
                vol_type,
                new_desc,
                new_config,
            )?;
        }

        self.emit(LifecycleEvent::StorageVolumeUpdated {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            vol_type: vol_type.to_string(),
        });

        debug!("UpdateInstance finished for {}", inst.name());
        Ok(())
    }

    /// Update an instance snapshot's description. Snapshot config is
    /// immutable.
    pub fn update_instance_snapshot(
        &self,
        inst: &dyn Instance,
        new_desc: &str,
        new_config: HashMap<String, String>,
        _op: &Operation,
    ) -> VesselResult<()> {
        debug!("UpdateInstanceSnapshot started for {}", inst.name());

        if !inst.is_snapshot() {
            return Err(VesselError::Msg("Instance must be a snapshot".to_string()));
        }

        let (vol_type, _) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;

        let (changed, _) = super::detect_changed_config(&db_vol.config, &new_config);
        if !changed.is_empty() {
            return Err(VesselError::Msg(
                "Snapshot volume config is not editable".to_string(),
            ));
        }

        self.state().store.update_volume_snapshot(
            self.id(),
            inst.project(),
            inst.name(),
            vol_type,
            new_desc,
            db_vol.config,
            db_vol.expires_at,
        )?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotUpdated {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
        });

        debug!("UpdateInstanceSnapshot finished for {}", inst.name());
        Ok(())
    }

    /// Create a snapshot of an instance volume. Snapshot creation for a
    /// given volume is serialized against itself by a named lock.
    pub fn create_instance_snapshot(
        &self,
        inst: &dyn Instance,
        src: &dyn Instance,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "CreateInstanceSnapshot started for {} of {}",
            inst.name(),
            src.name()
        );

        if inst.kind() != src.kind() {
            return Err(VesselError::Msg("Instance types must match".to_string()));
        }

        if !inst.is_snapshot() {
            return Err(VesselError::Msg("Instance must be a snapshot".to_string()));
        }

        if src.is_snapshot() {
            return Err(VesselError::Msg(
                "Source instance cannot be a snapshot".to_string(),
            ));
        }

        let (vol_type, content_type) = instance_types(inst);
        let src_db_vol = self.volume_db_get(src.project(), src.name(), vol_type)?;

        let mut revert = Reverter::new();

        self.volume_db_create(
            inst.project(),
            inst.name(),
            &src_db_vol.description,
            vol_type,
            src_db_vol.config,
            None,
            content_type,
            false,
            true,
        )?;
        revert.add(|| {
            let _ = self.volume_db_delete(inst.project(), inst.name(), vol_type);
        });

        let _freeze = if self.driver().info().running_copy_freeze
            && src.is_running()
            && !src.is_frozen()
        {
            src.freeze()?;
            Some(FreezeGuard(src))
        } else {
            None
        };

        let storage_name = self.instance_storage_name(inst);
        let snap_vol = self.get_volume(vol_type, content_type, &storage_name, HashMap::new());

        // Serialize snapshot creation per volume.
        let _lock = self.state().locks.lock(
            operation_lock_name(
                "CreateInstanceSnapshot",
                self.name(),
                vol_type,
                content_type,
                src.name(),
            ),
            op,
        )?;

        self.driver().create_volume_snapshot(&snap_vol, op)?;
        {
            let snap_vol = snap_vol.clone();
            revert.add(move || {
                let _ = self.driver().delete_volume_snapshot(&snap_vol, op);
            });
        }

        self.ensure_instance_snapshot_symlink(inst.kind(), inst.project(), inst.name())?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotCreated {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
        });

        revert.success();
        debug!("CreateInstanceSnapshot finished for {}", inst.name());
        Ok(())
    }

    /// Rename an instance snapshot volume.
    pub fn rename_instance_snapshot(
        &self,
        inst: &dyn Instance,
        new_snap_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "RenameInstanceSnapshot started for {} to {new_snap_name}",
            inst.name()
        );

        if !inst.is_snapshot() {
            return Err(VesselError::Msg("Instance must be a snapshot".to_string()));
        }

        if new_snap_name.contains('/') {
            return Err(VesselError::Msg(
                "New snapshot name cannot be a snapshot of its own".to_string(),
            ));
        }

        let (vol_type, content_type) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;

        let mut revert = Reverter::new();

        let (parent_name, old_snap_name) = parent_and_snapshot_name(inst.name());
        let old_snap_name = old_snap_name.expect("snapshot instance name");
        let storage_name = self.instance_storage_name(inst);
        let snap_vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);

        self.driver()
            .rename_volume_snapshot(&snap_vol, new_snap_name, op)?;
        {
            let renamed_storage = project::instance(
                inst.project(),
                &snapshot_volume_name(parent_name, new_snap_name),
            );
            let old_snap_name = old_snap_name.to_string();
            revert.add(move || {
                let renamed =
                    self.get_volume(vol_type, content_type, &renamed_storage, HashMap::new());
                let _ = self
                    .driver()
                    .rename_volume_snapshot(&renamed, &old_snap_name, op);
            });
        }

        let new_full_name = snapshot_volume_name(parent_name, new_snap_name);
        self.state().store.rename_volume(
            self.id(),
            inst.project(),
            inst.name(),
            &new_full_name,
            vol_type,
        )?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotRenamed {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            new_name: new_full_name,
        });

        revert.success();
        debug!("RenameInstanceSnapshot finished for {}", inst.name());
        Ok(())
    }

    /// Remove an instance snapshot volume.
    pub fn delete_instance_snapshot(
        &self,
        inst: &dyn Instance,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("DeleteInstanceSnapshot started for {}", inst.name());

        if !inst.is_snapshot() {
            return Err(VesselError::Msg("Instance must be a snapshot".to_string()));
        }

        let (vol_type, content_type) = instance_types(inst);
        let storage_name = self.instance_storage_name(inst);
        let snap_vol = self.get_volume(vol_type, content_type, &storage_name, HashMap::new());

        if self.driver().has_volume(&snap_vol)? {
            self.driver().delete_volume_snapshot(&snap_vol, op)?;
        }

        self.remove_instance_snapshot_symlink_if_unused(inst.kind(), inst.project(), inst.name())?;
        self.volume_db_delete(inst.project(), inst.name(), vol_type)?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotDeleted {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
        });

        debug!("DeleteInstanceSnapshot finished for {}", inst.name());
        Ok(())
    }

    /// Roll an instance volume back to one of its snapshots. When the
    /// driver asks for newer snapshots to be deleted first, they are
    /// deleted and the restore retried exactly once.
    pub fn restore_instance_snapshot(
        &self,
        inst: &dyn Instance,
        src: &dyn Instance,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "RestoreInstanceSnapshot started for {} from {}",
            inst.name(),
            src.name()
        );

        if inst.kind() != src.kind() {
            return Err(VesselError::Msg("Instance types must match".to_string()));
        }

        if inst.is_snapshot() {
            return Err(VesselError::Msg(
                "Instance must not be a snapshot".to_string(),
            ));
        }

        if !src.is_snapshot() {
            return Err(VesselError::Msg(
                "Source instance must be a snapshot".to_string(),
            ));
        }

        if inst.is_running() {
            return Err(VesselError::Msg(
                "Instance must not be running to restore".to_string(),
            ));
        }

        let (vol_type, content_type) = instance_types(inst);
        let mut revert = Reverter::new();

        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let storage_name = self.instance_storage_name(inst);
        let mut vol =
            self.get_volume(vol_type, content_type, &storage_name, db_vol.config.clone());
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        let snap_db_vol = self.volume_db_get(src.project(), src.name(), vol_type)?;

        // The restored volume takes the snapshot's config.
        let (changed, _) = super::detect_changed_config(&db_vol.config, &snap_db_vol.config);
        if !changed.is_empty() || db_vol.description != snap_db_vol.description {
            self.state().store.update_volume(
                self.id(),
                inst.project(),
                inst.name(),
                vol_type,
                &snap_db_vol.description,
                snap_db_vol.config.clone(),
            )?;
            {
                let old_desc = db_vol.description.clone();
                let old_config = db_vol.config.clone();
                revert.add(move || {
                    let _ = self.state().store.update_volume(
                        self.id(),
                        inst.project(),
                        inst.name(),
                        vol_type,
                        &old_desc,
                        old_config.clone(),
                    );
                });
            }
        }

        let snap_storage_name = project::instance(src.project(), &snap_db_vol.name);
        let snap_vol = self.get_volume(
            vol_type,
            content_type,
            &snap_storage_name,
            snap_db_vol.config.clone(),
        );

        if let Err(err) = self.driver().restore_volume(&vol, &snap_vol, op) {
            let offending = match err.delete_snapshots_first() {
                Some(names) => names.to_vec(),
                None => return Err(err),
            };

            // Delete the snapshots the driver named, then retry exactly
            // once.
            for record in self.volume_db_snapshots_get(inst.project(), inst.name(), vol_type) {
                let (_, snap_only) = parent_and_snapshot_name(&record.name);
                let snap_only = snap_only.expect("snapshot record name");
                if !offending.iter().any(|name| name == snap_only) {
                    continue;
                }

                let doomed = vol.new_snapshot(snap_only)?;
                if self.driver().has_volume(&doomed)? {
                    self.driver().delete_volume_snapshot(&doomed, op)?;
                }
                self.volume_db_delete(inst.project(), &record.name, vol_type)?;
            }

            self.driver().restore_volume(&vol, &snap_vol, op)?;
        }

        self.emit(LifecycleEvent::StorageVolumeRestored {
            pool: self.name().to_string(),
            project: inst.project().to_string(),
            name: inst.name().to_string(),
            snapshot: snap_db_vol.name.clone(),
        });

        revert.success();
        debug!("RestoreInstanceSnapshot finished for {}", inst.name());
        Ok(())
    }

    /// Mount an instance's root volume.
    pub fn mount_instance(
        &self,
        inst: &dyn Instance,
        op: &Operation,
    ) -> VesselResult<MountInfo> {
        debug!("MountInstance started for {}", inst.name());
        self.is_status_ready()?;

        let (vol_type, content_type) = instance_types(inst);
        let storage_name = self.instance_storage_name(inst);

        let mut vol = match self.volume_db_get(inst.project(), inst.name(), vol_type) {
            Ok(record) => self.get_volume(vol_type, content_type, &storage_name, record.config),
            Err(err) if err.is_not_found() => {
                self.get_volume(vol_type, content_type, &storage_name, HashMap::new())
            }
            Err(err) => return Err(err),
        };
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        self.driver().mount_volume(&vol, op)?;

        let disk_path = match self.get_instance_disk(inst) {
            Ok(path) => Some(path),
            Err(err) if err.is_not_supported() => None,
            Err(err) => {
                let _ = self.driver().unmount_volume(&vol, false, op);
                return Err(VesselError::wrap("Failed getting disk path", err));
            }
        };

        let mut mount_info = MountInfo {
            disk_path,
            post_hooks: Vec::new(),
        };

        // Delegation is applied against the running instance's init
        // process once the caller has it available.
        if self.driver().can_delegate_volume(&vol) {
            let state = self.state().clone();
            let pool_name = self.name().to_string();
            let vol = vol.clone();
            mount_info.post_hooks.push(Box::new(move |inst| {
                let pid = match inst.init_pid() {
                    Some(pid) if pid > 0 => pid,
                    _ => return Ok(()),
                };

                let backend = super::load_by_name(&state, &pool_name)?;
                backend.driver().delegate_volume(&vol, pid)
            }));
        }

        debug!("MountInstance finished for {}", inst.name());
        Ok(mount_info)
    }

    /// Unmount an instance's root volume.
    pub fn unmount_instance(&self, inst: &dyn Instance, op: &Operation) -> VesselResult<()> {
        debug!("UnmountInstance started for {}", inst.name());

        let (vol_type, content_type) = instance_types(inst);
        let storage_name = self.instance_storage_name(inst);

        let mut vol = match self.volume_db_get(inst.project(), inst.name(), vol_type) {
            Ok(record) => self.get_volume(vol_type, content_type, &storage_name, record.config),
            Err(err) if err.is_not_found() => {
                self.get_volume(vol_type, content_type, &storage_name, HashMap::new())
            }
            Err(err) => return Err(err),
        };
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        self.driver().unmount_volume(&vol, false, op)?;

        debug!("UnmountInstance finished for {}", inst.name());
        Ok(())
    }

    /// Mount an instance snapshot (read-only).
    pub fn mount_instance_snapshot(
        &self,
        inst: &dyn Instance,
        op: &Operation,
    ) -> VesselResult<MountInfo> {
        if !inst.is_snapshot() {
            return Err(VesselError::Msg("Instance must be a snapshot".to_string()));
        }

        let (vol_type, content_type) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let storage_name = self.instance_storage_name(inst);
        let vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);

        self.driver().mount_volume_snapshot(&vol, op)?;

        let disk_path = match self.get_instance_disk(inst) {
            Ok(path) => Some(path),
            Err(err) if err.is_not_supported() => None,
            Err(err) => return Err(VesselError::wrap("Failed getting disk path", err)),
        };

        Ok(MountInfo {
            disk_path,
            post_hooks: Vec::new(),
        })
    }

    /// Unmount an instance snapshot.
    pub fn unmount_instance_snapshot(
        &self,
        inst: &dyn Instance,
        op: &Operation,
    ) -> VesselResult<()> {
        if !inst.is_snapshot() {
            return Err(VesselError::Msg("Instance must be a snapshot".to_string()));
        }

        let (vol_type, content_type) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let storage_name = self.instance_storage_name(inst);
        let vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);

        self.driver().unmount_volume_snapshot(&vol, op)?;
        Ok(())
    }

    /// Location of a VM's root disk block device.
    pub fn get_instance_disk(&self, inst: &dyn Instance) -> VesselResult<std::path::PathBuf> {
        let (vol_type, content_type) = instance_types(inst);
        if content_type != ContentType::Block {
            return Err(VesselError::NotSupported(
                "Disk path of a filesystem instance".to_string(),
            ));
        }

        let storage_name = self.instance_storage_name(inst);
        let vol = self.get_volume(vol_type, content_type, &storage_name, HashMap::new());
        self.driver().volume_disk_path(&vol)
    }

    /// Disk usage of the instance's root volume.
    pub fn get_instance_usage(&self, inst: &dyn Instance) -> VesselResult<u64> {
        self.is_status_ready()?;

        let (vol_type, content_type) = instance_types(inst);
        let storage_name = self.instance_storage_name(inst);
        let vol = self.get_volume(vol_type, content_type, &storage_name, HashMap::new());
        self.driver().volume_usage(&vol)
    }

    /// Apply a size quota to the instance's root volume; for VM block
    /// volumes the config filesystem companion is kept in step.
    pub fn set_instance_quota(
        &self,
        inst: &dyn Instance,
        size: &str,
        vm_state_size: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "SetInstanceQuota started for {} (size {size:?}, state size {vm_state_size:?})",
            inst.name()
        );

        let (vol_type, content_type) = instance_types(inst);
        let storage_name = self.instance_storage_name(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);

        self.driver().set_volume_quota(&vol, size, false, op)?;

        if vol.is_vm_block() {
            // Default the companion size when the main size is set; an
            // empty main size propagates to remove both quotas together.
            let mut state_size = vm_state_size.to_string();
            if state_size.is_empty() && !size.is_empty() {
                state_size = self
                    .driver()
                    .info()
                    .default_vm_block_filesystem_size
                    .to_string();
            }

            let fs_vol = vol.new_vm_block_filesystem_volume();
            self.driver()
                .set_volume_quota(&fs_vol, &state_size, false, op)?;
        }

        debug!("SetInstanceQuota finished for {}", inst.name());
        Ok(())
    }

    /// Write a backup of the instance volume to `writer`, refreshing the
    /// on-disk descriptor first so the tarball records the current state.
    pub fn backup_instance(
        &self,
        inst: &dyn Instance,
        writer: &mut dyn std::io::Write,
        optimized: bool,
        snapshots: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("BackupInstance started for {}", inst.name());

        let (vol_type, content_type) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let storage_name = self.instance_storage_name(inst);
        let mut vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);
        self.apply_instance_root_disk_overrides(inst, &mut vol);

        self.update_instance_backup_file(inst, snapshots, op)?;

        let mut snap_names = Vec::new();
        let mut source_snapshots = Vec::new();
        if snapshots {
            for record in self.volume_db_snapshots_get(inst.project(), inst.name(), vol_type) {
                let (_, snap_only) = parent_and_snapshot_name(&record.name);
                snap_names.push(snap_only.expect("snapshot record name").to_string());
                source_snapshots.push(self.get_volume(
                    vol_type,
                    content_type,
                    &project::instance(inst.project(), &record.name),
                    record.config,
                ));
            }
        }

        let vol_copy = VolumeCopy::new(vol, source_snapshots);
        self.driver()
            .backup_volume(&vol_copy, writer, optimized, &snap_names, op)?;

        debug!("BackupInstance finished for {}", inst.name());
        Ok(())
    }

    /// Restore a backup stream onto the storage device. The instance is
    /// created in the database only afterwards, so the volume records are
    /// created by the returned post hook; the revert hook removes
    /// everything unpacked if that later process fails.
    pub fn create_instance_from_backup<'a>(
        &'a self,
        info: RestoreInfo,
        data: &mut dyn Read,
        op: &'a Operation,
    ) -> VesselResult<(InstancePostHook<'a>, Option<Box<dyn FnOnce() + 'a>>)> {
        debug!("CreateInstanceFromBackup started for {}", info.name);

        let kind = info.kind.ok_or_else(|| {
            VesselError::Msg("Backup info lacks an instance type".to_string())
        })?;
        let vol_type = instance_volume_type(kind);
        let content_type = instance_content_type(kind);

        let storage_name = project::instance(&info.project, &info.name);
        let volume_config = info
            .config
            .as_ref()
            .and_then(|c| c.volume.as_ref())
            .map(|v| v.config.clone())
            .unwrap_or_default();
        let vol = self.get_volume(vol_type, content_type, &storage_name, volume_config);

        let source_snapshots: Vec<Volume> = info
            .config
            .as_ref()
            .map(|c| {
                c.volume_snapshots
                    .iter()
                    .map(|snap| {
                        let full = snapshot_volume_name(&info.name, &snap.name);
                        self.get_volume(
                            vol_type,
                            content_type,
                            &project::instance(&info.project, &full),
                            snap.config.clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut import_revert = Reverter::new();

        let vol_copy = VolumeCopy::new(vol.clone(), source_snapshots);
        let (vol_post_hook, driver_revert) =
            self.driver()
                .create_volume_from_backup(&vol_copy, &info, data, op)?;
        if let Some(hook) = driver_revert {
            import_revert.add(hook);
        }

        self.ensure_instance_symlink(kind, &info.project, &info.name, &vol.mount_path())?;
        {
            let project_name = info.project.clone();
            let name = info.name.clone();
            import_revert.add(move || {
                let _ = self.remove_instance_symlink(kind, &project_name, &name);
            });
        }

        if !info.snapshots.is_empty() {
            self.ensure_instance_snapshot_symlink(kind, &info.project, &info.name)?;
            {
                let project_name = info.project.clone();
                let name = info.name.clone();
                import_revert.add(move || {
                    let _ = self.remove_instance_snapshot_symlink_if_unused(
                        kind,
                        &project_name,
                        &name,
                    );
                });
            }
        }

        // Refresh the descriptor inside the restored volume.
        if let Some(ref config) = info.config {
            let config = config.clone();
            vol.mount_task(self.driver(), op, |mount_path, _| {
                backup::write_descriptor(mount_path, &config)
            })
            .map_err(|err| VesselError::wrap("Error updating backup file", err))?;
        }

        let post_hook: InstancePostHook<'a> = {
            let info_config = info.config.clone();
            let snapshots = info.snapshots.clone();
            Box::new(move |inst: &dyn Instance| {
                debug!("CreateInstanceFromBackup post hook started");
                let mut revert = Reverter::new();

                let (volume_description, volume_config) = info_config
                    .as_ref()
                    .and_then(|c| c.volume.as_ref())
                    .map(|v| (v.description.clone(), v.config.clone()))
                    .unwrap_or_default();

                // Strip unknown config keys: the export may come from a
                // different kind of pool.
                self.volume_db_create(
                    inst.project(),
                    inst.name(),
                    &volume_description,
                    vol_type,
                    volume_config,
                    None,
                    content_type,
                    true,
                    true,
                )?;
                {
                    let project_name = inst.project().to_string();
                    let name = inst.name().to_string();
                    revert.add(move || {
                        let _ = self.volume_db_delete(&project_name, &name, vol_type);
                    });
                }

                for snap_name in &snapshots {
                    let saved = info_config
                        .as_ref()
                        .and_then(|c| c.snapshot_config_by_name(snap_name));
                    let (snap_desc, snap_config, snap_expiry) = match saved {
                        Some(s) => (s.description.clone(), s.config.clone(), s.expires_at),
                        None => (String::new(), HashMap::new(), None),
                    };

                    let new_snap_name = snapshot_volume_name(inst.name(), snap_name);
                    self.volume_db_create(
                        inst.project(),
                        &new_snap_name,
                        &snap_desc,
                        vol_type,
                        snap_config,
                        snap_expiry,
                        content_type,
                        true,
                        true,
                    )?;
                    {
                        let project_name = inst.project().to_string();
                        revert.add(move || {
                            let _ =
                                self.volume_db_delete(&project_name, &new_snap_name, vol_type);
                        });
                    }
                }

                let storage_name = project::instance(inst.project(), inst.name());
                let record = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
                let mut vol =
                    self.get_volume(vol_type, content_type, &storage_name, record.config);
                self.apply_instance_root_disk_overrides(inst, &mut vol);

                if let Some(hook) = vol_post_hook {
                    hook(&vol)?;
                }

                // Apply the root disk quota after the driver's own post
                // processing. Container imports run with the resize safety
                // checks disabled so pessimistic pre-checks cannot block an
                // otherwise-valid restore; a shrink refusal is logged, not
                // fatal, as the restore itself has already succeeded.
                let size = vol.config().get(CONFIG_SIZE).cloned().unwrap_or_default();
                if !size.is_empty() {
                    debug!("Applying volume quota {size} from root disk config");
                    let allow_unsafe_resize = vol_type == VolumeType::Container;

                    match self
                        .driver()
                        .set_volume_quota(&vol, &size, allow_unsafe_resize, op)
                    {
                        Err(err) if err.is_cannot_be_shrunk() => {
                            warn!(
                                "Could not apply volume quota {size} as restored volume \
                                 cannot be shrunk"
                            );
                        }
                        Err(err) => {
                            return Err(VesselError::wrap(
                                "Failed applying volume quota to root disk",
                                err,
                            ))
                        }
                        Ok(()) => {}
                    }

                    if vol.is_vm_block() {
                        let mut state_size = vol
                            .config()
                            .get("size.state")
                            .cloned()
                            .unwrap_or_default();
                        if state_size.is_empty() {
                            state_size = self
                                .driver()
                                .info()
                                .default_vm_block_filesystem_size
                                .to_string();
                        }

                        let fs_vol = vol.new_vm_block_filesystem_volume();
                        match self.driver().set_volume_quota(
                            &fs_vol,
                            &state_size,
                            allow_unsafe_resize,
                            op,
                        ) {
                            Err(err) if err.is_cannot_be_shrunk() => {
                                warn!(
                                    "Could not apply VM filesystem volume quota \
                                     {state_size} as restored volume cannot be shrunk"
                                );
                            }
                            Err(err) => {
                                return Err(VesselError::wrap(
                                    "Failed applying filesystem volume quota to root disk",
                                    err,
                                ))
                            }
                            Ok(()) => {}
                        }
                    }
                }

                revert.success();
                debug!("CreateInstanceFromBackup post hook finished");
                Ok(())
            })
        };

        let revert_hook = import_revert.into_hook();
        debug!("CreateInstanceFromBackup finished for {}", info.name);
        Ok((post_hook, Some(revert_hook)))
    }

    /// Remove any remaining mount paths and symlinks for an instance and
    /// its snapshots.
    pub fn cleanup_instance_paths(&self, inst: &dyn Instance, op: &Operation) -> VesselResult<()> {
        debug!("CleanupInstancePaths started for {}", inst.name());
        let _ = op;

        let (vol_type, _) = instance_types(inst);
        let storage_name = self.instance_storage_name(inst);

        let mount_path = self
            .dirs()
            .volume_mount_path(self.name(), vol_type, &storage_name);
        crate::storage::drivers::utils::remove_tree(&mount_path)?;

        let snap_dir = self
            .dirs()
            .volume_snapshot_dir(self.name(), vol_type, &storage_name);
        crate::storage::drivers::utils::remove_tree(&snap_dir)?;

        self.remove_instance_symlink(inst.kind(), inst.project(), inst.name())?;
        self.remove_instance_snapshot_symlink_if_unused(inst.kind(), inst.project(), inst.name())?;

        debug!("CleanupInstancePaths finished for {}", inst.name());
        Ok(())
    }

    /// Build the instance's backup config from the metadata store.
    pub fn generate_instance_backup_config(
        &self,
        inst: &dyn Instance,
        snapshots: bool,
        _op: &Operation,
    ) -> VesselResult<backup::Config> {
        let (vol_type, content_type) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;

        let mut config = backup::Config {
            pool: Some(backup::PoolSave {
                name: self.name().to_string(),
                driver: self.driver().info().name.to_string(),
                config: self.config().clone(),
            }),
            instance: Some(backup::InstanceSave {
                name: inst.name().to_string(),
                kind: inst.kind(),
                created_at: db_vol.created_at,
            }),
            snapshots: Vec::new(),
            volume: Some(backup::VolumeSave {
                name: inst.name().to_string(),
                vol_type,
                content_type,
                description: db_vol.description,
                config: db_vol.config,
            }),
            volume_snapshots: Vec::new(),
        };

        if snapshots {
            for record in self.volume_db_snapshots_get(inst.project(), inst.name(), vol_type) {
                let (_, snap_only) = parent_and_snapshot_name(&record.name);
                let snap_only = snap_only.expect("snapshot record name");
                config.snapshots.push(backup::InstanceSnapshotSave {
                    name: snap_only.to_string(),
                    created_at: record.created_at,
                });
                config.volume_snapshots.push(backup::VolumeSnapshotSave {
                    name: snap_only.to_string(),
                    description: record.description.clone(),
                    config: record.config.clone(),
                    expires_at: record.expires_at,
                });
            }
        }

        Ok(config)
    }

    /// Rewrite the descriptor inside the instance volume so recovery and
    /// backups see the current metadata.
    pub fn update_instance_backup_file(
        &self,
        inst: &dyn Instance,
        snapshots: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        let config = self.generate_instance_backup_config(inst, snapshots, op)?;

        let (vol_type, content_type) = instance_types(inst);
        let db_vol = self.volume_db_get(inst.project(), inst.name(), vol_type)?;
        let storage_name = self.instance_storage_name(inst);
        let vol = self.get_volume(vol_type, content_type, &storage_name, db_vol.config);

        vol.mount_task(self.driver(), op, |mount_path, _| {
            backup::write_descriptor(mount_path, &config)
        })
    }

    /// Verify a descriptor's snapshot list against the driver's on-disk
    /// state and the expected volume snapshot configs.
    pub fn check_instance_backup_file_snapshots(
        &self,
        backup_conf: &backup::Config,
        project_name: &str,
        op: &Operation,
    ) -> VesselResult<Vec<backup::VolumeSnapshotSave>> {
        let volume = backup_conf
            .volume
            .as_ref()
            .ok_or_else(|| VesselError::Msg("Backup config lacks volume info".to_string()))?;

        let storage_name = project::instance(project_name, &volume.name);
        let vol = self.get_volume(
            volume.vol_type,
            volume.content_type,
            &storage_name,
            volume.config.clone(),
        );

        let expected: Vec<String> = backup_conf
            .volume_snapshots
            .iter()
            .map(|snap| snap.name.clone())
            .collect();
        self.driver().check_volume_snapshots(&vol, &expected, op)?;

        Ok(backup_conf.volume_snapshots.clone())
    }
}
