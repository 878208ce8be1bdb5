// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Custom volume operations: volumes that belong to no instance, keyed by
//! project and name, including ISO imports and backups.

use std::{collections::HashMap, io::Read, thread};

use chrono::{DateTime, Utc};

use crate::{
    storage::{
        backup::{self, RestoreInfo},
        drivers::{
            parent_and_snapshot_name, snapshot_volume_name, ContentType, Volume, VolumeCopy,
            VolumeType,
        },
        migration::{
            self, fallback_migration_type, match_types, MigrationConn, VolumeSourceArgs,
            VolumeTargetArgs, INDEX_HEADER_VERSION,
        },
        project,
        structures::{operation_lock_name, pipe_pair, Cancel, Reverter},
        types::{LifecycleEvent, Operation},
    },
    vessel::{VesselError, VesselResult},
};

use super::Backend;

impl Backend {
    fn custom_storage_name(&self, project_name: &str, vol_name: &str) -> String {
        project::storage_volume(project_name, vol_name)
    }

    /// Create an empty custom volume.
    pub fn create_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        description: &str,
        config: HashMap<String, String>,
        content_type: ContentType,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("CreateCustomVolume started for {project_name}/{vol_name}");
        self.is_status_ready()?;
        Backend::validate_name(vol_name)?;

        if content_type == ContentType::Iso {
            return Err(VesselError::Msg(
                "ISO custom volumes can only be created from an ISO import".to_string(),
            ));
        }

        let mut revert = Reverter::new();

        let final_config = self.volume_db_create(
            project_name,
            vol_name,
            description,
            VolumeType::Custom,
            config,
            None,
            content_type,
            false,
            false,
        )?;
        revert.add(|| {
            let _ = self.volume_db_delete(project_name, vol_name, VolumeType::Custom);
        });

        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(VolumeType::Custom, content_type, &storage_name, final_config);
        self.driver().create_volume(&vol, None, op)?;

        self.emit(LifecycleEvent::StorageVolumeCreated {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            vol_type: VolumeType::Custom.to_string(),
        });

        revert.success();
        debug!("CreateCustomVolume finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Build a custom volume's backup config from the metadata store.
    pub fn generate_custom_volume_backup_config(
        &self,
        project_name: &str,
        vol_name: &str,
        snapshots: bool,
        _op: &Operation,
    ) -> VesselResult<backup::Config> {
        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;

        let mut config = backup::Config {
            pool: Some(backup::PoolSave {
                name: self.name().to_string(),
                driver: self.driver().info().name.to_string(),
                config: self.config().clone(),
            }),
            instance: None,
            snapshots: Vec::new(),
            volume: Some(backup::VolumeSave {
                name: vol_name.to_string(),
                vol_type: VolumeType::Custom,
                content_type: record.content_type,
                description: record.description,
                config: record.config,
            }),
            volume_snapshots: Vec::new(),
        };

        if snapshots {
            for snap in self.volume_db_snapshots_get(project_name, vol_name, VolumeType::Custom) {
                let (_, snap_only) = parent_and_snapshot_name(&snap.name);
                config.volume_snapshots.push(backup::VolumeSnapshotSave {
                    name: snap_only.expect("snapshot record name").to_string(),
                    description: snap.description.clone(),
                    config: snap.config.clone(),
                    expires_at: snap.expires_at,
                });
            }
        }

        Ok(config)
    }

    /// Copy a custom volume (and optionally its snapshots), negotiating a
    /// migration transfer for cross-pool copies.
    #[allow(clippy::too_many_arguments)]
    pub fn create_custom_volume_from_copy(
        &self,
        project_name: &str,
        src_project_name: &str,
        vol_name: &str,
        description: &str,
        config: HashMap<String, String>,
        src_pool: &Backend,
        src_vol_name: &str,
        snapshots: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "CreateCustomVolumeFromCopy started for {project_name}/{vol_name} \
             from {src_project_name}/{src_vol_name}"
        );
        self.is_status_ready()?;
        src_pool.is_status_ready()?;

        let mut src_config =
            src_pool.generate_custom_volume_backup_config(src_project_name, src_vol_name, true, op)?;

        let src_record = src_pool.volume_db_get(src_project_name, src_vol_name, VolumeType::Custom)?;
        let content_type = src_record.content_type;

        let source_snapshots: Vec<Volume> = src_config
            .volume_snapshots
            .iter()
            .map(|snap| {
                let full = snapshot_volume_name(src_vol_name, &snap.name);
                src_pool.get_volume(
                    VolumeType::Custom,
                    content_type,
                    &project::storage_volume(src_project_name, &full),
                    snap.config.clone(),
                )
            })
            .collect();

        if !snapshots {
            src_config.volume_snapshots.clear();
        }

        let snapshot_names: Vec<String> = src_config
            .volume_snapshots
            .iter()
            .map(|snap| snap.name.clone())
            .collect();

        // The caller's config overrides the source's where set.
        let mut volume_config = src_record.config.clone();
        for (key, value) in config {
            volume_config.insert(key, value);
        }

        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            content_type,
            &storage_name,
            volume_config.clone(),
        );

        if self.driver().has_volume(&vol)? {
            return Err(VesselError::AlreadyExists(format!(
                "Volume {} on target storage",
                vol.name()
            )));
        }

        let mut revert = Reverter::new();

        if self.name() == src_pool.name() {
            debug!("CreateCustomVolumeFromCopy same-pool mode detected");

            self.volume_db_create(
                project_name,
                vol_name,
                description,
                VolumeType::Custom,
                volume_config,
                None,
                content_type,
                false,
                true,
            )?;
            revert.add(|| {
                let _ = self.volume_db_delete(project_name, vol_name, VolumeType::Custom);
            });

            let mut target_snapshots = Vec::with_capacity(snapshot_names.len());
            for snap in &src_config.volume_snapshots {
                let new_snap_name = snapshot_volume_name(vol_name, &snap.name);
                self.volume_db_create(
                    project_name,
                    &new_snap_name,
                    &snap.description,
                    VolumeType::Custom,
                    snap.config.clone(),
                    snap.expires_at,
                    content_type,
                    false,
                    true,
                )?;
                {
                    let new_snap_name = new_snap_name.clone();
                    revert.add(move || {
                        let _ = self.volume_db_delete(
                            project_name,
                            &new_snap_name,
                            VolumeType::Custom,
                        );
                    });
                }

                target_snapshots.push(self.get_volume(
                    VolumeType::Custom,
                    content_type,
                    &project::storage_volume(project_name, &new_snap_name),
                    snap.config.clone(),
                ));
            }

            let src_storage_name = project::storage_volume(src_project_name, src_vol_name);
            let src_vol = src_pool.get_volume(
                VolumeType::Custom,
                content_type,
                &src_storage_name,
                src_record.config.clone(),
            );

            let vol_copy = VolumeCopy::new(vol.clone(), target_snapshots);
            let src_copy = VolumeCopy::new(src_vol, source_snapshots);
            self.driver()
                .create_volume_from_copy(&vol_copy, &src_copy, false, op)?;
            revert.add(|| {
                let _ = self.driver().delete_volume(&vol, op);
            });
        } else {
            debug!("CreateCustomVolumeFromCopy cross-pool mode detected");

            let offered = src_pool
                .driver()
                .migration_types(content_type, false, snapshots);
            let accepted = self.driver().migration_types(content_type, false, snapshots);
            let negotiated =
                match_types(&offered, fallback_migration_type(content_type), &accepted)
                    .map_err(|err| {
                        VesselError::wrap("Failed to negotiate copy migration type", err)
                    })?;

            let source_args = VolumeSourceArgs {
                name: src_vol_name.to_string(),
                snapshots: snapshot_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                volume_only: !snapshots,
                info: Some(migration::Info {
                    config: src_config.clone(),
                }),
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };
            let target_args = VolumeTargetArgs {
                name: vol_name.to_string(),
                description: description.to_string(),
                config: Some(volume_config),
                snapshots: snapshot_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                volume_only: !snapshots,
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };

            self.run_custom_copy_migration(
                project_name,
                src_project_name,
                src_pool,
                source_args,
                target_args,
                op,
            )?;
            revert.add(|| {
                let _ = self.delete_custom_volume(project_name, vol_name, op);
            });
        }

        self.emit(LifecycleEvent::StorageVolumeCreated {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            vol_type: VolumeType::Custom.to_string(),
        });

        revert.success();
        debug!("CreateCustomVolumeFromCopy finished for {project_name}/{vol_name}");
        Ok(())
    }

    fn run_custom_copy_migration(
        &self,
        project_name: &str,
        src_project_name: &str,
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
                let result =
                    src_pool.migrate_custom_volume(src_project_name, &mut conn, source_args, op);
                if result.is_err() {
                    cancel.cancel();
                }
                result
            });

            let recv_result = {
                let mut conn = dst_end;
                let result = self.create_custom_volume_from_migration(
                    project_name,
                    &mut conn,
                    target_args,
                    op,
                );
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
                format!("Create custom volume from copy failed: {send_err}"),
                recv_err,
            )),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(VesselError::wrap(
                "Create custom volume from copy failed",
                err,
            )),
        }
    }

    /// Synchronize an existing custom volume from a source volume. Extra
    /// target snapshots are deleted before any data flows; only snapshots
    /// missing on the target are transferred.
    #[allow(clippy::too_many_arguments)]
    pub fn refresh_custom_volume(
        &self,
        project_name: &str,
        src_project_name: &str,
        vol_name: &str,
        description: &str,
        config: HashMap<String, String>,
        src_pool: &Backend,
        src_vol_name: &str,
        snapshots: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "RefreshCustomVolume started for {project_name}/{vol_name} \
             from {src_project_name}/{src_vol_name}"
        );
        self.is_status_ready()?;
        src_pool.is_status_ready()?;

        let mut src_config =
            src_pool.generate_custom_volume_backup_config(src_project_name, src_vol_name, true, op)?;
        let src_record = src_pool.volume_db_get(src_project_name, src_vol_name, VolumeType::Custom)?;
        let content_type = src_record.content_type;

        let target_record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        if target_record.content_type != content_type {
            return Err(VesselError::Msg(
                "Volume content type does not match source".to_string(),
            ));
        }

        let source_snapshots: Vec<Volume> = src_config
            .volume_snapshots
            .iter()
            .map(|snap| {
                let full = snapshot_volume_name(src_vol_name, &snap.name);
                src_pool.get_volume(
                    VolumeType::Custom,
                    content_type,
                    &project::storage_volume(src_project_name, &full),
                    snap.config.clone(),
                )
            })
            .collect();

        if !snapshots {
            src_config.volume_snapshots.clear();
        }

        let source_snap_names: Vec<String> = src_config
            .volume_snapshots
            .iter()
            .map(|snap| snap.name.clone())
            .collect();

        let storage_name = self.custom_storage_name(project_name, vol_name);
        let mut volume_config = target_record.config.clone();
        for (key, value) in config {
            volume_config.insert(key, value);
        }
        let vol = self.get_volume(
            VolumeType::Custom,
            content_type,
            &storage_name,
            volume_config.clone(),
        );

        let mut revert = Reverter::new();

        if volume_config != target_record.config || description != target_record.description {
            self.state().store.update_volume(
                self.id(),
                project_name,
                vol_name,
                VolumeType::Custom,
                description,
                volume_config,
            )?;
        }

        // Delete target snapshots the source no longer has.
        let mut existing_names = Vec::new();
        for record in self.volume_db_snapshots_get(project_name, vol_name, VolumeType::Custom) {
            let (_, snap_only) = parent_and_snapshot_name(&record.name);
            let snap_only = snap_only.expect("snapshot record name");
            if snapshots && source_snap_names.iter().any(|s| s == snap_only) {
                existing_names.push(snap_only.to_string());
                continue;
            }

            self.delete_custom_volume_snapshot(project_name, &record.name, op)?;
        }

        let missing_names: Vec<String> = source_snap_names
            .iter()
            .filter(|name| !existing_names.iter().any(|e| &e == name))
            .cloned()
            .collect();

        if self.name() == src_pool.name() {
            debug!("RefreshCustomVolume same-pool mode detected");

            for snap in &src_config.volume_snapshots {
                if !missing_names.iter().any(|name| name == &snap.name) {
                    continue;
                }

                let new_snap_name = snapshot_volume_name(vol_name, &snap.name);
                self.volume_db_create(
                    project_name,
                    &new_snap_name,
                    &snap.description,
                    VolumeType::Custom,
                    snap.config.clone(),
                    snap.expires_at,
                    content_type,
                    false,
                    true,
                )?;
                revert.add(move || {
                    let _ =
                        self.volume_db_delete(project_name, &new_snap_name, VolumeType::Custom);
                });
            }

            let mut target_snapshots = Vec::new();
            for record in self.volume_db_snapshots_get(project_name, vol_name, VolumeType::Custom)
            {
                target_snapshots.push(self.get_volume(
                    VolumeType::Custom,
                    content_type,
                    &project::storage_volume(project_name, &record.name),
                    record.config,
                ));
            }

            let src_vol = src_pool.get_volume(
                VolumeType::Custom,
                content_type,
                &project::storage_volume(src_project_name, src_vol_name),
                src_record.config.clone(),
            );

            let vol_copy = VolumeCopy::new(vol.clone(), target_snapshots);
            let src_copy = VolumeCopy::new(src_vol, source_snapshots);
            self.driver()
                .refresh_volume(&vol_copy, &src_copy, &missing_names, false, op)?;
        } else {
            debug!("RefreshCustomVolume cross-pool mode detected");

            let offered = src_pool
                .driver()
                .migration_types(content_type, true, snapshots);
            let accepted = self.driver().migration_types(content_type, true, snapshots);
            let negotiated =
                match_types(&offered, fallback_migration_type(content_type), &accepted)
                    .map_err(|err| {
                        VesselError::wrap("Failed to negotiate refresh migration type", err)
                    })?;

            let mut wire_config = src_config.clone();
            wire_config
                .volume_snapshots
                .retain(|snap| missing_names.iter().any(|name| name == &snap.name));

            let source_args = VolumeSourceArgs {
                name: src_vol_name.to_string(),
                snapshots: missing_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                refresh: true,
                volume_only: !snapshots,
                info: Some(migration::Info {
                    config: wire_config,
                }),
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };
            let target_args = VolumeTargetArgs {
                name: vol_name.to_string(),
                snapshots: missing_names.clone(),
                migration_type: Some(negotiated[0].clone()),
                refresh: true,
                volume_only: !snapshots,
                index_header_version: INDEX_HEADER_VERSION,
                ..Default::default()
            };

            self.run_custom_copy_migration(
                project_name,
                src_project_name,
                src_pool,
                source_args,
                target_args,
                op,
            )?;
        }

        self.emit(LifecycleEvent::StorageVolumeUpdated {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            vol_type: VolumeType::Custom.to_string(),
        });

        revert.success();
        debug!("RefreshCustomVolume finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Send a custom volume to a migration target.
    pub fn migrate_custom_volume(
        &self,
        project_name: &str,
        conn: &mut dyn MigrationConn,
        mut args: VolumeSourceArgs,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "MigrateCustomVolume started for {project_name}/{}",
            args.name
        );

        let record = self.volume_db_get(project_name, &args.name, VolumeType::Custom)?;
        let storage_name = self.custom_storage_name(project_name, &args.name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );

        let mut source_snapshots = Vec::new();
        for snap in self.volume_db_snapshots_get(project_name, &args.name, VolumeType::Custom) {
            source_snapshots.push(self.get_volume(
                VolumeType::Custom,
                record.content_type,
                &project::storage_volume(project_name, &snap.name),
                snap.config,
            ));
        }

        if !args.final_sync {
            let info = args
                .info
                .as_ref()
                .ok_or_else(|| VesselError::Msg("Migration info required".to_string()))?;
            let resp = migration::send_index_header(args.index_header_version, conn, info)?;
            if let Some(refresh) = resp.refresh {
                args.refresh = refresh;
            }
        }

        let vol_copy = VolumeCopy::new(vol, source_snapshots);
        self.driver().migrate_volume(&vol_copy, conn, &args, op)?;

        debug!(
            "MigrateCustomVolume finished for {project_name}/{}",
            args.name
        );
        Ok(())
    }

    /// Receive a custom volume from a migration source.
    pub fn create_custom_volume_from_migration(
        &self,
        project_name: &str,
        conn: &mut dyn MigrationConn,
        mut args: VolumeTargetArgs,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "CreateCustomVolumeFromMigration started for {project_name}/{}",
            args.name
        );
        self.is_status_ready()?;

        let src_info =
            migration::receive_index_header(args.index_header_version, conn, args.refresh)?;

        let content_type = src_info
            .as_ref()
            .and_then(|info| info.config.volume.as_ref())
            .map(|vol| vol.content_type)
            .unwrap_or(ContentType::Fs);

        let volume_config = args
            .config
            .clone()
            .or_else(|| {
                src_info
                    .as_ref()
                    .and_then(|info| info.config.volume.as_ref())
                    .map(|vol| vol.config.clone())
            })
            .unwrap_or_default();

        let storage_name = self.custom_storage_name(project_name, &args.name);
        let vol = self.get_volume(
            VolumeType::Custom,
            content_type,
            &storage_name,
            volume_config,
        );

        let vol_exists = self.driver().has_volume(&vol)?;
        if !args.refresh && vol_exists {
            return Err(VesselError::AlreadyExists(format!(
                "Volume {} on migration target storage",
                vol.name()
            )));
        }
        if args.refresh && !vol_exists {
            return Err(VesselError::Msg(
                "Cannot refresh volume, doesn't exist on migration target storage".to_string(),
            ));
        }

        let mut revert = Reverter::new();

        if !args.refresh {
            self.volume_db_create(
                project_name,
                &args.name,
                &args.description,
                VolumeType::Custom,
                vol.config().clone(),
                None,
                content_type,
                true,
                true,
            )?;
            {
                let vol_name = args.name.clone();
                revert.add(move || {
                    let _ = self.volume_db_delete(project_name, &vol_name, VolumeType::Custom);
                });
            }
        }

        for snap_name in args.snapshots.clone() {
            let new_snap_name = snapshot_volume_name(&args.name, &snap_name);

            let (snap_desc, snap_config, snap_expiry) = match src_info
                .as_ref()
                .and_then(|info| info.config.snapshot_config_by_name(&snap_name))
            {
                Some(saved) => (
                    saved.description.clone(),
                    saved.config.clone(),
                    saved.expires_at,
                ),
                None => (String::new(), vol.config().clone(), None),
            };

            self.volume_db_create(
                project_name,
                &new_snap_name,
                &snap_desc,
                VolumeType::Custom,
                snap_config,
                snap_expiry,
                content_type,
                true,
                true,
            )?;
            revert.add(move || {
                let _ = self.volume_db_delete(project_name, &new_snap_name, VolumeType::Custom);
            });
        }

        let mut target_snapshots = Vec::new();
        for snap in self.volume_db_snapshots_get(project_name, &args.name, VolumeType::Custom) {
            target_snapshots.push(self.get_volume(
                VolumeType::Custom,
                content_type,
                &project::storage_volume(project_name, &snap.name),
                snap.config,
            ));
        }

        args.config = Some(vol.config().clone());

        let vol_copy = VolumeCopy::new(vol.clone(), target_snapshots);
        self.driver()
            .create_volume_from_migration(&vol_copy, conn, &args, None, op)?;
        if !args.refresh {
            revert.add(|| {
                let _ = self.driver().delete_volume(&vol, op);
            });
        }

        revert.success();
        debug!(
            "CreateCustomVolumeFromMigration finished for {project_name}/{}",
            args.name
        );
        Ok(())
    }

    /// Rename a custom volume and its snapshot records.
    pub fn rename_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        new_vol_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("RenameCustomVolume started for {project_name}/{vol_name} to {new_vol_name}");

        if vol_name.contains('/') {
            return Err(VesselError::Msg("Volume cannot be a snapshot".to_string()));
        }

        Backend::validate_name(new_vol_name)?;

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let mut revert = Reverter::new();

        // One store transaction renames the volume row and carries every
        // snapshot row with it.
        self.state().store.rename_volume(
            self.id(),
            project_name,
            vol_name,
            new_vol_name,
            VolumeType::Custom,
        )?;
        revert.add(|| {
            let _ = self.state().store.rename_volume(
                self.id(),
                project_name,
                new_vol_name,
                vol_name,
                VolumeType::Custom,
            );
        });

        let storage_name = self.custom_storage_name(project_name, vol_name);
        let new_storage_name = self.custom_storage_name(project_name, new_vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );
        self.driver().rename_volume(&vol, &new_storage_name, op)?;

        self.emit(LifecycleEvent::StorageVolumeRenamed {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            new_name: new_vol_name.to_string(),
            vol_type: VolumeType::Custom.to_string(),
        });

        revert.success();
        debug!("RenameCustomVolume finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Update a custom volume's description and config. ISO volume config
    /// is immutable after creation.
    pub fn update_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        new_desc: &str,
        new_config: HashMap<String, String>,
        _op: &Operation,
    ) -> VesselResult<()> {
        debug!("UpdateCustomVolume started for {project_name}/{vol_name}");

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let (changed, _) = super::detect_changed_config(&record.config, &new_config);

        if record.content_type == ContentType::Iso && !changed.is_empty() {
            return Err(VesselError::Msg(
                "ISO volume config cannot be changed".to_string(),
            ));
        }

        if !changed.is_empty() {
            let storage_name = self.custom_storage_name(project_name, vol_name);
            let mut vol = self.get_volume(
                VolumeType::Custom,
                record.content_type,
                &storage_name,
                new_config.clone(),
            );
            self.driver().validate_volume(&mut vol, false)?;
            self.driver().update_volume(&vol, &changed)?;
        }

        if !changed.is_empty() || new_desc != record.description {
            self.state().store.update_volume(
                self.id(),
                project_name,
                vol_name,
                VolumeType::Custom,
                new_desc,
                new_config,
            )?;
        }

        self.emit(LifecycleEvent::StorageVolumeUpdated {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            vol_type: VolumeType::Custom.to_string(),
        });

        debug!("UpdateCustomVolume finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Update a custom volume snapshot's description and expiry. Snapshot
    /// config is immutable.
    pub fn update_custom_volume_snapshot(
        &self,
        project_name: &str,
        vol_name: &str,
        new_desc: &str,
        new_config: HashMap<String, String>,
        new_expiry: Option<DateTime<Utc>>,
        _op: &Operation,
    ) -> VesselResult<()> {
        if !vol_name.contains('/') {
            return Err(VesselError::Msg("Volume must be a snapshot".to_string()));
        }

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let (changed, _) = super::detect_changed_config(&record.config, &new_config);
        if !changed.is_empty() {
            return Err(VesselError::Msg(
                "Snapshot volume config is not editable".to_string(),
            ));
        }

        self.state().store.update_volume_snapshot(
            self.id(),
            project_name,
            vol_name,
            VolumeType::Custom,
            new_desc,
            record.config,
            new_expiry,
        )?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotUpdated {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
        });

        Ok(())
    }

    /// Remove a custom volume, deleting its snapshots first.
    pub fn delete_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("DeleteCustomVolume started for {project_name}/{vol_name}");

        if vol_name.contains('/') {
            return Err(VesselError::Msg("Volume cannot be a snapshot".to_string()));
        }

        for snap in self.volume_db_snapshots_get(project_name, vol_name, VolumeType::Custom) {
            self.delete_custom_volume_snapshot(project_name, &snap.name, op)?;
        }

        let record = match self.volume_db_get(project_name, vol_name, VolumeType::Custom) {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );

        if self.driver().has_volume(&vol)? {
            self.driver().delete_volume(&vol, op)?;
        }

        self.volume_db_delete(project_name, vol_name, VolumeType::Custom)?;

        self.emit(LifecycleEvent::StorageVolumeDeleted {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            vol_type: VolumeType::Custom.to_string(),
        });

        debug!("DeleteCustomVolume finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Location of a block custom volume's disk.
    pub fn get_custom_volume_disk(
        &self,
        project_name: &str,
        vol_name: &str,
    ) -> VesselResult<std::path::PathBuf> {
        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );
        self.driver().volume_disk_path(&vol)
    }

    /// Disk usage of a custom volume.
    pub fn get_custom_volume_usage(
        &self,
        project_name: &str,
        vol_name: &str,
    ) -> VesselResult<u64> {
        self.is_status_ready()?;

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );
        self.driver().volume_usage(&vol)
    }

    /// Mount a custom volume.
    pub fn mount_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        self.is_status_ready()?;

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );
        self.driver().mount_volume(&vol, op)
    }

    /// Unmount a custom volume. Returns whether it was actually unmounted.
    pub fn unmount_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        op: &Operation,
    ) -> VesselResult<bool> {
        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );
        self.driver().unmount_volume(&vol, false, op)
    }

    /// Create a snapshot of a custom volume, serialized per volume by a
    /// named lock.
    pub fn create_custom_volume_snapshot(
        &self,
        project_name: &str,
        vol_name: &str,
        new_snap_name: &str,
        expires_at: Option<DateTime<Utc>>,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "CreateCustomVolumeSnapshot started for {project_name}/{vol_name}/{new_snap_name}"
        );

        if vol_name.contains('/') {
            return Err(VesselError::Msg("Volume cannot be a snapshot".to_string()));
        }

        Backend::validate_name(new_snap_name)?;

        let parent = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        if parent.content_type == ContentType::Iso {
            return Err(VesselError::Msg(
                "ISO volumes cannot be snapshotted".to_string(),
            ));
        }

        let full_snap_name = snapshot_volume_name(vol_name, new_snap_name);
        let mut revert = Reverter::new();

        self.volume_db_create(
            project_name,
            &full_snap_name,
            &parent.description,
            VolumeType::Custom,
            parent.config.clone(),
            expires_at,
            parent.content_type,
            false,
            true,
        )?;
        {
            let full_snap_name = full_snap_name.clone();
            revert.add(move || {
                let _ = self.volume_db_delete(project_name, &full_snap_name, VolumeType::Custom);
            });
        }

        let snap_storage_name = project::storage_volume(project_name, &full_snap_name);
        let snap_vol = self.get_volume(
            VolumeType::Custom,
            parent.content_type,
            &snap_storage_name,
            HashMap::new(),
        );

        let _lock = self.state().locks.lock(
            operation_lock_name(
                "CreateCustomVolumeSnapshot",
                self.name(),
                VolumeType::Custom,
                parent.content_type,
                vol_name,
            ),
            op,
        )?;

        self.driver().create_volume_snapshot(&snap_vol, op)?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotCreated {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: full_snap_name.clone(),
        });

        revert.success();
        debug!(
            "CreateCustomVolumeSnapshot finished for {project_name}/{full_snap_name}"
        );
        Ok(())
    }

    /// Rename a custom volume snapshot.
    pub fn rename_custom_volume_snapshot(
        &self,
        project_name: &str,
        vol_name: &str,
        new_snap_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        let (parent_name, old_snap) = parent_and_snapshot_name(vol_name);
        if old_snap.is_none() {
            return Err(VesselError::Msg("Volume must be a snapshot".to_string()));
        }

        Backend::validate_name(new_snap_name)?;

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let mut revert = Reverter::new();

        let storage_name = project::storage_volume(project_name, vol_name);
        let snap_vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );
        self.driver()
            .rename_volume_snapshot(&snap_vol, new_snap_name, op)?;
        {
            let renamed_storage = project::storage_volume(
                project_name,
                &snapshot_volume_name(parent_name, new_snap_name),
            );
            let old_snap = old_snap.expect("checked above").to_string();
            let content_type = snap_vol.content_type();
            revert.add(move || {
                let renamed = self.get_volume(
                    VolumeType::Custom,
                    content_type,
                    &renamed_storage,
                    HashMap::new(),
                );
                let _ = self.driver().rename_volume_snapshot(&renamed, &old_snap, op);
            });
        }

        let new_full_name = snapshot_volume_name(parent_name, new_snap_name);
        self.state().store.rename_volume(
            self.id(),
            project_name,
            vol_name,
            &new_full_name,
            VolumeType::Custom,
        )?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotRenamed {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            new_name: new_full_name,
        });

        revert.success();
        Ok(())
    }

    /// Remove a custom volume snapshot.
    pub fn delete_custom_volume_snapshot(
        &self,
        project_name: &str,
        vol_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        if !vol_name.contains('/') {
            return Err(VesselError::Msg("Volume must be a snapshot".to_string()));
        }

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let storage_name = project::storage_volume(project_name, vol_name);
        let snap_vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );

        if self.driver().has_volume(&snap_vol)? {
            self.driver().delete_volume_snapshot(&snap_vol, op)?;
        }

        self.volume_db_delete(project_name, vol_name, VolumeType::Custom)?;

        self.emit(LifecycleEvent::StorageVolumeSnapshotDeleted {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
        });

        Ok(())
    }

    /// Roll a custom volume back to one of its snapshots, honoring the
    /// driver's request to delete newer snapshots with exactly one retry.
    pub fn restore_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        snapshot_name: &str,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "RestoreCustomVolume started for {project_name}/{vol_name} from {snapshot_name}"
        );

        if vol_name.contains('/') {
            return Err(VesselError::Msg("Volume cannot be a snapshot".to_string()));
        }

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );

        if vol.mount_in_use() {
            return Err(VesselError::Busy(format!(
                "Volume {vol_name:?} is in use and cannot be restored"
            )));
        }

        let full_snap_name = snapshot_volume_name(vol_name, snapshot_name);
        let snap_record = self.volume_db_get(project_name, &full_snap_name, VolumeType::Custom)?;
        let snap_vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &project::storage_volume(project_name, &full_snap_name),
            snap_record.config,
        );

        if let Err(err) = self.driver().restore_volume(&vol, &snap_vol, op) {
            let offending = match err.delete_snapshots_first() {
                Some(names) => names.to_vec(),
                None => return Err(err),
            };

            for snap in self.volume_db_snapshots_get(project_name, vol_name, VolumeType::Custom) {
                let (_, snap_only) = parent_and_snapshot_name(&snap.name);
                let snap_only = snap_only.expect("snapshot record name");
                if offending.iter().any(|name| name == snap_only) {
                    self.delete_custom_volume_snapshot(project_name, &snap.name, op)?;
                }
            }

            self.driver().restore_volume(&vol, &snap_vol, op)?;
        }

        self.emit(LifecycleEvent::StorageVolumeRestored {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            snapshot: snapshot_name.to_string(),
        });

        debug!("RestoreCustomVolume finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Write a backup of a custom volume to `writer`, refreshing the
    /// descriptor inside the volume first so the archive records the
    /// current state.
    pub fn backup_custom_volume(
        &self,
        project_name: &str,
        vol_name: &str,
        writer: &mut dyn std::io::Write,
        optimized: bool,
        snapshots: bool,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("BackupCustomVolume started for {project_name}/{vol_name}");

        let record = self.volume_db_get(project_name, vol_name, VolumeType::Custom)?;
        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(
            VolumeType::Custom,
            record.content_type,
            &storage_name,
            record.config,
        );

        if record.content_type == ContentType::Fs {
            let config =
                self.generate_custom_volume_backup_config(project_name, vol_name, snapshots, op)?;
            vol.mount_task(self.driver(), op, |mount_path, _| {
                backup::write_descriptor(mount_path, &config)
            })?;
        }

        let mut snap_names = Vec::new();
        let mut source_snapshots = Vec::new();
        if snapshots {
            for snap in self.volume_db_snapshots_get(project_name, vol_name, VolumeType::Custom) {
                let (_, snap_only) = parent_and_snapshot_name(&snap.name);
                snap_names.push(snap_only.expect("snapshot record name").to_string());
                source_snapshots.push(self.get_volume(
                    VolumeType::Custom,
                    record.content_type,
                    &project::storage_volume(project_name, &snap.name),
                    snap.config,
                ));
            }
        }

        let vol_copy = VolumeCopy::new(vol, source_snapshots);
        self.driver()
            .backup_volume(&vol_copy, writer, optimized, &snap_names, op)?;

        debug!("BackupCustomVolume finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Create a read-only ISO custom volume from a stream.
    pub fn create_custom_volume_from_iso(
        &self,
        project_name: &str,
        vol_name: &str,
        data: &mut dyn Read,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!("CreateCustomVolumeFromISO started for {project_name}/{vol_name}");
        self.is_status_ready()?;
        Backend::validate_name(vol_name)?;

        let mut revert = Reverter::new();

        // Strip unknown config keys for forward compatibility with other
        // drivers' exports.
        let config = self.volume_db_create(
            project_name,
            vol_name,
            "",
            VolumeType::Custom,
            HashMap::new(),
            None,
            ContentType::Iso,
            true,
            false,
        )?;
        revert.add(|| {
            let _ = self.volume_db_delete(project_name, vol_name, VolumeType::Custom);
        });

        let storage_name = self.custom_storage_name(project_name, vol_name);
        let vol = self.get_volume(VolumeType::Custom, ContentType::Iso, &storage_name, config);

        let mut filler = self.iso_filler(data);
        self.driver().create_volume(&vol, Some(&mut filler), op)?;

        self.emit(LifecycleEvent::StorageVolumeCreated {
            pool: self.name().to_string(),
            project: project_name.to_string(),
            name: vol_name.to_string(),
            vol_type: VolumeType::Custom.to_string(),
        });

        revert.success();
        debug!("CreateCustomVolumeFromISO finished for {project_name}/{vol_name}");
        Ok(())
    }

    /// Restore a custom volume backup stream, creating the records and
    /// unpacking the data in one operation.
    pub fn create_custom_volume_from_backup(
        &self,
        info: RestoreInfo,
        data: &mut dyn Read,
        op: &Operation,
    ) -> VesselResult<()> {
        debug!(
            "CreateCustomVolumeFromBackup started for {}/{}",
            info.project, info.name
        );
        self.is_status_ready()?;

        let volume_save = info
            .config
            .as_ref()
            .and_then(|config| config.volume.as_ref())
            .ok_or_else(|| {
                VesselError::Msg("Backup config lacks volume info".to_string())
            })?;
        let content_type = volume_save.content_type;

        let mut revert = Reverter::new();

        // Strip unknown config keys: the export may come from a different
        // kind of pool.
        let config = self.volume_db_create(
            &info.project,
            &info.name,
            &volume_save.description,
            VolumeType::Custom,
            volume_save.config.clone(),
            None,
            content_type,
            true,
            true,
        )?;
        {
            let project_name = info.project.clone();
            let vol_name = info.name.clone();
            revert.add(move || {
                let _ = self.volume_db_delete(&project_name, &vol_name, VolumeType::Custom);
            });
        }

        for snap_name in &info.snapshots {
            let saved = info
                .config
                .as_ref()
                .and_then(|config| config.snapshot_config_by_name(snap_name));
            let (snap_desc, snap_config, snap_expiry) = match saved {
                Some(s) => (s.description.clone(), s.config.clone(), s.expires_at),
                None => (String::new(), volume_save.config.clone(), None),
            };

            let full_snap_name = snapshot_volume_name(&info.name, snap_name);
            self.volume_db_create(
                &info.project,
                &full_snap_name,
                &snap_desc,
                VolumeType::Custom,
                snap_config,
                snap_expiry,
                content_type,
                true,
                true,
            )?;
            {
                let project_name = info.project.clone();
                revert.add(move || {
                    let _ =
                        self.volume_db_delete(&project_name, &full_snap_name, VolumeType::Custom);
                });
            }
        }

        let storage_name = self.custom_storage_name(&info.project, &info.name);
        let vol = self.get_volume(VolumeType::Custom, content_type, &storage_name, config);

        let source_snapshots: Vec<Volume> = info
            .config
            .as_ref()
            .map(|c| {
                c.volume_snapshots
                    .iter()
                    .map(|snap| {
                        let full = snapshot_volume_name(&info.name, &snap.name);
                        self.get_volume(
                            VolumeType::Custom,
                            content_type,
                            &project::storage_volume(&info.project, &full),
                            snap.config.clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let vol_copy = VolumeCopy::new(vol.clone(), source_snapshots);
        let (post_hook, driver_revert) =
            self.driver()
                .create_volume_from_backup(&vol_copy, &info, data, op)?;
        if let Some(hook) = driver_revert {
            revert.add(hook);
        }

        if let Some(hook) = post_hook {
            hook(&vol)?;
        }

        self.emit(LifecycleEvent::StorageVolumeCreated {
            pool: self.name().to_string(),
            project: info.project.clone(),
            name: info.name.clone(),
            vol_type: VolumeType::Custom.to_string(),
        });

        revert.success();
        debug!(
            "CreateCustomVolumeFromBackup finished for {}/{}",
            info.project, info.name
        );
        Ok(())
    }
}
