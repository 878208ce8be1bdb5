// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Optimized image volume caching.

use std::collections::HashMap;

use crate::{
    storage::{
        drivers::{ContentType, VolumeType, CONFIG_BLOCK_FILESYSTEM, CONFIG_VOLATILE_ROOTFS_SIZE},
        project,
        structures::Reverter,
        types::{InstanceKind, LifecycleEvent, Operation},
    },
    vessel::{VesselError, VesselResult},
};

use super::Backend;

impl Backend {
    /// Keep at most one optimized image volume per fingerprint on this
    /// pool, matching the pool's current defaults.
    ///
    /// An existing cached volume is reused when it still matches the
    /// pool's block mode, block filesystem and size policy; when the size
    /// policy cannot be met by resizing (`CannotBeShrunk`/`NotSupported`)
    /// or the filesystem/mode changed, the volume is deleted and
    /// regenerated. An on-disk volume without a DB record is treated as a
    /// partial unpack and deleted. When the filler reports the unpacked
    /// size it is persisted as `volatile.rootfs.size` on the record so
    /// later clones are never undersized.
    pub fn ensure_image(&self, fingerprint: &str, op: &Operation) -> VesselResult<()> {
        debug!("EnsureImage started for {fingerprint} on pool {}", self.name());
        self.is_status_ready()?;

        if !self.driver().info().optimized_images {
            return Ok(()); // Nothing to do for drivers without optimized image volumes.
        }

        // Serialized with itself per fingerprint, in a key space separate
        // from the volume locks taken by the create path below, so that
        // concurrent instance creations from one image are safe without
        // deadlocking.
        let _lock = self
            .state()
            .locks
            .lock(format!("EnsureImage/{}/{fingerprint}", self.name()), op)?;

        let image = self.state().store.get_image_from_any_project(fingerprint)?;
        let content_type = match image.kind {
            InstanceKind::VirtualMachine => ContentType::Block,
            InstanceKind::Container => ContentType::Fs,
        };

        let mut img_db_vol = match self.volume_db_get(
            project::DEFAULT_PROJECT,
            fingerprint,
            VolumeType::Image,
        ) {
            Ok(record) => Some(record),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        let mut img_vol =
            self.get_volume(VolumeType::Image, content_type, fingerprint, HashMap::new());

        if let Some(ref record) = img_db_vol {
            // How would a fresh volume be configured under the pool's
            // current defaults?
            let mut tmp_img_vol = img_vol.clone();
            self.driver().fill_volume_config(&mut tmp_img_vol)?;

            img_vol = self.get_volume(
                VolumeType::Image,
                content_type,
                fingerprint,
                record.config.clone(),
            );

            let block_mode_changed = tmp_img_vol.is_block_backed() != img_vol.is_block_backed();
            let block_fs_changed = img_vol.is_block_backed()
                && img_vol.config().get(CONFIG_BLOCK_FILESYSTEM)
                    != tmp_img_vol.config().get(CONFIG_BLOCK_FILESYSTEM);

            if block_mode_changed || block_fs_changed {
                if block_mode_changed {
                    debug!("Block mode has changed, regenerating image volume");
                } else {
                    debug!(
                        "Block volume filesystem of pool has changed since cached image \
                         volume created, regenerating image volume"
                    );
                }

                self.delete_image(fingerprint, op)?;
                img_db_vol = None;
                img_vol = self.get_volume(
                    VolumeType::Image,
                    content_type,
                    fingerprint,
                    HashMap::new(),
                );
            }
        }

        if self.driver().has_volume(&img_vol)? {
            if img_db_vol.is_some() {
                // Size the volume as if created from scratch, honoring its
                // own recorded unpacked size so an image allowed to be
                // larger than the default is not shrunk back.
                let new_size = img_vol.config_size_from_source(&img_vol)?;
                img_vol.set_config_size(&new_size);

                debug!("Setting image volume size to {:?}", img_vol.config_size());
                match self
                    .driver()
                    .set_volume_quota(&img_vol, &img_vol.config_size(), false, op)
                {
                    Err(err) if err.is_cannot_be_shrunk() || err.is_not_supported() => {
                        debug!(
                            "Volume size of pool has changed since cached image volume \
                             created and cached volume cannot be resized, regenerating \
                             image volume"
                        );
                        self.delete_image(fingerprint, op)?;
                        img_vol = self.get_volume(
                            VolumeType::Image,
                            content_type,
                            fingerprint,
                            HashMap::new(),
                        );
                    }
                    Err(err) => return Err(err),
                    Ok(()) => {
                        // A valid cached volume at the right size.
                        return Ok(());
                    }
                }
            } else {
                // An unrecorded on-disk volume is a partial unpack left by
                // an unexpected exit or a recovered pool.
                warn!("Deleting leftover/partially unpacked image volume {fingerprint}");
                self.driver().delete_volume(&img_vol, op).map_err(|err| {
                    VesselError::wrap(
                        "Failed deleting leftover/partially unpacked image volume",
                        err,
                    )
                })?;
            }
        }

        let mut revert = Reverter::new();

        let config = self.volume_db_create(
            project::DEFAULT_PROJECT,
            fingerprint,
            "",
            VolumeType::Image,
            img_vol.config().clone(),
            None,
            content_type,
            false,
            false,
        )?;
        revert.add(|| {
            let _ = self.volume_db_delete(
                project::DEFAULT_PROJECT,
                fingerprint,
                VolumeType::Image,
            );
        });

        let mut img_vol =
            self.get_volume(VolumeType::Image, content_type, fingerprint, config);

        let mut filler = self.image_filler(fingerprint);
        self.driver()
            .create_volume(&img_vol, Some(&mut filler), op)?;
        {
            let img_vol = img_vol.clone();
            revert.add(move || {
                let _ = self.driver().delete_volume(&img_vol, op);
            });
        }

        // Persist the unpacked size reported by the filler.
        if filler.size != 0 {
            img_vol.config_mut().insert(
                CONFIG_VOLATILE_ROOTFS_SIZE.to_string(),
                filler.size.to_string(),
            );
            self.state().store.update_volume(
                self.id(),
                project::DEFAULT_PROJECT,
                fingerprint,
                VolumeType::Image,
                "",
                img_vol.config().clone(),
            )?;
        }

        self.emit(LifecycleEvent::ImageCreated {
            pool: self.name().to_string(),
            fingerprint: fingerprint.to_string(),
        });

        revert.success();
        debug!("EnsureImage finished for {fingerprint} on pool {}", self.name());
        Ok(())
    }

    /// Remove a cached image volume from this pool.
    pub fn delete_image(&self, fingerprint: &str, op: &Operation) -> VesselResult<()> {
        debug!("DeleteImage started for {fingerprint} on pool {}", self.name());

        let record =
            self.volume_db_get(project::DEFAULT_PROJECT, fingerprint, VolumeType::Image)?;
        let img_vol = self.get_volume(
            VolumeType::Image,
            record.content_type,
            fingerprint,
            record.config,
        );

        if self.driver().has_volume(&img_vol)? {
            self.driver().delete_volume(&img_vol, op)?;
        }

        self.volume_db_delete(project::DEFAULT_PROJECT, fingerprint, VolumeType::Image)?;

        debug!("DeleteImage finished for {fingerprint} on pool {}", self.name());
        Ok(())
    }

    /// Update a cached image volume's description. Image volume config is
    /// managed by the pool and not editable.
    pub fn update_image(
        &self,
        fingerprint: &str,
        new_desc: &str,
        new_config: Option<HashMap<String, String>>,
        _op: &Operation,
    ) -> VesselResult<()> {
        let record =
            self.volume_db_get(project::DEFAULT_PROJECT, fingerprint, VolumeType::Image)?;

        if let Some(new_config) = new_config {
            let (changed, _) = super::detect_changed_config(&record.config, &new_config);
            if !changed.is_empty() {
                return Err(VesselError::Msg(
                    "Image volume config is not editable".to_string(),
                ));
            }
        }

        self.state().store.update_volume(
            self.id(),
            project::DEFAULT_PROJECT,
            fingerprint,
            VolumeType::Image,
            new_desc,
            record.config,
        )?;
        Ok(())
    }
}
