// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The metadata store adapter.
//!
//! The store is the sole source of truth for volume existence, config and
//! lineage; on-disk state belongs to the backends. Every method is one
//! transaction: multi-row updates (a parent rename carrying its snapshot
//! rows, a create validating and persisting config) commit or fail as a
//! unit under the store lock. In the cluster the same contract is provided
//! by the replicated database; this in-memory store stands in for it for
//! embedding and tests.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use chrono::{DateTime, Utc};

use crate::{
    storage::{
        drivers::{parent_and_snapshot_name, ContentType, VolumeType},
        types::{InstanceKind, MemberState, PoolStatus},
    },
    vessel::{VesselError, VesselResult},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub driver: String,
    pub config: HashMap<String, String>,
    pub status: PoolStatus,
    pub member_states: HashMap<String, MemberState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub pool_id: i64,
    pub project: String,
    /// Volume name; snapshots carry the `parent/snap` form.
    pub name: String,
    pub vol_type: VolumeType,
    pub content_type: ContentType,
    pub description: String,
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Expiry; snapshots only.
    pub expires_at: Option<DateTime<Utc>>,
}

impl VolumeRecord {
    pub fn is_snapshot(&self) -> bool {
        self.name.contains('/')
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub fingerprint: String,
    pub project: String,
    pub kind: InstanceKind,
    pub cached: bool,
    pub last_use_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSourceRecord {
    pub fingerprint: String,
    pub server: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningRecord {
    pub entity_type: String,
    pub entity_id: i64,
    pub message: String,
}

type VolumeKey = (i64, String, String, VolumeType);

#[derive(Debug, Default)]
struct StoreState {
    next_pool_id: i64,
    next_instance_id: i64,
    pools: HashMap<String, PoolRecord>,
    volumes: HashMap<VolumeKey, VolumeRecord>,
    images: Vec<ImageRecord>,
    image_sources: Vec<ImageSourceRecord>,
    image_members: HashMap<String, Vec<String>>,
    instances: HashMap<(String, String), i64>,
    warnings: Vec<WarningRecord>,
}

#[derive(Debug, Default)]
pub struct MetaStore {
    state: Mutex<StoreState>,
}

fn volume_key(pool_id: i64, project: &str, name: &str, vol_type: VolumeType) -> VolumeKey {
    (pool_id, project.to_string(), name.to_string(), vol_type)
}

impl MetaStore {
    // Pool records.

    /// Create a pool record in the pending state.
    pub fn create_pool(
        &self,
        name: &str,
        description: &str,
        driver: &str,
        config: HashMap<String, String>,
    ) -> VesselResult<i64> {
        let mut state = self.lock();

        if state.pools.contains_key(name) {
            return Err(VesselError::AlreadyExists(format!("Storage pool {name:?}")));
        }

        state.next_pool_id += 1;
        let id = state.next_pool_id;
        state.pools.insert(
            name.to_string(),
            PoolRecord {
                id,
                name: name.to_string(),
                description: description.to_string(),
                driver: driver.to_string(),
                config,
                status: PoolStatus::Pending,
                member_states: HashMap::new(),
            },
        );
        Ok(id)
    }

    pub fn get_pool(&self, name: &str) -> VesselResult<PoolRecord> {
        self.lock()
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| VesselError::NotFound(format!("Storage pool {name:?}")))
    }

    pub fn get_pool_id(&self, name: &str) -> VesselResult<i64> {
        Ok(self.get_pool(name)?.id)
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn update_pool(
        &self,
        name: &str,
        description: &str,
        config: HashMap<String, String>,
    ) -> VesselResult<()> {
        let mut state = self.lock();
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| VesselError::NotFound(format!("Storage pool {name:?}")))?;
        pool.description = description.to_string();
        pool.config = config;
        Ok(())
    }

    pub fn set_pool_status(&self, name: &str, status: PoolStatus) -> VesselResult<()> {
        let mut state = self.lock();
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| VesselError::NotFound(format!("Storage pool {name:?}")))?;
        pool.status = status;
        Ok(())
    }

    pub fn set_pool_member_state(
        &self,
        name: &str,
        member: &str,
        member_state: MemberState,
    ) -> VesselResult<()> {
        let mut state = self.lock();
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| VesselError::NotFound(format!("Storage pool {name:?}")))?;
        pool.member_states
            .insert(member.to_string(), member_state);
        Ok(())
    }

    /// Remove a pool record. Volume records must have been removed first.
    pub fn delete_pool(&self, name: &str) -> VesselResult<()> {
        let mut state = self.lock();
        let id = match state.pools.get(name) {
            Some(pool) => pool.id,
            None => return Err(VesselError::NotFound(format!("Storage pool {name:?}"))),
        };

        if state.volumes.keys().any(|(pool_id, ..)| *pool_id == id) {
            return Err(VesselError::Busy(format!(
                "Storage pool {name:?} still has volumes"
            )));
        }

        state.pools.remove(name);
        Ok(())
    }

    /// Count of volume records on a pool, optionally ignoring cached
    /// image volumes.
    pub fn pool_volume_count(&self, pool_id: i64, ignore_images: bool) -> usize {
        self.lock()
            .volumes
            .keys()
            .filter(|(p, _, _, vol_type)| {
                *p == pool_id && !(ignore_images && *vol_type == VolumeType::Image)
            })
            .count()
    }

    /// Names of pools holding an image volume for the fingerprint.
    pub fn pools_with_image(&self, fingerprint: &str) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .pools
            .values()
            .filter(|pool| {
                state.volumes.keys().any(|(pool_id, _, name, vol_type)| {
                    *pool_id == pool.id && name == fingerprint && *vol_type == VolumeType::Image
                })
            })
            .map(|pool| pool.name.clone())
            .collect();
        names.sort();
        names
    }

    // Volume records.

    /// Insert a volume record. A snapshot record requires its parent record
    /// to exist in the same pool.
    pub fn create_volume(&self, record: VolumeRecord) -> VesselResult<()> {
        let mut state = self.lock();

        let key = volume_key(record.pool_id, &record.project, &record.name, record.vol_type);
        if state.volumes.contains_key(&key) {
            return Err(VesselError::AlreadyExists(format!(
                "Volume {:?} in project {:?}",
                record.name, record.project
            )));
        }

        if let (parent, Some(_)) = parent_and_snapshot_name(&record.name) {
            let parent_key =
                volume_key(record.pool_id, &record.project, parent, record.vol_type);
            if !state.volumes.contains_key(&parent_key) {
                return Err(VesselError::Msg(format!(
                    "Snapshot {:?} has no parent volume record",
                    record.name
                )));
            }
        }

        state.volumes.insert(key, record);
        Ok(())
    }

    pub fn get_volume(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        vol_type: VolumeType,
    ) -> VesselResult<VolumeRecord> {
        self.lock()
            .volumes
            .get(&volume_key(pool_id, project, name, vol_type))
            .cloned()
            .ok_or_else(|| {
                VesselError::NotFound(format!("Volume {name:?} in project {project:?}"))
            })
    }

    /// Remove a volume record. A parent with remaining snapshot records
    /// cannot be removed.
    pub fn delete_volume(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        vol_type: VolumeType,
    ) -> VesselResult<()> {
        let mut state = self.lock();

        let key = volume_key(pool_id, project, name, vol_type);
        if !state.volumes.contains_key(&key) {
            return Err(VesselError::NotFound(format!(
                "Volume {name:?} in project {project:?}"
            )));
        }

        if !name.contains('/') {
            let prefix = format!("{name}/");
            let has_snapshots = state.volumes.keys().any(|(p, proj, n, t)| {
                *p == pool_id && proj == project && *t == vol_type && n.starts_with(&prefix)
            });
            if has_snapshots {
                return Err(VesselError::Busy(format!(
                    "Volume {name:?} still has snapshot records"
                )));
            }
        }

        state.volumes.remove(&key);
        Ok(())
    }

    /// Snapshot records of a volume, oldest first, ties broken by name.
    pub fn volume_snapshots(
        &self,
        pool_id: i64,
        project: &str,
        parent: &str,
        vol_type: VolumeType,
    ) -> Vec<VolumeRecord> {
        let state = self.lock();
        let prefix = format!("{parent}/");
        let mut snaps: Vec<VolumeRecord> = state
            .volumes
            .iter()
            .filter(|((p, proj, n, t), _)| {
                *p == pool_id && proj == project && *t == vol_type && n.starts_with(&prefix)
            })
            .map(|(_, record)| record.clone())
            .collect();
        snaps.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        snaps
    }

    pub fn update_volume(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        vol_type: VolumeType,
        description: &str,
        config: HashMap<String, String>,
    ) -> VesselResult<()> {
        let mut state = self.lock();
        let record = state
            .volumes
            .get_mut(&volume_key(pool_id, project, name, vol_type))
            .ok_or_else(|| {
                VesselError::NotFound(format!("Volume {name:?} in project {project:?}"))
            })?;
        record.description = description.to_string();
        record.config = config;
        Ok(())
    }

    /// Rename a volume record; a parent rename carries every snapshot
    /// record with it in the same transaction.
    pub fn rename_volume(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        new_name: &str,
        vol_type: VolumeType,
    ) -> VesselResult<()> {
        let mut state = self.lock();

        let key = volume_key(pool_id, project, name, vol_type);
        if !state.volumes.contains_key(&key) {
            return Err(VesselError::NotFound(format!(
                "Volume {name:?} in project {project:?}"
            )));
        }

        let new_key = volume_key(pool_id, project, new_name, vol_type);
        if state.volumes.contains_key(&new_key) {
            return Err(VesselError::AlreadyExists(format!("Volume {new_name:?}")));
        }

        let mut moves = vec![(key, new_key)];
        if !name.contains('/') {
            let prefix = format!("{name}/");
            for (k, _) in state.volumes.iter() {
                let (p, proj, n, t) = k;
                if *p == pool_id && proj == project && *t == vol_type && n.starts_with(&prefix) {
                    let suffix = &n[prefix.len()..];
                    let renamed = format!("{new_name}/{suffix}");
                    let new_snap_key = volume_key(pool_id, project, &renamed, vol_type);
                    if state.volumes.contains_key(&new_snap_key) {
                        return Err(VesselError::AlreadyExists(format!("Volume {renamed:?}")));
                    }
                    moves.push((k.clone(), new_snap_key));
                }
            }
        }

        for (old_key, new_key) in moves {
            let mut record = state.volumes.remove(&old_key).expect("checked above");
            record.name = new_key.2.clone();
            state.volumes.insert(new_key, record);
        }

        Ok(())
    }

    pub fn volume_snapshot_expiry(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        vol_type: VolumeType,
    ) -> VesselResult<Option<DateTime<Utc>>> {
        Ok(self.get_volume(pool_id, project, name, vol_type)?.expires_at)
    }

    pub fn update_volume_snapshot(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        vol_type: VolumeType,
        description: &str,
        config: HashMap<String, String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> VesselResult<()> {
        let mut state = self.lock();
        let record = state
            .volumes
            .get_mut(&volume_key(pool_id, project, name, vol_type))
            .ok_or_else(|| {
                VesselError::NotFound(format!("Volume {name:?} in project {project:?}"))
            })?;
        if !record.is_snapshot() {
            return Err(VesselError::Msg(format!(
                "Volume {name:?} is not a snapshot"
            )));
        }
        record.description = description.to_string();
        record.config = config;
        record.expires_at = expires_at;
        Ok(())
    }

    // Image records.

    pub fn create_image(&self, record: ImageRecord) -> VesselResult<()> {
        let mut state = self.lock();
        if state
            .images
            .iter()
            .any(|img| img.fingerprint == record.fingerprint && img.project == record.project)
        {
            return Err(VesselError::AlreadyExists(format!(
                "Image {:?}",
                record.fingerprint
            )));
        }
        state.images.push(record);
        Ok(())
    }

    pub fn get_image(&self, fingerprint: &str, project: &str) -> VesselResult<ImageRecord> {
        self.lock()
            .images
            .iter()
            .find(|img| img.fingerprint == fingerprint && img.project == project)
            .cloned()
            .ok_or_else(|| VesselError::NotFound(format!("Image {fingerprint:?}")))
    }

    pub fn get_image_from_any_project(&self, fingerprint: &str) -> VesselResult<ImageRecord> {
        self.lock()
            .images
            .iter()
            .find(|img| img.fingerprint == fingerprint)
            .cloned()
            .ok_or_else(|| VesselError::NotFound(format!("Image {fingerprint:?}")))
    }

    pub fn create_image_source(&self, record: ImageSourceRecord) -> VesselResult<()> {
        self.lock().image_sources.push(record);
        Ok(())
    }

    /// Fingerprint of a cached image previously downloaded from the given
    /// source alias.
    pub fn get_cached_image_source_fingerprint(
        &self,
        server: &str,
        alias: &str,
    ) -> VesselResult<String> {
        let state = self.lock();
        state
            .image_sources
            .iter()
            .find(|src| {
                src.server == server
                    && src.alias == alias
                    && state
                        .images
                        .iter()
                        .any(|img| img.fingerprint == src.fingerprint && img.cached)
            })
            .map(|src| src.fingerprint.clone())
            .ok_or_else(|| {
                VesselError::NotFound(format!("Cached image for alias {alias:?} on {server:?}"))
            })
    }

    pub fn add_image_to_local_member(&self, fingerprint: &str, member: &str) -> VesselResult<()> {
        let mut state = self.lock();
        let members = state
            .image_members
            .entry(fingerprint.to_string())
            .or_default();
        if !members.iter().any(|m| m == member) {
            members.push(member.to_string());
        }
        Ok(())
    }

    /// Cluster members holding the image locally.
    pub fn locate_image(&self, fingerprint: &str) -> Vec<String> {
        self.lock()
            .image_members
            .get(fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_image_cached_and_last_use(&self, fingerprint: &str) -> VesselResult<()> {
        let mut state = self.lock();
        let mut found = false;
        for img in state
            .images
            .iter_mut()
            .filter(|img| img.fingerprint == fingerprint)
        {
            img.cached = true;
            img.last_use_at = Some(Utc::now());
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(VesselError::NotFound(format!("Image {fingerprint:?}")))
        }
    }

    pub fn unset_image_cached(&self, fingerprint: &str, project: &str) -> VesselResult<()> {
        let mut state = self.lock();
        let img = state
            .images
            .iter_mut()
            .find(|img| img.fingerprint == fingerprint && img.project == project)
            .ok_or_else(|| VesselError::NotFound(format!("Image {fingerprint:?}")))?;
        img.cached = false;
        Ok(())
    }

    // Instance records (owned by the instance host; mirrored here for the
    // lookups the storage layer needs).

    pub fn register_instance(&self, project: &str, name: &str) -> i64 {
        let mut state = self.lock();
        state.next_instance_id += 1;
        let id = state.next_instance_id;
        state
            .instances
            .insert((project.to_string(), name.to_string()), id);
        id
    }

    pub fn deregister_instance(&self, project: &str, name: &str) {
        self.lock()
            .instances
            .remove(&(project.to_string(), name.to_string()));
    }

    pub fn get_instance_id(&self, project: &str, name: &str) -> VesselResult<i64> {
        self.lock()
            .instances
            .get(&(project.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| {
                VesselError::NotFound(format!("Instance {name:?} in project {project:?}"))
            })
    }

    /// Full snapshot names of an instance, in creation order.
    pub fn get_instance_snapshots_names(&self, project: &str, name: &str) -> Vec<String> {
        let state = self.lock();
        let prefix = format!("{name}/");
        let mut snaps: Vec<(i64, String)> = state
            .instances
            .iter()
            .filter(|((proj, n), _)| proj == project && n.starts_with(&prefix))
            .map(|((_, n), id)| (*id, n.clone()))
            .collect();
        snaps.sort();
        snaps.into_iter().map(|(_, n)| n).collect()
    }

    // Warnings.

    pub fn add_warning(&self, entity_type: &str, entity_id: i64, message: &str) {
        self.lock().warnings.push(WarningRecord {
            entity_type: entity_type.to_string(),
            entity_id,
            message: message.to_string(),
        });
    }

    pub fn delete_warnings(&self, entity_type: &str, entity_id: i64) {
        self.lock()
            .warnings
            .retain(|w| !(w.entity_type == entity_type && w.entity_id == entity_id));
    }

    pub fn warnings(&self) -> Vec<WarningRecord> {
        self.lock().warnings.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("metadata store poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pool_id: i64, name: &str) -> VolumeRecord {
        VolumeRecord {
            pool_id,
            project: "default".into(),
            name: name.into(),
            vol_type: VolumeType::Container,
            content_type: ContentType::Fs,
            description: String::new(),
            config: HashMap::new(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    /// A snapshot record cannot exist without its parent, and a parent
    /// with snapshots cannot be deleted.
    fn snapshot_parent_invariants() {
        let store = MetaStore::default();
        let pool = store.create_pool("p1", "", "dir", HashMap::new()).unwrap();

        assert_matches!(
            store.create_volume(record(pool, "c1/s1")),
            Err(VesselError::Msg(_))
        );

        store.create_volume(record(pool, "c1")).unwrap();
        store.create_volume(record(pool, "c1/s1")).unwrap();

        assert_matches!(
            store.delete_volume(pool, "default", "c1", VolumeType::Container),
            Err(VesselError::Busy(_))
        );

        store
            .delete_volume(pool, "default", "c1/s1", VolumeType::Container)
            .unwrap();
        store
            .delete_volume(pool, "default", "c1", VolumeType::Container)
            .unwrap();
    }

    #[test]
    /// A parent rename carries all snapshot records in one transaction.
    fn rename_carries_snapshots() {
        let store = MetaStore::default();
        let pool = store.create_pool("p1", "", "dir", HashMap::new()).unwrap();
        store.create_volume(record(pool, "c1")).unwrap();
        store.create_volume(record(pool, "c1/s1")).unwrap();
        store.create_volume(record(pool, "c1/s2")).unwrap();

        store
            .rename_volume(pool, "default", "c1", "c2", VolumeType::Container)
            .unwrap();

        assert!(store
            .get_volume(pool, "default", "c2/s1", VolumeType::Container)
            .is_ok());
        assert!(store
            .get_volume(pool, "default", "c2/s2", VolumeType::Container)
            .is_ok());
        assert!(store
            .get_volume(pool, "default", "c1", VolumeType::Container)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    /// Snapshot listings come back oldest first with name tie-breaks.
    fn snapshots_ordered_oldest_first() {
        let store = MetaStore::default();
        let pool = store.create_pool("p1", "", "dir", HashMap::new()).unwrap();
        store.create_volume(record(pool, "c1")).unwrap();

        let base = Utc::now();
        for (name, offset) in [("c1/new", 10), ("c1/old", 0), ("c1/mid", 5)] {
            let mut rec = record(pool, name);
            rec.created_at = base + chrono::Duration::seconds(offset);
            store.create_volume(rec).unwrap();
        }

        let names: Vec<String> = store
            .volume_snapshots(pool, "default", "c1", VolumeType::Container)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["c1/old", "c1/mid", "c1/new"]);
    }

    #[test]
    /// Pools holding an image volume are discoverable by fingerprint.
    fn pools_with_image_lookup() {
        let store = MetaStore::default();
        let p1 = store.create_pool("p1", "", "sim", HashMap::new()).unwrap();
        let _p2 = store.create_pool("p2", "", "sim", HashMap::new()).unwrap();

        let mut rec = record(p1, "abc123");
        rec.vol_type = VolumeType::Image;
        store.create_volume(rec).unwrap();

        assert_eq!(store.pools_with_image("abc123"), vec!["p1".to_string()]);
        assert!(store.pools_with_image("missing").is_empty());
    }
}
