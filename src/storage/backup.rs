// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The descriptor written inside each volume is the recovery path of last
// resort after a metadata store loss, so it only uses simple,
// serde-friendly save structs. In-memory state is converted to and from
// them at this boundary rather than serialized directly.

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    storage::{
        drivers::{ContentType, VolumeType},
        paths::BACKUP_FILE,
        types::InstanceKind,
    },
    vessel::{VesselError, VesselResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSave {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSave {
    pub name: String,
    pub kind: InstanceKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshotSave {
    /// Snapshot-only name, without the parent prefix.
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSave {
    pub name: String,
    pub vol_type: VolumeType,
    pub content_type: ContentType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshotSave {
    /// Snapshot-only name, without the parent prefix.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The self-describing descriptor stored at `<volume-mount>/backup.yaml`
/// and embedded in backup tarballs and migration index headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: Option<PoolSave>,
    #[serde(default)]
    pub instance: Option<InstanceSave>,
    /// Instance snapshots, oldest first.
    #[serde(default)]
    pub snapshots: Vec<InstanceSnapshotSave>,
    #[serde(default)]
    pub volume: Option<VolumeSave>,
    /// Volume snapshots, oldest first.
    #[serde(default)]
    pub volume_snapshots: Vec<VolumeSnapshotSave>,
}

impl Config {
    /// Look up a volume snapshot's saved config by its snapshot-only name.
    /// Snapshot config is matched by name only, never by list position.
    pub fn snapshot_config_by_name(&self, name: &str) -> Option<&VolumeSnapshotSave> {
        self.volume_snapshots.iter().find(|snap| snap.name == name)
    }
}

/// Everything needed to restore an instance or custom volume from a
/// backup stream.
#[derive(Debug)]
pub struct RestoreInfo {
    pub project: String,
    pub name: String,
    /// Instance kind; `None` for custom volumes.
    pub kind: Option<InstanceKind>,
    /// Snapshot-only names contained in the backup, oldest first.
    pub snapshots: Vec<String>,
    /// Whether the backup was taken in the driver's optimized format.
    pub optimized_storage: bool,
    pub config: Option<Config>,
}

/// Write the descriptor into a volume mount, mode 0400. Any existing
/// descriptor is replaced.
pub fn write_descriptor(mount_path: &Path, config: &Config) -> VesselResult<()> {
    let path = mount_path.join(BACKUP_FILE);
    let payload = serde_yaml::to_string(config)?;

    if path.exists() {
        // The file is read-only; lift that before rewriting.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }

    fs::write(&path, payload)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o400))?;
    Ok(())
}

/// Parse a descriptor file.
pub fn read_descriptor(path: &Path) -> VesselResult<Config> {
    let data = fs::read_to_string(path).map_err(|err| {
        VesselError::wrap(
            format!("Failed reading backup file {}", path.display()),
            err.into(),
        )
    })?;
    let config = serde_yaml::from_str(&data).map_err(|err| {
        VesselError::wrap(
            format!("Failed parsing backup file {}", path.display()),
            err.into(),
        )
    })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            pool: Some(PoolSave {
                name: "p1".into(),
                driver: "dir".into(),
                config: HashMap::new(),
            }),
            instance: Some(InstanceSave {
                name: "c1".into(),
                kind: InstanceKind::Container,
                created_at: Utc::now(),
            }),
            snapshots: vec![InstanceSnapshotSave {
                name: "snap0".into(),
                created_at: Utc::now(),
            }],
            volume: Some(VolumeSave {
                name: "c1".into(),
                vol_type: VolumeType::Container,
                content_type: ContentType::Fs,
                description: String::new(),
                config: HashMap::from([("size".to_string(), "10GiB".to_string())]),
            }),
            volume_snapshots: vec![VolumeSnapshotSave {
                name: "snap0".into(),
                description: String::new(),
                config: HashMap::new(),
                expires_at: None,
            }],
        }
    }

    #[test]
    /// The descriptor round-trips through the on-disk file and comes back
    /// read-only.
    fn descriptor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();

        write_descriptor(dir.path(), &config).unwrap();
        // Rewriting must work despite the 0400 mode.
        write_descriptor(dir.path(), &config).unwrap();

        let path = dir.path().join(BACKUP_FILE);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);

        let parsed = read_descriptor(&path).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    /// Snapshot config lookup goes by name, not position.
    fn snapshot_lookup_by_name() {
        let mut config = sample_config();
        config.volume_snapshots.push(VolumeSnapshotSave {
            name: "snap1".into(),
            description: "second".into(),
            config: HashMap::new(),
            expires_at: None,
        });

        assert_eq!(
            config
                .snapshot_config_by_name("snap1")
                .map(|s| s.description.as_str()),
            Some("second")
        );
        assert!(config.snapshot_config_by_name("missing").is_none());
    }
}
