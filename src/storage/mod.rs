// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The storage core: backends bound to pools, the driver contract, the
//! metadata store adapter, the migration engine and the recovery scanner.

use std::sync::Arc;

pub mod backend;
pub mod backup;
pub mod db;
pub mod drivers;
pub mod migration;
pub mod paths;
pub mod project;
pub mod structures;
pub mod types;

use crate::{
    storage::{
        db::MetaStore,
        drivers::{ContentType, MountCounts, VolumeType},
        paths::StateDirs,
        structures::{OperationLocks, PoolAvailability},
        types::{EventSink, InstanceKind, LogSink},
    },
    vessel::{VesselError, VesselResult},
};

pub use self::backend::{load_by_name, pools, Backend};

/// Shared state handed to every backend: the injected state root, the
/// metadata store, the pool availability cache, the named operation lock
/// registry, the event sink, the volume mount reference counts and the name
/// of the local cluster member.
#[derive(Clone)]
pub struct StorageState {
    pub dirs: StateDirs,
    pub store: Arc<MetaStore>,
    pub availability: PoolAvailability,
    pub locks: OperationLocks,
    pub events: Arc<dyn EventSink>,
    pub mounts: MountCounts,
    pub member_name: String,
}

impl StorageState {
    pub fn new(dirs: StateDirs, member_name: &str) -> StorageState {
        StorageState {
            dirs,
            store: Arc::new(MetaStore::default()),
            availability: PoolAvailability::default(),
            locks: OperationLocks::default(),
            events: Arc::new(LogSink),
            mounts: MountCounts::default(),
            member_name: member_name.to_string(),
        }
    }
}

impl std::fmt::Debug for StorageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageState")
            .field("dirs", &self.dirs)
            .field("member_name", &self.member_name)
            .finish()
    }
}

/// Map an instance kind to the volume type backing its root disk.
pub fn instance_volume_type(kind: InstanceKind) -> VolumeType {
    match kind {
        InstanceKind::Container => VolumeType::Container,
        InstanceKind::VirtualMachine => VolumeType::Vm,
    }
}

/// Map an instance kind to the content type of its root volume. Containers
/// are filesystem volumes, virtual machines are block volumes.
pub fn instance_content_type(kind: InstanceKind) -> ContentType {
    match kind {
        InstanceKind::Container => ContentType::Fs,
        InstanceKind::VirtualMachine => ContentType::Block,
    }
}

/// Map a volume type back to the instance kind it backs.
pub fn volume_type_instance_kind(vol_type: VolumeType) -> VesselResult<InstanceKind> {
    match vol_type {
        VolumeType::Container => Ok(InstanceKind::Container),
        VolumeType::Vm => Ok(InstanceKind::VirtualMachine),
        _ => Err(VesselError::Msg(format!(
            "Volume type {vol_type} is not an instance type"
        ))),
    }
}
