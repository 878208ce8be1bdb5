// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    storage::structures::Cancel,
    vessel::{VesselError, VesselResult},
};

/// Cluster-wide status of a storage pool as recorded in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Pending,
    Created,
    Errored,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolStatus::Pending => write!(f, "pending"),
            PoolStatus::Created => write!(f, "created"),
            PoolStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Status string reported for a pool that failed to mount on this member.
/// Never persisted: the pool may be recovered later, so the stored status is
/// left alone.
pub const POOL_STATUS_UNAVAILABLE: &str = "unavailable";

/// Per-cluster-member state of a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Pending,
    Created,
    Errored,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Pending => write!(f, "pending"),
            MemberState::Created => write!(f, "created"),
            MemberState::Errored => write!(f, "errored"),
        }
    }
}

/// Which kind of cluster client a request originated from. Only requests
/// from a normal client persist global database changes; notifications
/// between members and joining members restrict themselves to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Normal,
    Notifier,
    Joiner,
}

/// The kind of instance whose root disk a volume backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceKind {
    Container,
    VirtualMachine,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Container => write!(f, "container"),
            InstanceKind::VirtualMachine => write!(f, "virtual-machine"),
        }
    }
}

impl FromStr for InstanceKind {
    type Err = VesselError;

    fn from_str(s: &str) -> VesselResult<InstanceKind> {
        match s {
            "container" => Ok(InstanceKind::Container),
            "virtual-machine" => Ok(InstanceKind::VirtualMachine),
            _ => Err(VesselError::Msg(format!("Unknown instance kind {s:?}"))),
        }
    }
}

/// Template hooks invoked on the instance host at create/copy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateTrigger {
    Create,
    Copy,
}

/// Context threaded through every backend and driver call. Carries the
/// operation id for logging and the cancellation token; blocking points
/// check the token and surface `VesselError::Cancelled` promptly.
#[derive(Debug, Clone, Default)]
pub struct Operation {
    id: Uuid,
    cancel: Cancel,
}

impl Operation {
    pub fn new() -> Operation {
        Operation {
            id: Uuid::new_v4(),
            cancel: Cancel::new(),
        }
    }

    pub fn with_cancel(cancel: Cancel) -> Operation {
        Operation {
            id: Uuid::new_v4(),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &Cancel {
        &self.cancel
    }

    pub fn check_cancelled(&self) -> VesselResult<()> {
        if self.cancel.is_cancelled() {
            Err(VesselError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The slice of the instance host the storage layer depends on: identity,
/// running state, freeze control, the snapshot list (oldest first), root
/// disk overrides and template hooks. Implementations are shared across
/// the concurrent halves of a migration, hence `Sync`.
pub trait Instance: Sync {
    fn project(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> InstanceKind;
    fn is_running(&self) -> bool;
    fn is_frozen(&self) -> bool;
    fn freeze(&self) -> VesselResult<()>;
    fn unfreeze(&self) -> VesselResult<()>;

    /// Full snapshot names (`parent/snap`), oldest first.
    fn snapshot_names(&self) -> VesselResult<Vec<String>>;

    /// Effective `size` override from the instance's root disk device.
    fn root_disk_size(&self) -> Option<String>;

    /// Effective `size.state` override from the instance's root disk device.
    fn root_disk_state_size(&self) -> Option<String>;

    /// Fingerprint of the image the instance was created from, if any.
    fn base_image(&self) -> Option<String>;

    /// Init process id when running; used for delegated volume support.
    fn init_pid(&self) -> Option<i32>;

    /// Name of the cluster member the instance is scheduled on.
    fn location(&self) -> &str;

    /// Path used for a best-effort filesystem sync while frozen.
    fn rootfs_path(&self) -> Option<PathBuf> {
        None
    }

    fn template_apply(&self, trigger: TemplateTrigger) -> VesselResult<()>;

    fn is_snapshot(&self) -> bool {
        self.name().contains('/')
    }
}

/// Lifecycle notifications handed to the event sink. Delivery is
/// fire-and-forget; a failing sink never fails the originating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    StorageVolumeCreated { pool: String, project: String, name: String, vol_type: String },
    StorageVolumeUpdated { pool: String, project: String, name: String, vol_type: String },
    StorageVolumeDeleted { pool: String, project: String, name: String, vol_type: String },
    StorageVolumeRenamed { pool: String, project: String, name: String, new_name: String, vol_type: String },
    StorageVolumeRestored { pool: String, project: String, name: String, snapshot: String },
    StorageVolumeSnapshotCreated { pool: String, project: String, name: String },
    StorageVolumeSnapshotUpdated { pool: String, project: String, name: String },
    StorageVolumeSnapshotRenamed { pool: String, project: String, name: String, new_name: String },
    StorageVolumeSnapshotDeleted { pool: String, project: String, name: String },
    ImageCreated { pool: String, fingerprint: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Default sink: log the event and move on.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: LifecycleEvent) {
        debug!("Lifecycle event: {event:?}");
    }
}

/// Hook run against the instance after a mount completes.
pub type MountPostHook = Box<dyn FnOnce(&dyn Instance) -> VesselResult<()>>;

/// Result of mounting an instance volume.
pub struct MountInfo {
    /// Location of the root block device, for block-backed volumes.
    pub disk_path: Option<PathBuf>,
    /// Hooks the caller must run once the instance is available.
    pub post_hooks: Vec<MountPostHook>,
}

impl fmt::Debug for MountInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountInfo")
            .field("disk_path", &self.disk_path)
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}
