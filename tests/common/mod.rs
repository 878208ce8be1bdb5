// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fixtures shared by the storage integration tests: a hermetic storage
//! state rooted in a temp directory, a stub instance host, and image
//! archive builders.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    sync::Mutex,
};

use vesseld::{
    storage::{
        backend::{pools, Backend},
        db::ImageRecord,
        drivers::stream,
        paths::StateDirs,
        types::{ClientType, Instance, InstanceKind, Operation, TemplateTrigger},
        StorageState,
    },
    vessel::VesselResult,
};

pub const MEMBER: &str = "member1";

pub fn test_state(root: &Path) -> StorageState {
    let _ = env_logger::builder().is_test(true).try_init();
    StorageState::new(StateDirs::new(root), MEMBER)
}

/// Create a pool through the normal lifecycle and return its backend.
pub fn make_pool(
    state: &StorageState,
    name: &str,
    driver: &str,
    config: &[(&str, &str)],
) -> Backend {
    let config: HashMap<String, String> = config
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    pools::create(
        state,
        name,
        "",
        driver,
        config,
        ClientType::Normal,
        &Operation::new(),
    )
    .expect("pool creation failed")
}

/// A stub of the instance host.
pub struct TestInstance {
    project: String,
    name: String,
    kind: InstanceKind,
    location: String,
    running: AtomicBool,
    frozen: AtomicBool,
    snapshots: Mutex<Vec<String>>,
    base_image: Option<String>,
    root_size: Option<String>,
}

impl TestInstance {
    pub fn new(name: &str, kind: InstanceKind) -> TestInstance {
        TestInstance {
            project: "default".to_string(),
            name: name.to_string(),
            kind,
            location: MEMBER.to_string(),
            running: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            snapshots: Mutex::new(Vec::new()),
            base_image: None,
            root_size: None,
        }
    }

    pub fn container(name: &str) -> TestInstance {
        TestInstance::new(name, InstanceKind::Container)
    }

    pub fn vm(name: &str) -> TestInstance {
        TestInstance::new(name, InstanceKind::VirtualMachine)
    }

    pub fn with_base_image(mut self, fingerprint: &str) -> TestInstance {
        self.base_image = Some(fingerprint.to_string());
        self
    }

    pub fn with_root_size(mut self, size: &str) -> TestInstance {
        self.root_size = Some(size.to_string());
        self
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn add_snapshot(&self, full_name: &str) {
        self.snapshots.lock().unwrap().push(full_name.to_string());
    }

    pub fn remove_snapshot(&self, full_name: &str) {
        self.snapshots.lock().unwrap().retain(|s| s != full_name);
    }
}

impl Instance for TestInstance {
    fn project(&self) -> &str {
        &self.project
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InstanceKind {
        self.kind
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn freeze(&self) -> VesselResult<()> {
        self.frozen.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unfreeze(&self) -> VesselResult<()> {
        self.frozen.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn snapshot_names(&self) -> VesselResult<Vec<String>> {
        Ok(self.snapshots.lock().unwrap().clone())
    }

    fn root_disk_size(&self) -> Option<String> {
        self.root_size.clone()
    }

    fn root_disk_state_size(&self) -> Option<String> {
        None
    }

    fn base_image(&self) -> Option<String> {
        self.base_image.clone()
    }

    fn init_pid(&self) -> Option<i32> {
        None
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn template_apply(&self, _trigger: TemplateTrigger) -> VesselResult<()> {
        Ok(())
    }
}

/// Write a container image archive (a tree stream) into the state's local
/// image store and register it in the metadata store.
pub fn seed_container_image(state: &StorageState, fingerprint: &str, files: &[(&str, &[u8])]) {
    let staging = tempfile::tempdir().unwrap();
    for (rel, content) in files {
        let path = staging.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fs::create_dir_all(state.dirs.images()).unwrap();
    let mut archive = fs::File::create(state.dirs.image_file(fingerprint)).unwrap();
    stream::send_tree(staging.path(), &mut archive, &Operation::new()).unwrap();

    state
        .store
        .create_image(ImageRecord {
            fingerprint: fingerprint.to_string(),
            project: "default".to_string(),
            kind: InstanceKind::Container,
            cached: false,
            last_use_at: None,
        })
        .unwrap();
}

/// Path of a volume's mount dir under the given pool, for assertions.
pub fn pool_vol_path(state: &StorageState, pool: &str, type_dir: &str, name: &str) -> PathBuf {
    state
        .dirs
        .pool_mount_path(pool)
        .join(type_dir)
        .join(name)
}
