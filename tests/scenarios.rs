// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end scenarios exercising the backend against the in-tree
//! drivers and the in-memory metadata store.

mod common;

use std::{collections::HashMap, fs};

use vesseld::storage::{
    drivers::{VolumeType, CONFIG_BLOCK_FILESYSTEM},
    load_by_name,
    types::{ClientType, Operation},
};

use common::*;

#[test]
/// An empty container volume appears in the store, on disk and behind its
/// symlink; deletion removes all three.
fn empty_container_create_delete() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let backend = make_pool(&state, "p1", "dir", &[]);
    let c1 = TestInstance::container("c1");

    backend.create_instance(&c1, &op).unwrap();

    let record = state
        .store
        .get_volume(backend.id(), "default", "c1", VolumeType::Container)
        .unwrap();
    assert!(!record.is_snapshot());

    let vol_path = pool_vol_path(&state, "p1", "containers", "c1");
    assert!(vol_path.is_dir());

    let symlink = root.path().join("containers/c1");
    assert_eq!(fs::read_link(&symlink).unwrap(), vol_path);

    backend.delete_instance(&c1, &op).unwrap();

    assert!(state
        .store
        .get_volume(backend.id(), "default", "c1", VolumeType::Container)
        .unwrap_err()
        .is_not_found());
    assert!(!vol_path.exists());
    assert!(fs::symlink_metadata(&symlink).is_err());
}

#[test]
/// Changing the pool's default block filesystem regenerates the cached
/// image volume exactly once and leaves existing instance volumes alone.
fn image_cache_regeneration() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let mut backend = make_pool(
        &state,
        "p2",
        "sim",
        &[("volume.block.filesystem", "ext4")],
    );
    seed_container_image(&state, "abc", &[("etc/hostname", b"image-payload")]);

    let c1 = TestInstance::container("c1").with_base_image("abc");
    backend.create_instance_from_image(&c1, "abc", &op).unwrap();

    let img_record = state
        .store
        .get_volume(backend.id(), "default", "abc", VolumeType::Image)
        .unwrap();
    assert_eq!(
        img_record.config.get(CONFIG_BLOCK_FILESYSTEM).unwrap(),
        "ext4"
    );

    // Unchanged defaults: repeated EnsureImage leaves the record alone.
    backend.ensure_image("abc", &op).unwrap();
    let unchanged = state
        .store
        .get_volume(backend.id(), "default", "abc", VolumeType::Image)
        .unwrap();
    assert_eq!(unchanged.created_at, img_record.created_at);

    // Flip the pool default to xfs; the cached image volume must be
    // deleted and recreated with the new filesystem.
    let mut new_config: HashMap<String, String> = backend.config().clone();
    new_config.insert("volume.block.filesystem".to_string(), "xfs".to_string());
    backend
        .update(ClientType::Normal, "", new_config, &op)
        .unwrap();

    backend.ensure_image("abc", &op).unwrap();

    let regenerated = state
        .store
        .get_volume(backend.id(), "default", "abc", VolumeType::Image)
        .unwrap();
    assert_eq!(
        regenerated.config.get(CONFIG_BLOCK_FILESYSTEM).unwrap(),
        "xfs"
    );
    assert_ne!(regenerated.created_at, img_record.created_at);

    // The instance volume built from the old image is untouched.
    let c1_record = state
        .store
        .get_volume(backend.id(), "default", "c1", VolumeType::Container)
        .unwrap();
    assert_eq!(
        c1_record.config.get(CONFIG_BLOCK_FILESYSTEM).unwrap(),
        "ext4"
    );
    assert_eq!(
        fs::read(pool_vol_path(&state, "p2", "containers", "c1").join("etc/hostname")).unwrap(),
        b"image-payload"
    );

    // And a second EnsureImage after the regeneration is again a no-op.
    backend.ensure_image("abc", &op).unwrap();
    let settled = state
        .store
        .get_volume(backend.id(), "default", "abc", VolumeType::Image)
        .unwrap();
    assert_eq!(settled.created_at, regenerated.created_at);
}

#[test]
/// A cross-pool VM copy carries the measured block size, the content
/// bytes, and the snapshot list in oldest-first order.
fn cross_pool_vm_copy_with_size_carry_over() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let src_pool = make_pool(&state, "p3", "dir", &[]);
    let dst_pool = make_pool(&state, "p4", "dir", &[]);

    let v2 = TestInstance::vm("v2");
    src_pool.create_instance(&v2, &op).unwrap();

    // Give the VM a root disk with recognizable content.
    let disk = src_pool.get_instance_disk(&v2).unwrap();
    let payload = vec![0xabu8; 4 << 20];
    fs::write(&disk, &payload).unwrap();

    // Two snapshots, oldest first.
    for snap in ["s1", "s2"] {
        let full = format!("v2/{snap}");
        let snap_inst = TestInstance::vm(&full);
        src_pool.create_instance_snapshot(&snap_inst, &v2, &op).unwrap();
        v2.add_snapshot(&full);
    }

    let v3 = TestInstance::vm("v3");
    v3.add_snapshot("v3/s1");
    v3.add_snapshot("v3/s2");

    dst_pool
        .create_instance_from_copy(&v3, &v2, &src_pool, true, false, &op)
        .unwrap();

    // Content bytes match and the target device is at least source-sized.
    let dst_disk = dst_pool.get_instance_disk(&v3).unwrap();
    assert_eq!(fs::read(&dst_disk).unwrap(), payload);
    assert!(fs::metadata(&dst_disk).unwrap().len() >= payload.len() as u64);

    // Snapshot records preserved in oldest-first order.
    let snaps = state
        .store
        .volume_snapshots(dst_pool.id(), "default", "v3", VolumeType::Vm);
    let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["v3/s1", "v3/s2"]);

    for snap in ["s1", "s2"] {
        assert!(root
            .path()
            .join(format!(
                "storage-pools/p4/virtual-machines-snapshots/v3/{snap}/root.img"
            ))
            .is_file());
    }
}

#[test]
/// Refreshing a custom volume deletes exactly the snapshots the source no
/// longer has and transfers exactly the missing ones.
fn refresh_with_deletion() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let src_pool = make_pool(&state, "p5", "dir", &[]);
    let dst_pool = make_pool(&state, "p6", "dir", &[]);

    src_pool
        .create_custom_volume(
            "default",
            "cv",
            "",
            HashMap::new(),
            vesseld::storage::drivers::ContentType::Fs,
            &op,
        )
        .unwrap();
    let src_path = pool_vol_path(&state, "p5", "custom", "cv");

    // Source snapshots s1, s2 (s3 comes after the initial copy).
    fs::write(src_path.join("data"), b"rev1").unwrap();
    src_pool
        .create_custom_volume_snapshot("default", "cv", "s1", None, &op)
        .unwrap();
    fs::write(src_path.join("data"), b"rev2").unwrap();
    src_pool
        .create_custom_volume_snapshot("default", "cv", "s2", None, &op)
        .unwrap();

    dst_pool
        .create_custom_volume_from_copy(
            "default",
            "default",
            "cv",
            "",
            HashMap::new(),
            &src_pool,
            "cv",
            true,
            &op,
        )
        .unwrap();

    // Diverge: the source gains s3, the target gains s4 and keeps an old
    // copy of s1 we can use to prove s1 is not re-transferred.
    fs::write(src_path.join("data"), b"rev3").unwrap();
    src_pool
        .create_custom_volume_snapshot("default", "cv", "s3", None, &op)
        .unwrap();
    dst_pool
        .create_custom_volume_snapshot("default", "cv", "s4", None, &op)
        .unwrap();

    let src_s1_data = src_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("custom-snapshots/cv/s1/data");
    fs::write(&src_s1_data, b"tampered-after-copy").unwrap();

    dst_pool
        .refresh_custom_volume(
            "default",
            "default",
            "cv",
            "",
            HashMap::new(),
            &src_pool,
            "cv",
            true,
            &op,
        )
        .unwrap();

    let snaps = state
        .store
        .volume_snapshots(dst_pool.id(), "default", "cv", VolumeType::Custom);
    let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["cv/s1", "cv/s2", "cv/s3"]);

    let dst_snaps = root.path().join("storage-pools/p6/custom-snapshots/cv");
    assert!(!dst_snaps.join("s4").exists());
    assert_eq!(fs::read(dst_snaps.join("s3/data")).unwrap(), b"rev3");
    // s1 was already present and must not have been transferred again.
    assert_eq!(fs::read(dst_snaps.join("s1/data")).unwrap(), b"rev1");
    // The volume itself now matches the source.
    assert_eq!(
        fs::read(pool_vol_path(&state, "p6", "custom", "cv").join("data")).unwrap(),
        b"rev3"
    );
}

#[test]
/// A restore blocked by newer snapshots deletes them and retries exactly
/// once, leaving the store consistent with the final state.
fn restore_requiring_snapshot_deletion() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let backend = make_pool(&state, "p7", "sim", &[("volume.block.mode", "false")]);

    backend
        .create_custom_volume(
            "default",
            "cv1",
            "",
            HashMap::new(),
            vesseld::storage::drivers::ContentType::Fs,
            &op,
        )
        .unwrap();
    let vol_path = pool_vol_path(&state, "p7", "custom", "cv1");

    for snap in ["a", "b", "c"] {
        fs::write(vol_path.join("data"), snap.as_bytes()).unwrap();
        backend
            .create_custom_volume_snapshot("default", "cv1", snap, None, &op)
            .unwrap();
    }

    backend
        .restore_custom_volume("default", "cv1", "a", &op)
        .unwrap();

    assert_eq!(fs::read(vol_path.join("data")).unwrap(), b"a");

    let snaps = state
        .store
        .volume_snapshots(backend.id(), "default", "cv1", VolumeType::Custom);
    let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["cv1/a"]);

    let snap_dir = root.path().join("storage-pools/p7/custom-snapshots/cv1");
    assert!(snap_dir.join("a").is_dir());
    assert!(!snap_dir.join("b").exists());
    assert!(!snap_dir.join("c").exists());
}

#[test]
/// After a metadata store loss, the scanner reconstructs an orphaned
/// instance from its descriptor, including both snapshots, and the import
/// restores records and symlinks.
fn recovery_of_orphaned_instance() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let backend = make_pool(&state, "p8", "dir", &[]);
    let c9 = TestInstance::container("c9");
    backend.create_instance(&c9, &op).unwrap();

    let vol_path = pool_vol_path(&state, "p8", "containers", "c9");
    fs::write(vol_path.join("data"), b"precious").unwrap();

    for snap in ["snap0", "snap1"] {
        let full = format!("c9/{snap}");
        let snap_inst = TestInstance::container(&full);
        backend.create_instance_snapshot(&snap_inst, &c9, &op).unwrap();
        c9.add_snapshot(&full);
    }

    backend.update_instance_backup_file(&c9, true, &op).unwrap();

    // Simulate a database loss: a fresh state over the same on-disk tree,
    // with only the pool record re-seeded.
    let state2 = test_state(root.path());
    state2
        .store
        .create_pool("p8", "", "dir", HashMap::new())
        .unwrap();
    state2
        .store
        .set_pool_status("p8", vesseld::storage::types::PoolStatus::Created)
        .unwrap();
    let backend2 = load_by_name(&state2, "p8").unwrap();

    let unknown = backend2.list_unknown_volumes(&op).unwrap();
    let configs = unknown.get("default").expect("project entry");
    assert_eq!(configs.len(), 1);

    let config = &configs[0];
    assert_eq!(config.instance.as_ref().unwrap().name, "c9");
    let snap_names: Vec<&str> = config
        .volume_snapshots
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(snap_names, vec!["snap0", "snap1"]);

    // Import and verify records plus symlinks come back. The instance
    // host recreates its own records from the descriptor first.
    state2.store.register_instance("default", "c9");
    state2.store.register_instance("default", "c9/snap0");
    state2.store.register_instance("default", "c9/snap1");

    let c9_imported = TestInstance::container("c9");
    let _cleanup = backend2.import_instance(&c9_imported, Some(config), &op).unwrap();

    assert!(state2
        .store
        .get_volume(backend2.id(), "default", "c9", VolumeType::Container)
        .is_ok());
    assert!(state2
        .store
        .get_volume(backend2.id(), "default", "c9/snap0", VolumeType::Container)
        .is_ok());
    assert_eq!(
        fs::read_link(root.path().join("containers/c9")).unwrap(),
        vol_path
    );
    assert_eq!(fs::read(vol_path.join("data")).unwrap(), b"precious");
}

#[test]
/// A failed pool mount marks the pool unavailable on this member; a
/// successful mount clears the mark.
fn pool_availability_tracks_mounts() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());

    let source = root.path().join("backing");
    fs::create_dir(&source).unwrap();

    let backend = make_pool(
        &state,
        "p9",
        "dir",
        &[("source", source.to_str().unwrap())],
    );
    assert!(state.availability.is_available("p9"));

    // Losing the backing directory fails the mount.
    fs::remove_dir(&source).unwrap();
    assert!(backend.mount().is_err());
    assert!(!state.availability.is_available("p9"));
    assert!(backend.is_status_ready().is_err());

    // Restoring it brings the pool back.
    fs::create_dir(&source).unwrap();
    backend.mount().unwrap();
    assert!(state.availability.is_available("p9"));
    assert!(backend.is_status_ready().is_ok());
}

#[test]
/// A fault injected mid-create reverts the store, the disk and the
/// symlinks to the prior state.
fn create_fault_leaves_no_partial_state() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let backend = make_pool(&state, "p10", "dir", &[]);

    // Pre-existing on-disk volume directory makes the driver create step
    // fail after the DB record was written.
    let vol_path = pool_vol_path(&state, "p10", "containers", "c1");
    fs::create_dir_all(&vol_path).unwrap();

    let c1 = TestInstance::container("c1");
    assert!(backend.create_instance(&c1, &op).is_err());

    // No record, no symlink; only the injected directory remains.
    assert!(state
        .store
        .get_volume(backend.id(), "default", "c1", VolumeType::Container)
        .unwrap_err()
        .is_not_found());
    assert!(fs::symlink_metadata(root.path().join("containers/c1")).is_err());
}

#[test]
/// An instance backup streams out with its snapshots and restores onto
/// another pool via the deferred post hook.
fn backup_and_restore_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let src_pool = make_pool(&state, "p12", "dir", &[]);
    let dst_pool = make_pool(&state, "p13", "dir", &[]);

    let c1 = TestInstance::container("c1");
    src_pool.create_instance(&c1, &op).unwrap();
    fs::write(
        pool_vol_path(&state, "p12", "containers", "c1").join("data"),
        b"payload",
    )
    .unwrap();

    let snap_inst = TestInstance::container("c1/s1");
    src_pool.create_instance_snapshot(&snap_inst, &c1, &op).unwrap();
    c1.add_snapshot("c1/s1");

    let mut archive = Vec::new();
    src_pool
        .backup_instance(&c1, &mut archive, false, true, &op)
        .unwrap();

    let config = src_pool
        .generate_instance_backup_config(&c1, true, &op)
        .unwrap();
    let info = vesseld::storage::backup::RestoreInfo {
        project: "default".to_string(),
        name: "c2".to_string(),
        kind: Some(vesseld::storage::types::InstanceKind::Container),
        snapshots: vec!["s1".to_string()],
        optimized_storage: false,
        config: Some(config),
    };

    let (post_hook, _revert_hook) = dst_pool
        .create_instance_from_backup(info, &mut &archive[..], &op)
        .unwrap();

    // The instance host creates the instance, then runs the post hook to
    // create the volume records.
    let c2 = TestInstance::container("c2");
    c2.add_snapshot("c2/s1");
    state.store.register_instance("default", "c2");
    state.store.register_instance("default", "c2/s1");
    post_hook(&c2).unwrap();

    assert_eq!(
        fs::read(pool_vol_path(&state, "p13", "containers", "c2").join("data")).unwrap(),
        b"payload"
    );
    assert!(root
        .path()
        .join("storage-pools/p13/containers-snapshots/c2/s1/data")
        .is_file());
    assert!(state
        .store
        .get_volume(dst_pool.id(), "default", "c2", VolumeType::Container)
        .is_ok());
    assert!(state
        .store
        .get_volume(dst_pool.id(), "default", "c2/s1", VolumeType::Container)
        .is_ok());
}

#[test]
/// ISO custom volumes import from a stream and are immutable afterwards.
fn iso_import_is_read_only() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let backend = make_pool(&state, "p14", "dir", &[]);

    let iso_bytes = vec![0x42u8; 2048];
    backend
        .create_custom_volume_from_iso("default", "install-media", &mut &iso_bytes[..], &op)
        .unwrap();

    let record = state
        .store
        .get_volume(backend.id(), "default", "install-media", VolumeType::Custom)
        .unwrap();
    assert_eq!(
        record.content_type,
        vesseld::storage::drivers::ContentType::Iso
    );
    assert_eq!(
        fs::read(pool_vol_path(&state, "p14", "custom", "install-media").join("root.iso"))
            .unwrap(),
        iso_bytes
    );

    // Config changes are refused for ISO volumes.
    let mut new_config = HashMap::new();
    new_config.insert("size".to_string(), "1GiB".to_string());
    assert!(backend
        .update_custom_volume("default", "install-media", "", new_config, &op)
        .is_err());

    // Snapshots of ISO volumes are refused too.
    assert!(backend
        .create_custom_volume_snapshot("default", "install-media", "s1", None, &op)
        .is_err());
}

#[test]
/// Update refuses to shrink a pool.
fn pool_size_monotonicity() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path());
    let op = Operation::new();

    let mut backend = make_pool(&state, "p11", "dir", &[("size", "10GiB")]);

    let mut smaller: HashMap<String, String> = backend.config().clone();
    smaller.insert("size".to_string(), "5GiB".to_string());
    assert!(backend
        .update(ClientType::Normal, "", smaller, &op)
        .is_err());

    let mut larger: HashMap<String, String> = backend.config().clone();
    larger.insert("size".to_string(), "20GiB".to_string());
    backend.update(ClientType::Normal, "", larger, &op).unwrap();
    assert_eq!(backend.config().get("size").unwrap(), "20GiB");
}
