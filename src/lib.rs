// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The storage backend layer of the vessel container and virtual machine
//! manager.
//!
//! The `storage` module mediates between high-level instance and volume
//! operations and a set of pluggable storage drivers. It owns the lifecycle
//! of every on-disk artifact (instance root disks, snapshots, cached images,
//! custom volumes, backups), coordinates migration of those artifacts
//! between pools and hosts, and keeps the cluster-replicated metadata store
//! and per-host on-disk state consistent with each other.

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

pub mod storage;
pub mod vessel;
