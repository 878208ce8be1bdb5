// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Project-prefixed storage names.
//!
//! Volumes belonging to a non-default project are stored under a
//! `<project>_<name>` storage name so that two projects can hold volumes of
//! the same name on one pool. Project names cannot contain underscores, so
//! the split is unambiguous.

/// The project that instances and volumes belong to unless told otherwise.
pub const DEFAULT_PROJECT: &str = "default";

/// The storage name for an instance volume.
pub fn instance(project: &str, name: &str) -> String {
    if project == DEFAULT_PROJECT {
        name.to_string()
    } else {
        format!("{project}_{name}")
    }
}

/// The storage name for a custom volume. Uses the same prefixing rule as
/// instances.
pub fn storage_volume(project: &str, name: &str) -> String {
    instance(project, name)
}

/// Split a storage name back into project and volume name.
pub fn instance_parts(storage_name: &str) -> (String, String) {
    match storage_name.split_once('_') {
        Some((project, name)) => (project.to_string(), name.to_string()),
        None => (DEFAULT_PROJECT.to_string(), storage_name.to_string()),
    }
}

/// Split a custom volume storage name back into project and volume name.
pub fn storage_volume_parts(storage_name: &str) -> (String, String) {
    instance_parts(storage_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Default-project names round-trip without a prefix.
    fn default_project_unprefixed() {
        assert_eq!(instance(DEFAULT_PROJECT, "c1"), "c1");
        assert_eq!(instance_parts("c1"), ("default".to_string(), "c1".to_string()));
    }

    #[test]
    /// Non-default projects round-trip through the prefix, including
    /// snapshot-shaped names.
    fn prefixed_round_trip() {
        let storage_name = instance("blue", "c1/snap0");
        assert_eq!(storage_name, "blue_c1/snap0");
        assert_eq!(
            instance_parts(&storage_name),
            ("blue".to_string(), "c1/snap0".to_string())
        );
    }
}
