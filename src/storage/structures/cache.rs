// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

/// The set of pools considered unavailable on this host.
///
/// Entries are added when a pool mount fails and cleared when a mount
/// succeeds or the pool is deleted. The cache is an injected value shared by
/// every backend rather than a process global, so embedders and tests stay
/// hermetic. The persisted pool status is never touched: availability is a
/// local, recoverable condition.
#[derive(Debug, Clone, Default)]
pub struct PoolAvailability {
    unavailable: Arc<Mutex<HashSet<String>>>,
}

impl PoolAvailability {
    pub fn is_available(&self, pool: &str) -> bool {
        !self
            .unavailable
            .lock()
            .expect("pool availability cache poisoned")
            .contains(pool)
    }

    pub fn set_unavailable(&self, pool: &str) {
        let inserted = self
            .unavailable
            .lock()
            .expect("pool availability cache poisoned")
            .insert(pool.to_string());
        if inserted {
            warn!("Marking pool {pool} unavailable on this member");
        }
    }

    pub fn set_available(&self, pool: &str) {
        self.unavailable
            .lock()
            .expect("pool availability cache poisoned")
            .remove(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Availability flips with mount outcomes and clones observe it.
    fn shared_between_clones() {
        let cache = PoolAvailability::default();
        let other = cache.clone();

        assert!(cache.is_available("p1"));
        other.set_unavailable("p1");
        assert!(!cache.is_available("p1"));
        cache.set_available("p1");
        assert!(other.is_available("p1"));
    }
}
