// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashSet,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use crate::{
    storage::{
        drivers::{ContentType, VolumeType},
        types::Operation,
    },
    vessel::VesselResult,
};

/// How often a waiter re-checks its cancellation token.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// The canonical key for a named per-volume operation lock.
pub fn operation_lock_name(
    op_name: &str,
    pool: &str,
    vol_type: VolumeType,
    content_type: ContentType,
    vol_name: &str,
) -> String {
    format!("{op_name}/{pool}/{vol_type}/{content_type}/{vol_name}")
}

/// A registry of named mutexes serializing dangerous per-volume regions.
///
/// Locks are keyed by the string produced by `operation_lock_name`; a
/// separate key space (e.g. `EnsureImage`) can be chosen to serialize with
/// itself without deadlocking against volume-level locks taken further down
/// the call chain.
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    inner: Arc<(Mutex<HashSet<String>>, Condvar)>,
}

impl OperationLocks {
    /// Acquire the named lock, waiting until it is free. Cancellation of
    /// the operation aborts the wait.
    pub fn lock<S>(&self, key: S, op: &Operation) -> VesselResult<OperationLockGuard>
    where
        S: Into<String>,
    {
        let key = key.into();
        let (held, cond) = &*self.inner;
        let mut held = held.lock().expect("operation lock registry poisoned");

        while held.contains(&key) {
            op.check_cancelled()?;
            let (guard, _) = cond
                .wait_timeout(held, WAIT_SLICE)
                .expect("operation lock registry poisoned");
            held = guard;
        }

        trace!("Acquired operation lock {key}");
        held.insert(key.clone());

        Ok(OperationLockGuard {
            registry: Arc::clone(&self.inner),
            key,
        })
    }
}

/// Releases the named lock when dropped.
#[derive(Debug)]
pub struct OperationLockGuard {
    registry: Arc<(Mutex<HashSet<String>>, Condvar)>,
    key: String,
}

impl Drop for OperationLockGuard {
    fn drop(&mut self) {
        let (held, cond) = &*self.registry;
        held.lock()
            .expect("operation lock registry poisoned")
            .remove(&self.key);
        cond.notify_all();
        trace!("Released operation lock {}", self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::{storage::structures::Cancel, vessel::VesselError};

    use super::*;

    #[test]
    /// Two threads taking the same key serialize; different keys do not
    /// block each other.
    fn same_key_serializes() {
        let locks = OperationLocks::default();
        let op = Operation::new();

        let guard = locks.lock("a", &op).unwrap();
        let _other = locks.lock("b", &op).unwrap();

        let locks2 = locks.clone();
        let handle = thread::spawn(move || {
            let op = Operation::new();
            let _guard = locks2.lock("a", &op).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    /// A cancelled operation stops waiting for a held lock.
    fn cancel_aborts_wait() {
        let locks = OperationLocks::default();
        let op = Operation::new();
        let _guard = locks.lock("a", &op).unwrap();

        let cancel = Cancel::new();
        let waiting_op = Operation::with_cancel(cancel.clone());
        cancel.cancel();
        assert_matches!(locks.lock("a", &waiting_op), Err(VesselError::Cancelled));
    }
}
