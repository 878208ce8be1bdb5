// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod cache;
mod cancel;
mod locking;
mod pipe;
mod revert;

pub use self::{
    cache::PoolAvailability,
    cancel::Cancel,
    locking::{operation_lock_name, OperationLockGuard, OperationLocks},
    pipe::{pipe_pair, PipeEnd},
    revert::{RevertHook, Reverter},
};
