// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::mem;

/// A self-contained compensating action, as handed across API boundaries
/// (e.g. from a driver's backup unpack to the backend).
pub type RevertHook = Box<dyn FnOnce() + Send>;

/// A LIFO chain of compensating actions with an opt-in success marker.
///
/// Every multi-step mutating operation registers a hook right after each
/// side effect it produces. If the operation returns without calling
/// `success`, dropping the reverter runs the hooks in reverse registration
/// order. Hooks run to completion even if earlier ones report problems;
/// they are infallible by construction and log internally if they need to.
#[derive(Default)]
pub struct Reverter<'a> {
    hooks: Vec<Box<dyn FnOnce() + 'a>>,
    succeeded: bool,
}

impl<'a> Reverter<'a> {
    pub fn new() -> Reverter<'a> {
        Reverter {
            hooks: Vec::new(),
            succeeded: false,
        }
    }

    /// Register a compensating action for the most recent side effect.
    pub fn add<F>(&mut self, hook: F)
    where
        F: FnOnce() + 'a,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Mark the operation as complete. Registered hooks will not run.
    pub fn success(&mut self) {
        self.succeeded = true;
    }

    /// Consume the chain and hand back a single hook running everything
    /// registered so far, for callers that need to revert later from a
    /// different scope.
    pub fn into_hook(mut self) -> Box<dyn FnOnce() + 'a> {
        let hooks = mem::take(&mut self.hooks);
        self.succeeded = true;
        Box::new(move || {
            for hook in hooks.into_iter().rev() {
                hook();
            }
        })
    }
}

impl Drop for Reverter<'_> {
    fn drop(&mut self) {
        if self.succeeded {
            return;
        }

        for hook in mem::take(&mut self.hooks).into_iter().rev() {
            hook();
        }
    }
}

impl std::fmt::Debug for Reverter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reverter")
            .field("hooks", &self.hooks.len())
            .field("succeeded", &self.succeeded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    /// Hooks run in reverse registration order on failure.
    fn lifo_order_on_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut revert = Reverter::new();
            for i in 0..3 {
                let order = Arc::clone(&order);
                revert.add(move || order.lock().unwrap().push(i));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    /// Nothing runs after the success marker.
    fn nothing_runs_on_success() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut revert = Reverter::new();
            let o = Arc::clone(&order);
            revert.add(move || o.lock().unwrap().push(1));
            revert.success();
        }
        assert!(order.lock().unwrap().is_empty());
    }

    #[test]
    /// Hooks may borrow from the enclosing scope.
    fn hooks_can_borrow() {
        let counter = Mutex::new(0);
        {
            let mut revert = Reverter::new();
            revert.add(|| *counter.lock().unwrap() += 1);
        }
        assert_eq!(*counter.lock().unwrap(), 1);
    }

    #[test]
    /// An extracted hook keeps the chain alive past the original scope.
    fn extracted_hook_runs_later() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let hook = {
            let mut revert = Reverter::new();
            for i in 0..2 {
                let order = Arc::clone(&order);
                revert.add(move || order.lock().unwrap().push(i));
            }
            revert.into_hook()
        };
        assert!(order.lock().unwrap().is_empty());
        hook();
        assert_eq!(*order.lock().unwrap(), vec![1, 0]);
    }
}
