//! Process-wide liveness registry for [`PathSpace`] instances.
//!
//! Long-lived machinery (notification sinks, mount servers, background
//! tasks) may hold references to spaces it does not own. Before notifying
//! through such a reference it must go through [`SpaceRegistry::safe_notify`],
//! which drops the notification when the target is no longer registered.
//! Spaces unregister first thing in their destructor, before any teardown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use crate::space::PathSpace;

/// Global registry of live spaces, keyed by address identity.
pub struct SpaceRegistry {
    set: Mutex<HashSet<usize>>,
}

impl SpaceRegistry {
    /// The process-wide instance.
    pub fn instance() -> &'static SpaceRegistry {
        static INSTANCE: OnceLock<SpaceRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| SpaceRegistry {
            set: Mutex::new(HashSet::new()),
        })
    }

    /// Register a space as alive. Idempotent.
    pub fn register(&self, space: &Arc<PathSpace>) {
        self.lock().insert(Arc::as_ptr(space) as usize);
    }

    /// Unregister a space by its address key. Idempotent.
    pub fn unregister_key(&self, key: usize) {
        self.lock().remove(&key);
    }

    /// True when the space is currently registered.
    pub fn is_registered(&self, space: &Arc<PathSpace>) -> bool {
        self.lock().contains(&(Arc::as_ptr(space) as usize))
    }

    /// Notify `path` on the referenced space only if it is still alive and
    /// registered.
    ///
    /// The membership check happens under the registry lock; the notify call
    /// happens outside it. A panicking notify is caught and logged, never
    /// propagated.
    pub fn safe_notify(&self, space: &Weak<PathSpace>, path: &str) {
        let Some(space) = space.upgrade() else {
            return;
        };
        let registered = self.lock().contains(&(Arc::as_ptr(&space) as usize));
        if !registered {
            return;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            space.notify(path);
        }));
        if result.is_err() {
            tracing::warn!(path, "notify panicked; notification dropped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<usize>> {
        match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
