//! Path-keyed condition variables for block-wait coordination.
//!
//! Waiters park on a concrete path; notifiers wake either one concrete path
//! or every registered path matching a glob pattern. Wakeups are advisory:
//! the waiter re-checks its own condition after every wake, and spurious
//! wakeups are permitted.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use pathspace_types::path as path_util;

type CvMap = HashMap<String, Arc<Condvar>>;

/// Coordinator of path-keyed condition variables.
#[derive(Default)]
pub struct WaitMap {
    state: Mutex<CvMap>,
}

/// Scoped wait handle holding the coordinator lock.
///
/// The lock is held between [`WaitMap::wait`] and the first
/// [`WaitGuard::wait_until`], so a notification arriving after the caller
/// checked its condition cannot be lost. On wake the lock is reacquired.
pub struct WaitGuard<'a> {
    path: String,
    guard: Option<MutexGuard<'a, CvMap>>,
}

impl WaitMap {
    /// Create an empty wait map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin waiting on a concrete path.
    pub fn wait(&self, path: &str) -> WaitGuard<'_> {
        let guard = lock_state(&self.state);
        WaitGuard {
            path: path.to_string(),
            guard: Some(guard),
        }
    }

    /// Wake all waiters for a concrete path, or for every registered path
    /// matching a glob pattern.
    pub fn notify(&self, path: &str) {
        let state = lock_state(&self.state);
        if !path_util::is_glob(path) {
            if let Some(cv) = state.get(path) {
                cv.notify_all();
            }
            return;
        }
        for (registered, cv) in state.iter() {
            if path_util::glob_match(path, registered) {
                cv.notify_all();
            }
        }
    }

    /// Wake every registered waiter (shutdown).
    pub fn notify_all(&self) {
        let state = lock_state(&self.state);
        for cv in state.values() {
            cv.notify_all();
        }
    }

    /// Drop all registered condition variables.
    pub fn clear(&self) {
        lock_state(&self.state).clear();
    }
}

impl WaitGuard<'_> {
    /// Park until notified or until the deadline passes.
    ///
    /// Returns `true` when the deadline elapsed without a notification. The
    /// coordinator lock is reacquired before returning.
    pub fn wait_until(&mut self, deadline: Instant) -> bool {
        let now = Instant::now();
        let Some(mut guard) = self.guard.take() else {
            return true;
        };
        if now >= deadline {
            self.guard = Some(guard);
            return true;
        }
        let cv = Arc::clone(guard.entry(self.path.clone()).or_default());
        match cv.wait_timeout(guard, deadline - now) {
            Ok((reacquired, timeout)) => {
                self.guard = Some(reacquired);
                timeout.timed_out()
            }
            Err(poisoned) => {
                let (reacquired, timeout) = poisoned.into_inner();
                self.guard = Some(reacquired);
                timeout.timed_out()
            }
        }
    }
}

fn lock_state(state: &Mutex<CvMap>) -> MutexGuard<'_, CvMap> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_wait_times_out_without_notify() {
        let map = WaitMap::new();
        let mut guard = map.wait("/data/x");
        let start = Instant::now();
        let timed_out = guard.wait_until(Instant::now() + Duration::from_millis(30));
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_concrete_notify_wakes_waiter() {
        let map = Arc::new(WaitMap::new());
        let woke = Arc::new(AtomicBool::new(false));
        let waiter = {
            let map = Arc::clone(&map);
            let woke = Arc::clone(&woke);
            std::thread::spawn(move || {
                let mut guard = map.wait("/data/x");
                let timed_out = guard.wait_until(Instant::now() + Duration::from_secs(5));
                woke.store(!timed_out, Ordering::SeqCst);
            })
        };
        // Give the waiter a moment to park.
        std::thread::sleep(Duration::from_millis(50));
        map.notify("/data/x");
        waiter.join().expect("waiter thread");
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn test_glob_notify_wakes_matching_paths() {
        let map = Arc::new(WaitMap::new());
        let woke = Arc::new(AtomicBool::new(false));
        let waiter = {
            let map = Arc::clone(&map);
            let woke = Arc::clone(&woke);
            std::thread::spawn(move || {
                let mut guard = map.wait("/data/items/a");
                let timed_out = guard.wait_until(Instant::now() + Duration::from_secs(5));
                woke.store(!timed_out, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        map.notify("/data/items/*");
        waiter.join().expect("waiter thread");
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn test_glob_notify_ignores_non_matching() {
        let map = WaitMap::new();
        {
            let mut guard = map.wait("/other/path");
            // Register the path, then release the lock via timeout.
            let _ = guard.wait_until(Instant::now());
        }
        // Notifying a non-matching glob must not panic or wake anything.
        map.notify("/data/**");
    }

    #[test]
    fn test_notify_all_wakes_everyone() {
        let map = Arc::new(WaitMap::new());
        let mut handles = Vec::new();
        for index in 0..3 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                let path = format!("/n/{index}");
                let mut guard = map.wait(&path);
                !guard.wait_until(Instant::now() + Duration::from_secs(5))
            }));
        }
        std::thread::sleep(Duration::from_millis(60));
        map.notify_all();
        for handle in handles {
            assert!(handle.join().expect("waiter thread"));
        }
    }
}
