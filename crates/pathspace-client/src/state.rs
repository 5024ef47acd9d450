//! Per-mount state shared between the manager, its worker threads, and the
//! grafted leaf.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pathspace_space::PathSpace;
use pathspace_types::Error;
use pathspace_wire::{Notification, ValuePayload};

use crate::{MirrorMode, MirrorTarget, MountOptions, RemoteSession};

/// Health and counters of one mount, as reported by
/// [`MountManager::statuses`](crate::MountManager::statuses).
#[derive(Clone, Debug, Default)]
pub struct MountStatus {
    pub alias: String,
    pub connected: bool,
    pub message: String,
    pub last_latency: Duration,
    pub average_latency: Duration,
    pub max_latency: Duration,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u64,
    pub waiter_depth: u64,
    pub max_waiter_depth: u64,
    pub queued_notifications: u64,
    pub dropped_notifications: u64,
    pub throttled: bool,
    pub retry_after_hint: Duration,
}

pub(crate) struct StatusInner {
    pub status: MountStatus,
    pub total_latency_ms: u64,
    pub heartbeat_sequence: u64,
}

/// One-shot rendezvous between a blocked caller and the notification loop.
pub(crate) struct PendingWaiter {
    state: Mutex<WaiterState>,
    cv: Condvar,
}

struct WaiterState {
    notification: Option<Notification>,
    error: Option<Error>,
    completed: bool,
}

pub(crate) enum WaitVerdict {
    Completed(Notification),
    Failed(Error),
    /// Completed without a notification payload.
    Empty,
    TimedOut,
}

impl PendingWaiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState {
                notification: None,
                error: None,
                completed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Fill the waiter with a delivered notification and wake the caller.
    pub fn complete(&self, notification: Notification) {
        {
            let mut state = lock_waiter(&self.state);
            state.notification = Some(notification);
            state.completed = true;
        }
        self.cv.notify_all();
    }

    /// Fail the waiter and wake the caller.
    pub fn fail(&self, error: Error) {
        {
            let mut state = lock_waiter(&self.state);
            state.error = Some(error);
            state.completed = true;
        }
        self.cv.notify_all();
    }

    /// Park until completion, a stop request, or the deadline.
    ///
    /// `deadline` of `None` waits indefinitely. `stop` is re-checked on
    /// every wake so shutdown releases parked callers promptly.
    pub fn wait(&self, deadline: Option<Instant>, stop: &AtomicBool) -> WaitVerdict {
        let mut state = lock_waiter(&self.state);
        loop {
            if stop.load(std::sync::atomic::Ordering::SeqCst) {
                return WaitVerdict::Failed(Error::Timeout("Remote mount stopping".into()));
            }
            if state.completed {
                if let Some(error) = state.error.take() {
                    return WaitVerdict::Failed(error);
                }
                return match state.notification.take() {
                    Some(notification) => WaitVerdict::Completed(notification),
                    None => WaitVerdict::Empty,
                };
            }
            let wait_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitVerdict::TimedOut;
                    }
                    deadline - now
                }
                // Wake periodically to observe the stop flag.
                None => Duration::from_millis(100),
            };
            state = match self.cv.wait_timeout(state, wait_for) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

fn lock_waiter(state: &Mutex<WaiterState>) -> MutexGuard<'_, WaiterState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A scheduled mirror of one remote subtree.
pub(crate) struct MirrorAssignment {
    pub mode: MirrorMode,
    pub target: MirrorTarget,
    pub target_space: Arc<PathSpace>,
    pub remote_root: String,
    pub local_root: String,
    pub max_depth: usize,
    pub max_children: usize,
    pub max_nodes: usize,
    pub interval: Duration,
    pub last_child: String,
    pub next_run: Instant,
}

pub(crate) struct SessionHandle {
    pub session: Option<Arc<dyn RemoteSession>>,
    pub session_id: String,
    pub heartbeat_interval: Duration,
    pub lease_expires_ms: u64,
}

#[derive(Default)]
pub(crate) struct ThreadHandles {
    pub heartbeat: Option<JoinHandle<()>>,
    pub notification: Option<JoinHandle<()>>,
    pub mirror: Option<JoinHandle<()>>,
}

/// Everything one mount owns; worker threads hold `Arc<MountState>` clones
/// and observe `stop_requested` between sleeps.
pub(crate) struct MountState {
    pub options: MountOptions,
    pub normalized_export_root: String,
    pub mount_path: String,
    pub stop_requested: AtomicBool,
    pub session: Mutex<SessionHandle>,
    pub status: Mutex<StatusInner>,
    pub cached_takes: Mutex<HashMap<String, VecDeque<ValuePayload>>>,
    pub waiters: Mutex<HashMap<String, Arc<PendingWaiter>>>,
    pub mirrors: Mutex<Vec<MirrorAssignment>>,
    pub threads: Mutex<ThreadHandles>,
    pub mounted: AtomicBool,
}

impl MountState {
    pub fn new(options: MountOptions) -> Self {
        let alias = options.alias.clone();
        Self {
            options,
            normalized_export_root: String::new(),
            mount_path: String::new(),
            stop_requested: AtomicBool::new(false),
            session: Mutex::new(SessionHandle {
                session: None,
                session_id: String::new(),
                heartbeat_interval: crate::manager::DEFAULT_HEARTBEAT,
                lease_expires_ms: 0,
            }),
            status: Mutex::new(StatusInner {
                status: MountStatus {
                    alias,
                    ..MountStatus::default()
                },
                total_latency_ms: 0,
                heartbeat_sequence: 0,
            }),
            cached_takes: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            mirrors: Mutex::new(Vec::new()),
            threads: Mutex::new(ThreadHandles::default()),
            mounted: AtomicBool::new(false),
        }
    }
}
