//! Per-session notification streams with bounded queues and throttling.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pathspace_types::{Error, Expected};
use pathspace_wire::Notification;

/// Pending depth at which a stream flips into the throttled state.
pub const THROTTLE_THRESHOLD: usize = 128;

/// Hard cap on pending notifications; older entries are dropped beyond it.
pub const MAX_QUEUE: usize = 1024;

/// How long a throttled stream stays throttled after crossing the threshold.
pub const THROTTLE_WINDOW: Duration = Duration::from_millis(250);

struct StreamState {
    pending: VecDeque<Notification>,
    dropped: u64,
    closed: bool,
    throttled: bool,
    throttle_until: Instant,
}

/// Snapshot of queue health after an enqueue.
pub struct EnqueueOutcome {
    /// Pending depth after the enqueue (and any drops).
    pub pending: usize,
    /// Total notifications dropped over the stream's lifetime.
    pub dropped: u64,
    /// True when this enqueue left the stream throttled.
    pub throttled: bool,
}

/// Result of draining a stream.
pub struct DrainOutcome {
    /// Drained batch, oldest first.
    pub notifications: Vec<Notification>,
    /// Pending depth left behind.
    pub pending: usize,
    /// True when this drain cleared the throttled state.
    pub cleared_throttle: bool,
}

/// Bounded FIFO of notifications for one session.
///
/// Shared between the server's stream map and the interposed notification
/// sink. The condition variable implements the server-side park for
/// `NotificationStream` requests.
pub struct SessionStream {
    alias: String,
    state: Mutex<StreamState>,
    cv: Condvar,
}

impl SessionStream {
    /// Create an open stream for a session of `alias`.
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            state: Mutex::new(StreamState {
                pending: VecDeque::new(),
                dropped: 0,
                closed: false,
                throttled: false,
                throttle_until: Instant::now(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Alias of the export this stream's session belongs to.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Append a notification, enforcing the hard cap and the throttle
    /// threshold. Returns `None` when the stream is already closed.
    pub fn enqueue(&self, notification: Notification) -> Option<EnqueueOutcome> {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            state.pending.push_back(notification);
            if state.pending.len() > MAX_QUEUE {
                let overflow = state.pending.len() - MAX_QUEUE;
                state.dropped += overflow as u64;
                while state.pending.len() > MAX_QUEUE {
                    state.pending.pop_front();
                }
            }
            let pending = state.pending.len();
            if pending >= THROTTLE_THRESHOLD {
                state.throttled = true;
                state.throttle_until = Instant::now() + THROTTLE_WINDOW;
            }
            EnqueueOutcome {
                pending,
                dropped: state.dropped,
                throttled: state.throttled,
            }
        };
        self.cv.notify_one();
        Some(outcome)
    }

    /// Park until pending is non-empty, the stream closes, or `timeout`
    /// elapses; then drain up to `max_batch` notifications.
    ///
    /// A timeout yields an empty batch; a closed stream yields
    /// `InvalidPermissions`.
    pub fn drain(&self, timeout: Duration, max_batch: usize) -> Expected<DrainOutcome> {
        let max_batch = max_batch.max(1);
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(Error::InvalidPermissions("session closed".into()));
            }
            if !state.pending.is_empty() {
                break;
            }
            let Some(deadline) = deadline else {
                return Ok(DrainOutcome {
                    notifications: Vec::new(),
                    pending: 0,
                    cleared_throttle: false,
                });
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(DrainOutcome {
                    notifications: Vec::new(),
                    pending: 0,
                    cleared_throttle: false,
                });
            }
            state = match self.cv.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        let batch = max_batch.min(state.pending.len());
        let notifications: Vec<Notification> = state.pending.drain(..batch).collect();
        let pending = state.pending.len();
        let mut cleared = false;
        if state.throttled
            && Instant::now() >= state.throttle_until
            && pending < THROTTLE_THRESHOLD
        {
            state.throttled = false;
            cleared = true;
        }
        Ok(DrainOutcome {
            notifications,
            pending,
            cleared_throttle: cleared,
        })
    }

    /// Remaining throttle window, when the stream is currently throttled.
    pub fn throttle_retry_after(&self) -> Option<Duration> {
        let state = self.lock();
        if !state.throttled {
            return None;
        }
        let now = Instant::now();
        if now >= state.throttle_until {
            return None;
        }
        Some(state.throttle_until - now)
    }

    /// Close the stream and wake every parked consumer.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
        }
        self.cv.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str) -> Notification {
        Notification {
            subscription_id: id.to_string(),
            path: "/data/x".to_string(),
            version: 1,
            ..Notification::default()
        }
    }

    #[test]
    fn test_enqueue_then_drain_fifo() {
        let stream = SessionStream::new("demo");
        stream.enqueue(note("a")).expect("open");
        stream.enqueue(note("b")).expect("open");
        let drained = stream
            .drain(Duration::from_millis(10), 8)
            .expect("drain");
        let ids: Vec<&str> = drained
            .notifications
            .iter()
            .map(|n| n.subscription_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(drained.pending, 0);
    }

    #[test]
    fn test_drain_respects_batch_size() {
        let stream = SessionStream::new("demo");
        for index in 0..5 {
            stream.enqueue(note(&format!("n{index}"))).expect("open");
        }
        let drained = stream.drain(Duration::from_millis(10), 2).expect("drain");
        assert_eq!(drained.notifications.len(), 2);
        assert_eq!(drained.pending, 3);
    }

    #[test]
    fn test_timeout_returns_empty_batch() {
        let stream = SessionStream::new("demo");
        let drained = stream.drain(Duration::from_millis(20), 4).expect("drain");
        assert!(drained.notifications.is_empty());
    }

    #[test]
    fn test_closed_stream_errors() {
        let stream = SessionStream::new("demo");
        stream.close();
        assert!(stream.drain(Duration::from_millis(5), 4).is_err());
        assert!(stream.enqueue(note("late")).is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let stream = SessionStream::new("demo");
        for index in 0..(MAX_QUEUE + 10) {
            stream.enqueue(note(&format!("n{index}"))).expect("open");
        }
        let outcome = stream.enqueue(note("last")).expect("open");
        assert_eq!(outcome.pending, MAX_QUEUE);
        assert_eq!(outcome.dropped, 11);
        let drained = stream.drain(Duration::from_millis(10), 1).expect("drain");
        // The oldest surviving entry is the 12th enqueued.
        assert_eq!(drained.notifications[0].subscription_id, "n11");
    }

    #[test]
    fn test_threshold_sets_throttle() {
        let stream = SessionStream::new("demo");
        for index in 0..THROTTLE_THRESHOLD {
            stream.enqueue(note(&format!("n{index}"))).expect("open");
        }
        assert!(stream.throttle_retry_after().is_some());
    }

    #[test]
    fn test_enqueue_wakes_parked_consumer() {
        let stream = std::sync::Arc::new(SessionStream::new("demo"));
        let consumer = {
            let stream = std::sync::Arc::clone(&stream);
            std::thread::spawn(move || stream.drain(Duration::from_secs(5), 4))
        };
        std::thread::sleep(Duration::from_millis(50));
        stream.enqueue(note("wake")).expect("open");
        let drained = consumer.join().expect("consumer").expect("drain");
        assert_eq!(drained.notifications.len(), 1);
    }
}
