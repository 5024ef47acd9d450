//! # pathspace-server
//!
//! The mount server: exposes subtrees of local [`PathSpace`]s as named
//! exports reachable over the wire protocol.
//!
//! - Sessions are minted by `MountOpen`, bounded by leases, and renewed by
//!   heartbeats; an expired or dropped session closes its notification
//!   stream and cancels its subscriptions.
//! - Capabilities gate `insert` and `take`; the export's allow-list is
//!   intersected with the request, with `{read, wait}` as the default set
//!   and `read` as the floor.
//! - Local mutations are observed by interposing a [`NotificationSink`] on
//!   each exported space's context; matching subscriptions get a one-shot
//!   notification and the owning session's bounded stream gets a copy.
//! - Per-session request throttling uses a continuous credit model, and
//!   per-session waiter slots are reserved against a shared throttle state.
//!
//! [`PathSpace`]: pathspace_space::PathSpace
//! [`NotificationSink`]: pathspace_space::NotificationSink

mod diag;
mod server;
mod stream;

pub use server::MountServer;
pub use stream::SessionStream;

use std::sync::Arc;
use std::time::Duration;

use pathspace_space::PathSpace;
use pathspace_wire::PayloadCompatibility;

/// Capability name for reads.
pub const CAP_READ: &str = "read";
/// Capability name for wait subscriptions.
pub const CAP_WAIT: &str = "wait";
/// Capability name for inserts.
pub const CAP_INSERT: &str = "insert";
/// Capability name for takes.
pub const CAP_TAKE: &str = "take";

/// Per-session throttle configuration for an export.
#[derive(Clone, Debug)]
pub struct ThrottleOptions {
    /// Enable the request-rate throttle.
    pub enabled: bool,
    /// Requests allowed per window; 0 disables the rate throttle.
    pub max_requests_per_window: u32,
    /// Length of the credit window.
    pub request_window: Duration,
    /// Lower bound on an imposed throttle sleep.
    pub penalty_increment: Duration,
    /// Upper bound on an imposed throttle sleep.
    pub penalty_cap: Duration,
    /// Concurrent waiter slots per session; 0 means unlimited.
    pub max_waiters_per_session: u32,
    /// Retry hint returned with `too_many_waiters`.
    pub wait_retry_after: Duration,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests_per_window: 0,
            request_window: Duration::from_millis(100),
            penalty_increment: Duration::from_millis(5),
            penalty_cap: Duration::from_millis(250),
            max_waiters_per_session: 0,
            wait_retry_after: Duration::from_millis(500),
        }
    }
}

/// One exported subtree.
#[derive(Clone)]
pub struct ExportOptions {
    /// Short name clients mount by.
    pub alias: String,
    /// Absolute path prefix this alias exposes.
    pub export_root: String,
    /// The space backing the export.
    pub space: Option<Arc<PathSpace>>,
    /// Capability allow-list; empty means `{read, wait}`.
    pub capabilities: Vec<String>,
    /// Free-form note surfaced in diagnostics.
    pub access_hint: String,
    /// Throttle configuration applied to each session of this export.
    pub throttle: ThrottleOptions,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            alias: String::new(),
            export_root: String::new(),
            space: None,
            capabilities: vec![CAP_READ.to_string(), CAP_WAIT.to_string()],
            access_hint: String::new(),
            throttle: ThrottleOptions::default(),
        }
    }
}

/// Server-wide configuration.
#[derive(Clone)]
pub struct ServerOptions {
    /// Exported subtrees.
    pub exports: Vec<ExportOptions>,
    /// Space receiving server metrics, if any.
    pub metrics_space: Option<Arc<PathSpace>>,
    /// Root path for metrics publication.
    pub metrics_root: String,
    /// Space receiving ACL diagnostics, if any.
    pub diagnostics_space: Option<Arc<PathSpace>>,
    /// Root path for ACL diagnostic events.
    pub diagnostics_root: String,
    /// Session lease length.
    pub lease_duration: Duration,
    /// Heartbeat interval handed to clients on mount open.
    pub heartbeat_interval: Duration,
    /// Legacy payload decoding override; `None` reads the environment.
    pub payload_compatibility: Option<PayloadCompatibility>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            exports: Vec::new(),
            metrics_space: None,
            metrics_root: "/inspector/metrics/remotes".to_string(),
            diagnostics_space: None,
            diagnostics_root: "/diagnostics/web/inspector/acl".to_string(),
            lease_duration: Duration::from_millis(15_000),
            heartbeat_interval: Duration::from_millis(2_500),
            payload_compatibility: None,
        }
    }
}
