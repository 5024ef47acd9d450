//! # pathspace-client
//!
//! The mount client: grafts remote exports into a local
//! [`PathSpace`](pathspace_space::PathSpace) and keeps them alive.
//!
//! For every configured mount the [`MountManager`] inserts a remote-mount
//! leaf at the mount path (default `/remote/<alias>`), opens a session
//! through a [`SessionFactory`], and runs three background threads:
//!
//! - a **heartbeat** thread renewing the session lease,
//! - a **notification** thread draining the server's per-session stream and
//!   waking pending in-process waiters,
//! - a **mirror** thread copying configured remote subtrees into local
//!   spaces (append-only or tree-snapshot).
//!
//! Reads, takes, and block-waits on paths under the mount path are
//! translated into wire requests; multi-item take responses are cached per
//! remote path so subsequent takes pop locally.

mod manager;
mod mirror;
mod state;

pub use manager::MountManager;
pub use state::MountStatus;

use std::sync::Arc;
use std::time::Duration;

use pathspace_space::PathSpace;
use pathspace_types::Expected;
use pathspace_wire::{
    AuthContext, CapabilityRequest, Heartbeat, InsertRequest, InsertResponse, MountOpenRequest,
    MountOpenResponse, Notification, PayloadCompatibility, ReadRequest, ReadResponse, TakeRequest,
    TakeResponse, WaitSubscribeAck, WaitSubscribeRequest,
};

/// One authenticated session against a mount server.
///
/// Implementations are connection-scoped per request: each RPC may open a
/// fresh transport connection, exchange one frame pair, and close.
pub trait RemoteSession: Send + Sync {
    /// Perform the mount handshake.
    fn open(&self, request: &MountOpenRequest) -> Expected<MountOpenResponse>;
    /// Read a node.
    fn read(&self, request: &ReadRequest) -> Expected<ReadResponse>;
    /// Insert a value.
    fn insert(&self, request: &InsertRequest) -> Expected<InsertResponse>;
    /// Pop values.
    fn take(&self, request: &TakeRequest) -> Expected<TakeResponse>;
    /// Register a one-shot wait subscription.
    fn wait_subscribe(&self, request: &WaitSubscribeRequest) -> Expected<WaitSubscribeAck>;
    /// Poll one subscription for its next notification.
    ///
    /// Implementations typically route through [`RemoteSession::stream_notifications`]
    /// with a batch of one, so stream ordering semantics apply here too.
    fn next_notification(
        &self,
        subscription_id: &str,
        timeout: Duration,
    ) -> Expected<Option<Notification>>;
    /// Drain the session's notification stream in batches.
    fn stream_notifications(
        &self,
        session_id: &str,
        timeout: Duration,
        max_batch: usize,
    ) -> Expected<Vec<Notification>>;
    /// Renew the session lease.
    fn heartbeat(&self, heartbeat: &Heartbeat) -> Expected<()>;
}

/// Creates sessions for configured mounts.
pub trait SessionFactory: Send + Sync {
    /// Create a session for the given mount configuration.
    fn create(&self, options: &MountOptions) -> Expected<Arc<dyn RemoteSession>>;
}

/// TLS configuration for outbound mount connections.
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    /// CA bundle used to verify the server chain.
    pub ca_cert_path: String,
    /// Client certificate presented for mutual TLS.
    pub client_cert_path: String,
    /// Private key matching the client certificate.
    pub client_key_path: String,
    /// SNI host, when different from the dial host.
    pub sni_host: String,
    /// Disable only for tests against self-signed servers.
    pub verify_server_certificate: bool,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: String::new(),
            client_cert_path: String::new(),
            client_key_path: String::new(),
            sni_host: String::new(),
            verify_server_certificate: true,
            connect_timeout: Duration::from_millis(2000),
        }
    }
}

/// Where a mirror writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorTarget {
    /// The manager's root space.
    RootSpace,
    /// The manager's metrics space.
    MetricsSpace,
}

/// How a mirror copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorMode {
    /// Copy only children lexicographically after the last one copied.
    AppendOnly,
    /// Breadth-first snapshot of the subtree each cycle.
    TreeSnapshot,
}

/// One configured mirror of a remote subtree.
#[derive(Clone, Debug)]
pub struct MirrorOptions {
    pub mode: MirrorMode,
    pub target: MirrorTarget,
    /// Remote subtree root; `{alias}` expands to the mount alias.
    pub remote_root: String,
    /// Local destination root; empty mirrors to the remote root path.
    pub local_root: String,
    /// Depth budget for tree snapshots.
    pub max_depth: usize,
    /// Children enumerated per node.
    pub max_children: usize,
    /// Overall node budget per cycle.
    pub max_nodes: usize,
    /// Delay between cycles.
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            mode: MirrorMode::TreeSnapshot,
            target: MirrorTarget::RootSpace,
            remote_root: String::new(),
            local_root: String::new(),
            max_depth: 4,
            max_children: pathspace_space::space::DEFAULT_MAX_CHILDREN,
            max_nodes: 256,
            interval: Duration::from_millis(500),
            enabled: true,
        }
    }
}

/// Configuration of one remote mount.
#[derive(Clone)]
pub struct MountOptions {
    /// Export alias on the server.
    pub alias: String,
    /// Export root the server must confirm.
    pub export_root: String,
    /// Local graft point; empty means `/remote/<alias>`.
    pub mount_path: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Dial with TLS (disable only for in-process loopback factories).
    pub use_tls: bool,
    /// Client identifier sent on mount open.
    pub client_id: String,
    /// Capabilities requested on mount open.
    pub capabilities: Vec<CapabilityRequest>,
    /// `max_items` for remote takes; clamped to `[1, 64]`.
    pub take_batch_size: u32,
    /// Authentication presented on mount open; the transport fills
    /// certificate-derived fields that are left empty.
    pub auth: AuthContext,
    /// TLS settings; falls back to the factory default when `None`.
    pub tls: Option<TlsClientConfig>,
    /// Mirrors for this mount.
    pub mirrors: Vec<MirrorOptions>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            alias: String::new(),
            export_root: String::new(),
            mount_path: String::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            use_tls: true,
            client_id: "pathspace-client".to_string(),
            capabilities: Vec::new(),
            take_batch_size: 4,
            auth: AuthContext::default(),
            tls: None,
            mirrors: Vec::new(),
        }
    }
}

/// Manager-wide configuration.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Space receiving the mount leaves and the diagnostics mirror.
    pub root_space: Option<Arc<PathSpace>>,
    /// Space receiving client metrics and the metrics mirror.
    pub metrics_space: Option<Arc<PathSpace>>,
    /// Root path for client metrics.
    pub metrics_root: String,
    /// Local root for the default diagnostics mirror.
    pub diagnostics_root: String,
    /// Configured mounts.
    pub mounts: Vec<MountOptions>,
    /// Legacy payload decoding override; `None` reads the environment.
    pub payload_compatibility: Option<PayloadCompatibility>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            root_space: None,
            metrics_space: None,
            metrics_root: "/inspector/metrics/remotes".to_string(),
            diagnostics_root: "/diagnostics/errors/live/remotes".to_string(),
            mounts: Vec::new(),
            payload_compatibility: None,
        }
    }
}
