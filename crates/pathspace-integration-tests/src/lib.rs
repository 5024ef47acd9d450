//! Shared fixtures for the end-to-end mount tests.

use std::sync::Arc;
use std::time::Duration;

use pathspace_client::{ManagerOptions, MountManager, MountOptions, SessionFactory};
use pathspace_server::{ExportOptions, MountServer, ServerOptions, ThrottleOptions};
use pathspace_space::PathSpace;
use pathspace_transport::LoopbackSessionFactory;
use pathspace_wire::{AuthContext, CapabilityRequest, PayloadCompatibility};

/// Auth context used by every test client.
pub fn test_auth() -> AuthContext {
    AuthContext {
        subject: "C=US/CN=client".into(),
        proof: "sha256:abc".into(),
        fingerprint: "sha256:abc".into(),
        ..AuthContext::default()
    }
}

/// The standard capability set.
pub fn full_capabilities() -> Vec<CapabilityRequest> {
    ["read", "wait", "insert", "take"]
        .into_iter()
        .map(CapabilityRequest::named)
        .collect()
}

/// A server exporting `/data` as alias `demo` plus a loopback-mounted
/// client manager with its own root and metrics spaces.
pub struct Harness {
    pub server_space: Arc<PathSpace>,
    pub client_space: Arc<PathSpace>,
    pub metrics_space: Arc<PathSpace>,
    pub server: Arc<MountServer>,
    pub manager: MountManager,
}

impl Harness {
    /// Build and start a harness with the default 15 s lease / 2.5 s
    /// heartbeat and the given per-session throttle.
    pub fn start(throttle: ThrottleOptions) -> Self {
        Self::start_with(throttle, |_| {})
    }

    /// Build and start a harness, letting the caller adjust the server
    /// options before construction.
    pub fn start_with(
        throttle: ThrottleOptions,
        tweak: impl FnOnce(&mut ServerOptions),
    ) -> Self {
        let server_space = PathSpace::new();
        let client_space = PathSpace::new();
        let metrics_space = PathSpace::new();

        let mut server_options = ServerOptions {
            exports: vec![ExportOptions {
                alias: "demo".into(),
                export_root: "/data".into(),
                space: Some(Arc::clone(&server_space)),
                capabilities: vec![
                    "read".into(),
                    "wait".into(),
                    "insert".into(),
                    "take".into(),
                ],
                throttle,
                ..ExportOptions::default()
            }],
            lease_duration: Duration::from_secs(15),
            heartbeat_interval: Duration::from_millis(2500),
            payload_compatibility: Some(PayloadCompatibility::TypedOnly),
            ..ServerOptions::default()
        };
        tweak(&mut server_options);
        let server = MountServer::new(server_options);

        let factory: Arc<dyn SessionFactory> =
            Arc::new(LoopbackSessionFactory::new(Arc::clone(&server)));
        let manager = MountManager::new(
            ManagerOptions {
                root_space: Some(Arc::clone(&client_space)),
                metrics_space: Some(Arc::clone(&metrics_space)),
                mounts: vec![MountOptions {
                    alias: "demo".into(),
                    export_root: "/data".into(),
                    capabilities: full_capabilities(),
                    auth: test_auth(),
                    use_tls: false,
                    mirrors: Vec::new(),
                    ..MountOptions::default()
                }],
                payload_compatibility: Some(PayloadCompatibility::TypedOnly),
                ..ManagerOptions::default()
            },
            factory,
        );
        manager.start();

        Self {
            server_space,
            client_space,
            metrics_space,
            server,
            manager,
        }
    }
}
